//! Boot-time payloads for new instances.
//!
//! Every machine gets the base packages, the agent tools and a machine
//! agent. The bootstrap machine additionally initialises the environment
//! state and starts the coordinator. The coordinator is shipped with the
//! agent tools and launched by script, so its distribution package is
//! never installed on any machine.

use serde::{Deserialize, Serialize};

use crate::constraints::Constraint;
use crate::error::ProvisionError;
use crate::metadata::ToolsSpec;

/// Packages installed on every machine.
pub const BASE_PACKAGES: &[&str] = &["git", "curl", "cpu-checker", "bridge-utils"];

/// Distribution package of the coordination daemon. Never installed.
pub const COORDINATOR_PACKAGE: &str = "zookeeperd";

/// Name of the agent binary inside the tools tarball.
pub const AGENT_BINARY: &str = "fleetd";

/// Agent data directory on the instance.
pub const DATA_DIR: &str = "/var/lib/fleet";

/// Port the state server listens on.
pub const STATE_PORT: u16 = 37017;

/// Machine id of the bootstrap instance.
pub const BOOTSTRAP_MACHINE_ID: &str = "0";

/// Provisioning nonce of the bootstrap instance.
pub const BOOTSTRAP_NONCE: &str = "user-admin:bootstrap";

/// What a machine is started for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MachineRole {
    /// First control-plane machine; `constraint` is recorded in the
    /// initial environment state.
    Bootstrap { constraint: Constraint },
    /// Any other machine, pointed at the state servers.
    Regular { state_addresses: Vec<String> },
}

/// Inputs for one machine's payload.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub environment: String,
    pub machine_id: String,
    pub nonce: String,
    pub tools: ToolsSpec,
    pub role: MachineRole,
}

impl MachineConfig {
    /// Payload inputs for the bootstrap machine.
    #[must_use]
    pub fn bootstrap(environment: impl Into<String>, tools: ToolsSpec, constraint: Constraint) -> Self {
        Self {
            environment: environment.into(),
            machine_id: BOOTSTRAP_MACHINE_ID.to_string(),
            nonce: BOOTSTRAP_NONCE.to_string(),
            tools,
            role: MachineRole::Bootstrap { constraint },
        }
    }

    /// Payload inputs for a regular machine.
    #[must_use]
    pub fn regular(
        environment: impl Into<String>,
        machine_id: impl Into<String>,
        nonce: impl Into<String>,
        tools: ToolsSpec,
        state_addresses: Vec<String>,
    ) -> Self {
        Self {
            environment: environment.into(),
            machine_id: machine_id.into(),
            nonce: nonce.into(),
            tools,
            role: MachineRole::Regular { state_addresses },
        }
    }

    fn tools_dir(&self) -> String {
        format!(
            "{DATA_DIR}/tools/{}-{}-{}",
            self.tools.version, self.tools.series, self.tools.arch
        )
    }
}

/// A cloud-init document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudConfig {
    #[serde(default)]
    pub package_update: bool,
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub runcmd: Vec<String>,
}

impl CloudConfig {
    /// Build the payload for `machine`.
    #[must_use]
    pub fn for_machine(machine: &MachineConfig) -> Self {
        let mut config = Self {
            package_update: true,
            packages: BASE_PACKAGES.iter().map(ToString::to_string).collect(),
            runcmd: Vec::new(),
        };
        config.add_tools_install(machine);

        let agent = format!("{}/{AGENT_BINARY}", machine.tools_dir());
        match &machine.role {
            MachineRole::Bootstrap { constraint } => {
                config.runcmd.push(format!(
                    "{agent} coordinator start --data-dir {}",
                    shquote(&format!("{DATA_DIR}/coordinator"))
                ));
                config.runcmd.push(format!(
                    "{agent} bootstrap-state --data-dir {} --environment {} --constraints {}",
                    shquote(DATA_DIR),
                    shquote(&machine.environment),
                    shquote(&constraint.to_string())
                ));
                config.add_machine_agent(&agent, machine, &[format!("localhost:{STATE_PORT}")]);
            }
            MachineRole::Regular { state_addresses } => {
                let addrs: Vec<String> = state_addresses
                    .iter()
                    .map(|a| format!("{a}:{STATE_PORT}"))
                    .collect();
                config.add_machine_agent(&agent, machine, &addrs);
            }
        }
        config
    }

    fn add_tools_install(&mut self, machine: &MachineConfig) {
        let dir = machine.tools_dir();
        let tarball = format!("{dir}/tools.tar.gz");
        self.runcmd.push(format!("mkdir -p {}", shquote(&dir)));
        self.runcmd.push(format!(
            "curl -sSfL -o {} {}",
            shquote(&tarball),
            shquote(&machine.tools.url)
        ));
        if let Some(sha) = &machine.tools.sha256 {
            self.runcmd.push(format!(
                "echo {} | sha256sum -c -",
                shquote(&format!("{sha}  {tarball}"))
            ));
        }
        self.runcmd
            .push(format!("tar xzf {} -C {}", shquote(&tarball), shquote(&dir)));
    }

    fn add_machine_agent(&mut self, agent: &str, machine: &MachineConfig, state_addrs: &[String]) {
        self.runcmd.push(format!(
            "{agent} machine --data-dir {} --machine-id {} --nonce {} --state-addrs {}",
            shquote(DATA_DIR),
            shquote(&machine.machine_id),
            shquote(&machine.nonce),
            shquote(&state_addrs.join(","))
        ));
    }

    /// Whether `package` is installed.
    #[must_use]
    pub fn has_package(&self, package: &str) -> bool {
        self.packages.iter().any(|p| p == package)
    }

    /// Whether any boot script contains `needle`.
    #[must_use]
    pub fn has_script(&self, needle: &str) -> bool {
        self.runcmd.iter().any(|s| s.contains(needle))
    }

    /// Render as user data.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Config`] if the document cannot be encoded.
    pub fn render(&self) -> Result<String, ProvisionError> {
        let body = serde_yaml::to_string(self)
            .map_err(|e| ProvisionError::Config(format!("cannot render cloud-init: {e}")))?;
        Ok(format!("#cloud-config\n{body}"))
    }

    /// Parse rendered user data.
    ///
    /// # Errors
    /// Returns [`ProvisionError::Config`] if `user_data` is not a cloud-init
    /// document.
    pub fn parse(user_data: &str) -> Result<Self, ProvisionError> {
        serde_yaml::from_str(user_data)
            .map_err(|e| ProvisionError::Config(format!("invalid cloud-init: {e}")))
    }
}

/// Quote `s` for a POSIX shell.
fn shquote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}
