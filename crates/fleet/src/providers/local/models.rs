//! Local backend data models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hardware::InstanceType;
use crate::state::InstanceId;

/// Status of a newly launched instance unless overridden.
pub const DEFAULT_INITIAL_STATE: &str = "pending";

/// Fleet inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Inventory {
    /// Launch counter; the next instance gets this index.
    #[serde(default)]
    pub next_index: u32,
    #[serde(default)]
    pub instances: Vec<LocalInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Inventory {
    pub(crate) fn get(&self, id: &InstanceId) -> Option<&LocalInstance> {
        self.instances.iter().find(|i| &i.id == id)
    }
}

/// A simulated instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalInstance {
    pub id: InstanceId,
    pub index: u32,
    pub machine_id: String,
    pub instance_type: String,
    pub image_id: String,
    /// Root disk in MB.
    pub root_disk: u64,
    pub state: String,
    pub addresses: Vec<String>,
    pub user_data: String,
    pub launched_at: DateTime<Utc>,
}

/// Backend operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendOp {
    Launch,
    Terminate,
    ListInstanceTypes,
    InstanceState,
    ListInstances,
    InstanceAddresses,
}

/// Injected failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transient transport error.
    Unavailable,
    /// Fail with a rejected credential.
    Unauthorized,
    /// Never complete.
    Hang,
}

/// Instance types offered by default.
#[must_use]
pub fn default_catalog() -> Vec<InstanceType> {
    let it = |name: &str, mem, cpu_cores, cpu_power, cost| InstanceType {
        name: name.to_string(),
        arch: "amd64".to_string(),
        mem,
        cpu_cores,
        cpu_power,
        cost,
    };
    vec![
        it("m1.small", 1740, 1, 100, 60),
        it("m1.medium", 3840, 1, 200, 120),
        it("c1.medium", 1740, 2, 500, 145),
        it("m1.large", 7680, 2, 400, 240),
        it("m1.xlarge", 15360, 4, 800, 480),
    ]
}
