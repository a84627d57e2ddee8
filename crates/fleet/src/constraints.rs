//! Hardware constraints and resolved hardware characteristics.
//!
//! Both types share the `key=value` text form used on the command line and
//! in logs, e.g. `arch=amd64 cpu-cores=1 cpu-power=100 mem=1740M`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Architectures a constraint may name.
pub const SUPPORTED_ARCHES: &[&str] = &["amd64", "i386", "armhf", "arm64", "ppc64el"];

/// Errors produced when parsing the text form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintParseError {
    /// Term is not of the form `key=value`.
    #[error("malformed constraint term {0:?}")]
    Malformed(String),

    /// Key is not a known attribute.
    #[error("unknown constraint {0:?}")]
    UnknownKey(String),

    /// Key given twice.
    #[error("constraint {0:?} specified more than once")]
    Duplicate(String),

    /// Value does not parse for its key.
    #[error("bad {key} value {value:?}")]
    BadValue { key: String, value: String },

    /// Hardware characteristics are missing a required attribute.
    #[error("hardware characteristics missing {0}")]
    Missing(&'static str),
}

/// A partial hardware specification. Unset fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Constraint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Minimum memory in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_cores: Option<u64>,
    /// Minimum CPU power in backend-relative units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_power: Option<u64>,
    /// Minimum root disk in MB.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk: Option<u64>,
}

impl Constraint {
    /// Constraint with every field unset.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Whether no field is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Set the architecture.
    #[must_use]
    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    /// Set the minimum memory in MB.
    #[must_use]
    pub fn with_mem(mut self, mem: u64) -> Self {
        self.mem = Some(mem);
        self
    }

    /// Set the minimum core count.
    #[must_use]
    pub fn with_cpu_cores(mut self, cores: u64) -> Self {
        self.cpu_cores = Some(cores);
        self
    }

    /// Set the minimum CPU power.
    #[must_use]
    pub fn with_cpu_power(mut self, power: u64) -> Self {
        self.cpu_power = Some(power);
        self
    }

    /// Set the minimum root disk in MB.
    #[must_use]
    pub fn with_root_disk(mut self, disk: u64) -> Self {
        self.root_disk = Some(disk);
        self
    }
}

impl FromStr for Constraint {
    type Err = ConstraintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut attrs = Attrs::default();
        attrs.parse(s)?;
        Ok(Self {
            arch: attrs.arch,
            mem: attrs.mem,
            cpu_cores: attrs.cpu_cores,
            cpu_power: attrs.cpu_power,
            root_disk: attrs.root_disk,
        })
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_attrs(
            f,
            self.arch.as_deref(),
            self.cpu_cores,
            self.cpu_power,
            self.mem,
            self.root_disk,
        )
    }
}

/// Hardware actually obtained for an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HardwareCharacteristics {
    pub arch: String,
    /// Memory in MB.
    pub mem: u64,
    pub cpu_cores: u64,
    pub cpu_power: u64,
    /// Root disk in MB, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_disk: Option<u64>,
}

impl HardwareCharacteristics {
    /// Whether these characteristics satisfy every field set in `constraint`.
    #[must_use]
    pub fn satisfies(&self, constraint: &Constraint) -> bool {
        constraint.arch.as_ref().is_none_or(|a| *a == self.arch)
            && constraint.mem.is_none_or(|m| self.mem >= m)
            && constraint.cpu_cores.is_none_or(|c| self.cpu_cores >= c)
            && constraint.cpu_power.is_none_or(|p| self.cpu_power >= p)
            && constraint
                .root_disk
                .is_none_or(|d| self.root_disk.is_some_and(|have| have >= d))
    }
}

impl FromStr for HardwareCharacteristics {
    type Err = ConstraintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut attrs = Attrs::default();
        attrs.parse(s)?;
        Ok(Self {
            arch: attrs.arch.ok_or(ConstraintParseError::Missing("arch"))?,
            mem: attrs.mem.ok_or(ConstraintParseError::Missing("mem"))?,
            cpu_cores: attrs
                .cpu_cores
                .ok_or(ConstraintParseError::Missing("cpu-cores"))?,
            cpu_power: attrs
                .cpu_power
                .ok_or(ConstraintParseError::Missing("cpu-power"))?,
            root_disk: attrs.root_disk,
        })
    }
}

impl fmt::Display for HardwareCharacteristics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_attrs(
            f,
            Some(&self.arch),
            Some(self.cpu_cores),
            Some(self.cpu_power),
            Some(self.mem),
            self.root_disk,
        )
    }
}

#[derive(Default)]
struct Attrs {
    arch: Option<String>,
    mem: Option<u64>,
    cpu_cores: Option<u64>,
    cpu_power: Option<u64>,
    root_disk: Option<u64>,
    seen: Vec<String>,
}

impl Attrs {
    fn parse(&mut self, s: &str) -> Result<(), ConstraintParseError> {
        for term in s.split_whitespace() {
            let (key, value) = term
                .split_once('=')
                .ok_or_else(|| ConstraintParseError::Malformed(term.to_string()))?;
            if self.seen.iter().any(|k| k == key) {
                return Err(ConstraintParseError::Duplicate(key.to_string()));
            }
            self.seen.push(key.to_string());

            // An empty value leaves the attribute unset.
            if value.is_empty() {
                continue;
            }
            match key {
                "arch" => {
                    if !SUPPORTED_ARCHES.contains(&value) {
                        return Err(bad_value(key, value));
                    }
                    self.arch = Some(value.to_string());
                }
                "mem" => self.mem = Some(parse_size(key, value)?),
                "root-disk" => self.root_disk = Some(parse_size(key, value)?),
                "cpu-cores" => self.cpu_cores = Some(parse_count(key, value)?),
                "cpu-power" => self.cpu_power = Some(parse_count(key, value)?),
                _ => return Err(ConstraintParseError::UnknownKey(key.to_string())),
            }
        }
        Ok(())
    }
}

fn bad_value(key: &str, value: &str) -> ConstraintParseError {
    ConstraintParseError::BadValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_count(key: &str, value: &str) -> Result<u64, ConstraintParseError> {
    value.parse().map_err(|_| bad_value(key, value))
}

/// Parse a size in MB, accepting an optional `M`/`G`/`T`/`P` suffix.
fn parse_size(key: &str, value: &str) -> Result<u64, ConstraintParseError> {
    let (digits, multiplier) = match value.char_indices().last() {
        Some((i, 'M')) => (&value[..i], 1),
        Some((i, 'G')) => (&value[..i], 1024),
        Some((i, 'T')) => (&value[..i], 1024 * 1024),
        Some((i, 'P')) => (&value[..i], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let amount: f64 = digits.parse().map_err(|_| bad_value(key, value))?;
    if !amount.is_finite() || amount < 0.0 {
        return Err(bad_value(key, value));
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    let mb = (amount * multiplier as f64).ceil() as u64;
    Ok(mb)
}

fn write_attrs(
    f: &mut fmt::Formatter<'_>,
    arch: Option<&str>,
    cpu_cores: Option<u64>,
    cpu_power: Option<u64>,
    mem: Option<u64>,
    root_disk: Option<u64>,
) -> fmt::Result {
    let mut terms = Vec::new();
    if let Some(arch) = arch {
        terms.push(format!("arch={arch}"));
    }
    if let Some(cores) = cpu_cores {
        terms.push(format!("cpu-cores={cores}"));
    }
    if let Some(power) = cpu_power {
        terms.push(format!("cpu-power={power}"));
    }
    if let Some(mem) = mem {
        terms.push(format!("mem={mem}M"));
    }
    if let Some(disk) = root_disk {
        terms.push(format!("root-disk={disk}M"));
    }
    f.write_str(&terms.join(" "))
}
