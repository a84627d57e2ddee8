//! Environment configuration.
//!
//! An environment is described by a YAML document naming its region,
//! storage bucket, metadata locations and backend-specific tables. Nothing
//! here is process-global: every component receives the values it needs
//! from an [`EnvironConfig`] explicitly.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::address::ScopeRules;
use crate::hardware::InstanceType;
use crate::retry::RetryConfig;

/// Series used when a request does not name one.
pub const DEFAULT_SERIES: &str = "precise";

/// Root disk size in MB when the constraint leaves it open.
pub const DEFAULT_ROOT_DISK_MB: u64 = 8192;

/// Configuration of one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EnvironConfig {
    /// Environment name.
    pub name: String,
    /// Backend region (e.g. "us-east-1").
    pub region: String,
    /// Backend API endpoint used to match image metadata.
    #[serde(default)]
    pub endpoint: String,
    /// Series for new instances.
    #[serde(default = "default_series")]
    pub default_series: String,
    /// URL of the environment's control bucket.
    #[serde(default)]
    pub control_bucket_url: String,
    /// Overrides the public image metadata location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_metadata_url: Option<String>,
    /// Agent version to install; newest available when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_version: Option<String>,
    /// Root disk size in MB when constraints leave it open.
    #[serde(default = "default_root_disk")]
    pub default_root_disk: u64,
    /// Deadline in seconds for each provisioning operation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_secs: Option<u64>,
    /// Instance type catalog offered by the local backend.
    #[serde(default)]
    pub instance_types: Vec<InstanceType>,
    /// Address scope table for the backend.
    #[serde(default = "ScopeRules::standard")]
    pub scope_rules: ScopeRules,
    /// Retry policy for external calls.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_series() -> String {
    DEFAULT_SERIES.to_string()
}

fn default_root_disk() -> u64 {
    DEFAULT_ROOT_DISK_MB
}

impl EnvironConfig {
    /// Minimal configuration for `name` in `region`.
    #[must_use]
    pub fn new(name: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            endpoint: String::new(),
            default_series: default_series(),
            control_bucket_url: String::new(),
            image_metadata_url: None,
            agent_version: None,
            default_root_disk: DEFAULT_ROOT_DISK_MB,
            operation_timeout_secs: None,
            instance_types: Vec::new(),
            scope_rules: ScopeRules::standard(),
            retry: RetryConfig::default(),
        }
    }

    /// Load configuration from a YAML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        info!(environment = %config.name, region = %config.region, "Loaded environment config");
        Ok(config)
    }

    /// Parse and validate configuration from YAML text.
    ///
    /// # Errors
    /// Returns an error if the text is not valid configuration.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("Invalid YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Check required fields.
    ///
    /// # Errors
    /// Returns an error describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            bail!("environment name must not be empty");
        }
        if self.region.trim().is_empty() {
            bail!("region must not be empty");
        }
        self.retry.validate()?;
        if let Some(dup) = self
            .instance_types
            .iter()
            .enumerate()
            .find(|(i, it)| self.instance_types[..*i].iter().any(|o| o.name == it.name))
        {
            bail!("instance type {} listed twice", dup.1.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NetworkScope;

    const SAMPLE: &str = r"
name: sample
region: test
endpoint: https://ec2.endpoint.com
control-bucket-url: https://s3.example.com/test-bucket/
instance-types:
  - {name: m1.small, arch: amd64, mem: 1740, cpu-cores: 1, cpu-power: 100, cost: 60}
retry:
  max-attempts: 3
  initial-delay: 0.5
";

    #[test]
    fn test_parse_with_defaults() {
        let config = EnvironConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.name, "sample");
        assert_eq!(config.default_series, DEFAULT_SERIES);
        assert_eq!(config.default_root_disk, DEFAULT_ROOT_DISK_MB);
        assert_eq!(config.instance_types.len(), 1);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay.as_millis(), 500);
        assert_eq!(config.retry.backoff_multiplier, RetryConfig::default().backoff_multiplier);
        assert_eq!(
            config.scope_rules.classify("10.0.0.1").scope,
            NetworkScope::CloudLocal
        );
    }

    #[test]
    fn test_validation() {
        assert!(EnvironConfig::from_yaml("name: ''\nregion: test\n").is_err());
        assert!(EnvironConfig::from_yaml("name: x\nregion: ' '\n").is_err());
        assert!(EnvironConfig::from_yaml("name: x\nregion: r\nretry: {max-attempts: 0}\n").is_err());
        assert!(EnvironConfig::from_yaml("name: x\nregion: r\nretry: {backoff-multiplier: -1.0}\n").is_err());
        assert!(EnvironConfig::from_yaml("name: x\nregion: r\nretry: {backoff-multiplier: .nan}\n").is_err());
        assert!(EnvironConfig::from_yaml("name: x\nregion: r\nretry: {initial-delay: 90, max-delay: 10}\n").is_err());

        let dup = "name: x\nregion: r\ninstance-types:\n  - {name: a, arch: amd64, mem: 1, cpu-cores: 1, cpu-power: 1, cost: 1}\n  - {name: a, arch: amd64, mem: 2, cpu-cores: 1, cpu-power: 1, cost: 1}\n";
        assert!(EnvironConfig::from_yaml(dup).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        assert_eq!(EnvironConfig::load(&path).unwrap().region, "test");
        assert!(EnvironConfig::load(&dir.path().join("missing.yaml")).is_err());
    }
}
