//! Backend traits and common types for compute providers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ProvisionError;
use crate::hardware::InstanceType;
use crate::state::InstanceId;

/// Request to launch one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Machine id the instance is started for.
    pub machine_id: String,
    /// Catalog name of the instance type.
    pub instance_type: String,
    /// Image to boot.
    pub image_id: String,
    /// Root disk size in MB.
    pub root_disk: u64,
    /// Cloud-init user data.
    pub user_data: String,
}

/// A freshly launched instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchedInstance {
    pub id: InstanceId,
    /// Endpoints as reported by the backend, unclassified.
    pub raw_addresses: Vec<String>,
}

/// An instance known to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub instance_type: String,
    /// Backend status string (e.g. "running").
    pub state: String,
    pub launched_at: Option<DateTime<Utc>>,
}

/// Compute backend for one environment.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Launch an instance.
    async fn launch_instance(&self, req: LaunchRequest) -> Result<LaunchedInstance, ProvisionError>;

    /// Terminate instances. Ids the backend does not know are ignored.
    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ProvisionError>;

    /// Instance type catalog offered in `region`.
    async fn list_instance_types(&self, region: &str) -> Result<Vec<InstanceType>, ProvisionError>;

    /// Backend status string of an instance.
    async fn instance_state(&self, id: &InstanceId) -> Result<String, ProvisionError>;

    /// All instances of the environment.
    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, ProvisionError>;

    /// Current raw endpoints of an instance.
    async fn instance_addresses(&self, id: &InstanceId) -> Result<Vec<String>, ProvisionError>;
}

/// Marks the environment's backend credential as unusable.
#[async_trait]
pub trait CredentialInvalidator: Send + Sync {
    /// Invalidate the credential, recording `reason`.
    async fn invalidate(&self, reason: &str) -> Result<(), ProvisionError>;
}

/// Invalidator that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogInvalidator;

#[async_trait]
impl CredentialInvalidator for LogInvalidator {
    async fn invalidate(&self, reason: &str) -> Result<(), ProvisionError> {
        warn!(reason, "Backend credential is no longer valid");
        Ok(())
    }
}
