//! Error kinds surfaced by the provisioning core.

use thiserror::Error;

use crate::storage::StorageError;

/// Errors that can occur while provisioning or tracking instances.
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// No catalog entry satisfies the requested constraint.
    #[error("no instance type matches constraint \"{constraint}\" in region {region}")]
    NoMatchingHardware { constraint: String, region: String },

    /// No metadata source offers an image for the requested target.
    #[error("no image metadata found for series {series}, arch {arch}, region {region}")]
    NoMatchingImages {
        series: String,
        arch: String,
        region: String,
    },

    /// No metadata source offers agent tools for the requested target.
    #[error("no agent tools found for series {series}, arch {arch}")]
    NoMatchingTools { series: String, arch: String },

    /// The environment has no bootstrap record.
    #[error("environment is not bootstrapped")]
    NotBootstrapped,

    /// A bootstrap record already exists (or another bootstrap holds it).
    #[error("environment is already bootstrapped")]
    AlreadyBootstrapped,

    /// The caller's deadline elapsed before the operation finished.
    #[error("{operation} timed out")]
    Timeout { operation: String },

    /// Transport-level failure talking to the backend or a metadata source.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend rejected the stored credential.
    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// The backend has no instance with this id.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The stored bootstrap record is unreadable or violates its invariants.
    #[error("bootstrap state is corrupt: {0}")]
    CorruptState(String),

    /// Durable storage failure other than a missing key.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A metadata index could not be decoded.
    #[error("invalid metadata at {url}: {message}")]
    Metadata { url: String, message: String },

    /// A state-machine transition that is not allowed.
    #[error("invalid transition from {from} to {to}")]
    InvalidState { from: String, to: String },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ProvisionError {
    /// Whether a failed call may be retried.
    ///
    /// Only transport failures are retried; semantic failures are
    /// surfaced to the caller unchanged.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendUnavailable(_))
    }

    pub(crate) fn timeout(operation: impl Into<String>) -> Self {
        Self::Timeout {
            operation: operation.into(),
        }
    }
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::timeout(
                err.url()
                    .map_or_else(|| "request".to_string(), ToString::to_string),
            );
        }
        Self::BackendUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        assert!(ProvisionError::BackendUnavailable("reset".into()).is_retryable());
        assert!(!ProvisionError::NotBootstrapped.is_retryable());
        assert!(!ProvisionError::AuthorizationFailed("expired".into()).is_retryable());
        assert!(!ProvisionError::NoMatchingHardware {
            constraint: "mem=1T".into(),
            region: "test".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = ProvisionError::timeout("launch instance");
        assert_eq!(err.to_string(), "launch instance timed out");
    }
}
