//! Provisioning core for the fleet orchestrator.
//!
//! This crate turns hardware constraints into running instances on a
//! compute backend: it selects instance types, resolves images and agent
//! tools from published metadata, builds boot payloads, classifies the
//! addresses instances come up with and keeps the record of an
//! environment's control plane.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use fleet_provision::providers::local::LocalBackend;
//! use fleet_provision::{Constraint, EnvironConfig, HttpIndexFetcher, MemoryStorage, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = EnvironConfig::new("sample", "test");
//!     config.scope_rules = LocalBackend::scope_rules();
//!
//!     let orchestrator = Orchestrator::new(
//!         config,
//!         Arc::new(LocalBackend::with_default_catalog("test")),
//!         Arc::new(MemoryStorage::new("sample-bucket")),
//!         Arc::new(HttpIndexFetcher::new()?),
//!     );
//!
//!     // Bring up the control plane
//!     let state = orchestrator.bootstrap(&Constraint::any()).await?;
//!
//!     // Add a machine with at least 1 GB of memory
//!     let started = orchestrator
//!         .start_instance("1", "fake_nonce", &"mem=1G".parse()?)
//!         .await?;
//!
//!     // Tear everything down
//!     let mut ids = state.state_instances().to_vec();
//!     ids.push(started.instance);
//!     orchestrator.destroy(&ids).await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod backend;
pub mod cloudinit;
pub mod config;
pub mod constraints;
pub mod error;
pub mod hardware;
pub mod metadata;
pub mod orchestrator;
pub mod providers;
pub mod retry;
pub mod state;
pub mod storage;

pub use address::{Address, AddressKind, NetworkScope, ScopeRules};
pub use backend::{CloudBackend, CredentialInvalidator, LaunchRequest, LaunchedInstance};
pub use config::EnvironConfig;
pub use constraints::{Constraint, HardwareCharacteristics};
pub use error::ProvisionError;
pub use metadata::{HttpIndexFetcher, IndexFetcher, MetadataResolver, MetadataSource};
pub use orchestrator::{EnvironmentPhase, MachinePhase, Orchestrator, StartedInstance};
pub use retry::{with_retry_async, RetryConfig};
pub use state::{BootstrapState, BootstrapStateStore, InstanceId};
pub use storage::{FileStorage, MemoryStorage, Storage};
