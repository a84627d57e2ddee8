//! Bootstrap state persistence.
//!
//! The bootstrap record names the instances that make up an environment's
//! control plane together with their hardware. It is the only durable
//! state the provisioning core owns and all reads and writes of it go
//! through [`BootstrapStateStore`].

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constraints::HardwareCharacteristics;
use crate::error::ProvisionError;
use crate::storage::{Storage, StorageError};

/// Object name of the bootstrap record.
pub const STATE_FILE: &str = "bootstrap-state.yaml";

/// Backend-assigned instance identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Control-plane membership of an environment.
///
/// `state_instances` and `characteristics` are index-aligned; a value
/// violating that cannot be constructed or decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StateRecord", rename_all = "kebab-case")]
pub struct BootstrapState {
    state_instances: Vec<InstanceId>,
    characteristics: Vec<HardwareCharacteristics>,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct StateRecord {
    #[serde(default)]
    state_instances: Vec<InstanceId>,
    #[serde(default)]
    characteristics: Vec<HardwareCharacteristics>,
}

impl TryFrom<StateRecord> for BootstrapState {
    type Error = String;

    fn try_from(record: StateRecord) -> Result<Self, Self::Error> {
        Self::new(record.state_instances, record.characteristics).map_err(|e| e.to_string())
    }
}

impl BootstrapState {
    /// Build a state from aligned instance and hardware lists.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::CorruptState`] when the lists differ in length.
    pub fn new(
        state_instances: Vec<InstanceId>,
        characteristics: Vec<HardwareCharacteristics>,
    ) -> Result<Self, ProvisionError> {
        if state_instances.len() != characteristics.len() {
            return Err(ProvisionError::CorruptState(format!(
                "{} state instances but {} hardware records",
                state_instances.len(),
                characteristics.len()
            )));
        }
        Ok(Self {
            state_instances,
            characteristics,
        })
    }

    /// State for a single control-plane instance.
    #[must_use]
    pub fn single(id: InstanceId, hardware: HardwareCharacteristics) -> Self {
        Self {
            state_instances: vec![id],
            characteristics: vec![hardware],
        }
    }

    #[must_use]
    pub fn state_instances(&self) -> &[InstanceId] {
        &self.state_instances
    }

    #[must_use]
    pub fn characteristics(&self) -> &[HardwareCharacteristics] {
        &self.characteristics
    }

    /// Instance ids paired with their hardware.
    pub fn members(&self) -> impl Iterator<Item = (&InstanceId, &HardwareCharacteristics)> {
        self.state_instances.iter().zip(&self.characteristics)
    }

    /// Whether every recorded instance appears in `ids`.
    #[must_use]
    pub fn is_covered_by(&self, ids: &[InstanceId]) -> bool {
        self.state_instances.iter().all(|id| ids.contains(id))
    }

    fn encode(&self) -> Result<Vec<u8>, ProvisionError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(|e| ProvisionError::CorruptState(format!("cannot encode state: {e}")))
    }

    fn decode(data: &[u8]) -> Result<Self, ProvisionError> {
        serde_yaml::from_slice(data).map_err(|e| ProvisionError::CorruptState(e.to_string()))
    }
}

/// Reads and writes the bootstrap record of one environment.
#[derive(Clone)]
pub struct BootstrapStateStore {
    storage: Arc<dyn Storage>,
}

impl BootstrapStateStore {
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Write the record, replacing any existing one.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage write fails.
    pub async fn save(&self, state: &BootstrapState) -> Result<(), ProvisionError> {
        self.storage.put(STATE_FILE, &state.encode()?).await?;
        info!(
            instances = state.state_instances.len(),
            "Saved bootstrap state"
        );
        Ok(())
    }

    /// Write the record only if none exists.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::AlreadyBootstrapped`] when a record exists.
    pub async fn save_new(&self, state: &BootstrapState) -> Result<(), ProvisionError> {
        match self.storage.put_if_absent(STATE_FILE, &state.encode()?).await {
            Ok(()) => {
                info!(
                    instances = state.state_instances.len(),
                    "Created bootstrap state"
                );
                Ok(())
            }
            Err(StorageError::AlreadyExists(_)) => Err(ProvisionError::AlreadyBootstrapped),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the record.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotBootstrapped`] when no record exists and
    /// [`ProvisionError::CorruptState`] when it cannot be decoded.
    pub async fn load(&self) -> Result<BootstrapState, ProvisionError> {
        let data = match self.storage.get(STATE_FILE).await {
            Ok(data) => data,
            Err(StorageError::NotFound(_)) => return Err(ProvisionError::NotBootstrapped),
            Err(e) => return Err(e.into()),
        };
        let state = BootstrapState::decode(&data)?;
        debug!(instances = ?state.state_instances, "Loaded bootstrap state");
        Ok(state)
    }

    /// Whether a record exists.
    ///
    /// # Errors
    ///
    /// Returns an error if storage cannot be read.
    pub async fn exists(&self) -> Result<bool, ProvisionError> {
        match self.storage.get(STATE_FILE).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the record. Deleting a missing record succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage delete fails.
    pub async fn remove(&self) -> Result<(), ProvisionError> {
        self.storage.remove(STATE_FILE).await?;
        info!("Removed bootstrap state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn hardware() -> HardwareCharacteristics {
        "arch=amd64 cpu-cores=1 cpu-power=100 mem=1740M root-disk=8192M"
            .parse()
            .unwrap()
    }

    fn store() -> (Arc<MemoryStorage>, BootstrapStateStore) {
        let storage = Arc::new(MemoryStorage::new("test-bucket"));
        (storage.clone(), BootstrapStateStore::new(storage))
    }

    #[test]
    fn test_misaligned_state_is_rejected() {
        let err = BootstrapState::new(vec!["i-1".into(), "i-2".into()], vec![hardware()])
            .unwrap_err();
        assert!(matches!(err, ProvisionError::CorruptState(_)));
    }

    #[tokio::test]
    async fn test_load_before_save() {
        let (_, store) = store();
        assert!(matches!(
            store.load().await,
            Err(ProvisionError::NotBootstrapped)
        ));
        assert!(!store.exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let (_, store) = store();
        let state = BootstrapState::new(
            vec!["i-1".into(), "i-2".into()],
            vec![hardware(), hardware()],
        )
        .unwrap();
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);

        let replacement = BootstrapState::single("i-3".into(), hardware());
        store.save(&replacement).await.unwrap();
        assert_eq!(store.load().await.unwrap(), replacement);
    }

    #[tokio::test]
    async fn test_save_new_refuses_overwrite() {
        let (_, store) = store();
        let first = BootstrapState::single("i-1".into(), hardware());
        store.save_new(&first).await.unwrap();

        let second = BootstrapState::single("i-2".into(), hardware());
        assert!(matches!(
            store.save_new(&second).await,
            Err(ProvisionError::AlreadyBootstrapped)
        ));
        assert_eq!(store.load().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_remove_makes_state_unreadable() {
        let (_, store) = store();
        store
            .save(&BootstrapState::single("i-1".into(), hardware()))
            .await
            .unwrap();
        store.remove().await.unwrap();
        assert!(matches!(
            store.load().await,
            Err(ProvisionError::NotBootstrapped)
        ));
        store.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_records() {
        let (storage, store) = store();

        storage
            .put(
                STATE_FILE,
                b"state-instances: [i-1, i-2]\ncharacteristics:\n  - {arch: amd64, mem: 1, cpu-cores: 1, cpu-power: 1}\n",
            )
            .await
            .unwrap();
        assert!(matches!(
            store.load().await,
            Err(ProvisionError::CorruptState(_))
        ));

        storage.put(STATE_FILE, b"{not yaml").await.unwrap();
        assert!(matches!(
            store.load().await,
            Err(ProvisionError::CorruptState(_))
        ));
    }

    #[test]
    fn test_is_covered_by() {
        let state = BootstrapState::single("i-1".into(), hardware());
        assert!(state.is_covered_by(&["i-0".into(), "i-1".into()]));
        assert!(!state.is_covered_by(&["i-0".into()]));
    }
}
