//! Local backend implementation.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{
    default_catalog, BackendOp, Fault, Inventory, LocalInstance, DEFAULT_INITIAL_STATE,
};
use crate::address::{Cidr, NetworkScope, ScopeMatcher, ScopeRule, ScopeRules};
use crate::backend::{CloudBackend, InstanceSummary, LaunchRequest, LaunchedInstance};
use crate::error::ProvisionError;
use crate::hardware::InstanceType;
use crate::state::InstanceId;

/// Simulated compute backend for one region.
pub struct LocalBackend {
    region: String,
    catalog: Vec<InstanceType>,
    initial_state: Mutex<String>,
    faults: Mutex<HashMap<BackendOp, (Fault, u32)>>,
    inventory: tokio::sync::Mutex<Inventory>,
    /// Inventory file mirrored after every change.
    inventory_path: Option<PathBuf>,
}

impl LocalBackend {
    /// Create an in-memory backend offering `catalog` in `region`.
    #[must_use]
    pub fn new(region: impl Into<String>, catalog: Vec<InstanceType>) -> Self {
        Self {
            region: region.into(),
            catalog,
            initial_state: Mutex::new(DEFAULT_INITIAL_STATE.to_string()),
            faults: Mutex::new(HashMap::new()),
            inventory: tokio::sync::Mutex::new(Inventory::default()),
            inventory_path: None,
        }
    }

    /// In-memory backend with the default catalog.
    #[must_use]
    pub fn with_default_catalog(region: impl Into<String>) -> Self {
        Self::new(region, default_catalog())
    }

    /// Backend whose fleet is kept in an inventory file.
    ///
    /// # Errors
    /// Returns error if an existing inventory cannot be read or parsed.
    pub async fn open(
        path: impl Into<PathBuf>,
        region: impl Into<String>,
        catalog: Vec<InstanceType>,
    ) -> Result<Self, ProvisionError> {
        let path = path.into();
        let inventory = if fs::try_exists(&path).await.unwrap_or(false) {
            let contents = fs::read_to_string(&path)
                .await
                .map_err(|e| ProvisionError::Config(format!("Failed to read inventory: {e}")))?;
            serde_yaml::from_str(&contents)
                .map_err(|e| ProvisionError::Config(format!("Failed to parse inventory: {e}")))?
        } else {
            Inventory::default()
        };
        debug!(path = %path.display(), instances = inventory.instances.len(), "Opened inventory");

        let mut backend = Self::new(region, catalog);
        backend.inventory = tokio::sync::Mutex::new(inventory);
        backend.inventory_path = Some(path);
        Ok(backend)
    }

    /// Scope table matching the addresses this backend hands out.
    #[must_use]
    pub fn scope_rules() -> ScopeRules {
        let host = |suffix: &str, scope| ScopeRule {
            matcher: ScopeMatcher::HostSuffix(suffix.to_string()),
            scope,
        };
        let cidr = |a, b, c, scope| {
            Cidr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, 0)), 24).map(|range| ScopeRule {
                matcher: ScopeMatcher::Cidr(range),
                scope,
            })
        };
        let mut rules = ScopeRules::standard();
        let local: Vec<ScopeRule> = [
            Some(host(".testing.invalid", NetworkScope::Public)),
            Some(host(".internal.invalid", NetworkScope::CloudLocal)),
            cidr(8, 0, 0, NetworkScope::Public),
            cidr(127, 0, 0, NetworkScope::CloudLocal),
        ]
        .into_iter()
        .flatten()
        .collect();
        rules.rules.splice(0..0, local);
        rules
    }

    /// Status given to instances launched from now on.
    pub fn set_initial_state(&self, state: impl Into<String>) {
        *lock(&self.initial_state) = state.into();
    }

    /// Make the next `times` calls of `op` fail with `fault`.
    pub fn inject_fault(&self, op: BackendOp, fault: Fault, times: u32) {
        lock(&self.faults).insert(op, (fault, times));
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        lock(&self.faults).clear();
    }

    /// A launched instance, including its user data.
    pub async fn instance(&self, id: &InstanceId) -> Option<LocalInstance> {
        self.inventory.lock().await.get(id).cloned()
    }

    async fn check(&self, op: BackendOp) -> Result<(), ProvisionError> {
        let fault = {
            let mut faults = lock(&self.faults);
            match faults.get_mut(&op) {
                Some((fault, remaining)) if *remaining > 0 => {
                    *remaining -= 1;
                    Some(*fault)
                }
                _ => None,
            }
        };
        match fault {
            None => Ok(()),
            Some(Fault::Unavailable) => Err(ProvisionError::BackendUnavailable(format!(
                "injected failure in {op:?}"
            ))),
            Some(Fault::Unauthorized) => Err(ProvisionError::AuthorizationFailed(format!(
                "injected credential rejection in {op:?}"
            ))),
            Some(Fault::Hang) => {
                debug!(?op, "Hanging");
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    /// Save inventory to file, if one is configured.
    async fn persist(&self, inventory: &mut Inventory) -> Result<(), ProvisionError> {
        inventory.updated_at = Some(Utc::now());
        let Some(path) = &self.inventory_path else {
            return Ok(());
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ProvisionError::Config(format!("Failed to create directory: {e}")))?;
        }
        let contents = serde_yaml::to_string(&*inventory)
            .map_err(|e| ProvisionError::Config(format!("Failed to serialize inventory: {e}")))?;
        fs::write(path, contents)
            .await
            .map_err(|e| ProvisionError::Config(format!("Failed to write inventory: {e}")))?;
        Ok(())
    }

    fn addresses(index: u32) -> Vec<String> {
        let octet = index % 256;
        vec![
            format!("host-{index}.testing.invalid"),
            format!("host-{index}.internal.invalid"),
            format!("8.0.0.{octet}"),
            format!("127.0.0.{octet}"),
        ]
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl CloudBackend for LocalBackend {
    async fn launch_instance(&self, req: LaunchRequest) -> Result<LaunchedInstance, ProvisionError> {
        self.check(BackendOp::Launch).await?;
        if !self.catalog.iter().any(|it| it.name == req.instance_type) {
            return Err(ProvisionError::Config(format!(
                "unknown instance type {}",
                req.instance_type
            )));
        }

        let mut inventory = self.inventory.lock().await;
        let index = inventory.next_index;
        inventory.next_index += 1;

        let id = InstanceId::new(format!("i-{}", &Uuid::new_v4().simple().to_string()[..12]));
        let instance = LocalInstance {
            id: id.clone(),
            index,
            machine_id: req.machine_id,
            instance_type: req.instance_type,
            image_id: req.image_id,
            root_disk: req.root_disk,
            state: lock(&self.initial_state).clone(),
            addresses: Self::addresses(index),
            user_data: req.user_data,
            launched_at: Utc::now(),
        };
        info!(
            instance_id = %id,
            machine_id = %instance.machine_id,
            instance_type = %instance.instance_type,
            image_id = %instance.image_id,
            "Launched instance"
        );
        let raw_addresses = instance.addresses.clone();
        inventory.instances.push(instance);
        self.persist(&mut inventory).await?;

        Ok(LaunchedInstance { id, raw_addresses })
    }

    async fn terminate_instances(&self, ids: &[InstanceId]) -> Result<(), ProvisionError> {
        self.check(BackendOp::Terminate).await?;
        let mut inventory = self.inventory.lock().await;
        let before = inventory.instances.len();
        inventory.instances.retain(|i| !ids.contains(&i.id));
        let removed = before - inventory.instances.len();
        info!(requested = ids.len(), removed, "Terminated instances");
        self.persist(&mut inventory).await
    }

    async fn list_instance_types(&self, region: &str) -> Result<Vec<InstanceType>, ProvisionError> {
        self.check(BackendOp::ListInstanceTypes).await?;
        if region != self.region {
            debug!(region, "No instance types offered in region");
            return Ok(Vec::new());
        }
        Ok(self.catalog.clone())
    }

    async fn instance_state(&self, id: &InstanceId) -> Result<String, ProvisionError> {
        self.check(BackendOp::InstanceState).await?;
        self.inventory
            .lock()
            .await
            .get(id)
            .map(|i| i.state.clone())
            .ok_or_else(|| ProvisionError::InstanceNotFound(id.to_string()))
    }

    async fn list_instances(&self) -> Result<Vec<InstanceSummary>, ProvisionError> {
        self.check(BackendOp::ListInstances).await?;
        Ok(self
            .inventory
            .lock()
            .await
            .instances
            .iter()
            .map(|i| InstanceSummary {
                id: i.id.clone(),
                instance_type: i.instance_type.clone(),
                state: i.state.clone(),
                launched_at: Some(i.launched_at),
            })
            .collect())
    }

    async fn instance_addresses(&self, id: &InstanceId) -> Result<Vec<String>, ProvisionError> {
        self.check(BackendOp::InstanceAddresses).await?;
        self.inventory
            .lock()
            .await
            .get(id)
            .map(|i| i.addresses.clone())
            .ok_or_else(|| ProvisionError::InstanceNotFound(id.to_string()))
    }
}
