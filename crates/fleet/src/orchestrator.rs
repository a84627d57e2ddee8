//! Provisioning orchestration.
//!
//! The [`Orchestrator`] drives one environment: it bootstraps the first
//! control-plane instance, starts further machines and tears instances
//! down again. Every machine goes through the same sequence:
//!
//! 1. select an instance type for the constraint
//! 2. resolve an image and agent tools from metadata
//! 3. build the role's cloud-init payload and launch
//! 4. classify the addresses the backend reports
//!
//! Bootstrap and destroy are serialised per environment. Starting a
//! regular machine only reads the bootstrap record.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::address::{select_address, Address, NetworkScope};
use crate::backend::{CloudBackend, CredentialInvalidator, InstanceSummary, LaunchRequest, LogInvalidator};
use crate::cloudinit::{CloudConfig, MachineConfig, MachineRole, BOOTSTRAP_MACHINE_ID, BOOTSTRAP_NONCE};
use crate::config::EnvironConfig;
use crate::constraints::{Constraint, HardwareCharacteristics};
use crate::error::ProvisionError;
use crate::hardware::{self, Selection};
use crate::metadata::{
    image_sources, tools_sources, IndexFetcher, LookupParams, MetadataResolver, MetadataSource,
    StorageIndexFetcher, ToolsSpec,
};
use crate::retry::with_retry_async;
use crate::state::{BootstrapState, BootstrapStateStore, InstanceId};
use crate::storage::Storage;

/// Lifecycle of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EnvironmentPhase {
    Unbootstrapped,
    Bootstrapping,
    Bootstrapped,
}

impl EnvironmentPhase {
    /// Whether the environment may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use EnvironmentPhase::{Bootstrapped, Bootstrapping, Unbootstrapped};
        matches!(
            (self, next),
            (Unbootstrapped, Bootstrapping)
                | (Bootstrapping, Bootstrapped | Unbootstrapped)
                | (Bootstrapped, Unbootstrapped)
        )
    }
}

impl fmt::Display for EnvironmentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unbootstrapped => write!(f, "unbootstrapped"),
            Self::Bootstrapping => write!(f, "bootstrapping"),
            Self::Bootstrapped => write!(f, "bootstrapped"),
        }
    }
}

/// Lifecycle of one machine start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MachinePhase {
    Requested,
    HardwareSelected,
    Launched,
    AddressesResolved,
    Ready,
    Failed,
}

impl MachinePhase {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ready | Self::Failed)
    }

    /// Whether a machine may move from `self` to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use MachinePhase::{AddressesResolved, Failed, HardwareSelected, Launched, Ready, Requested};
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Requested, HardwareSelected)
            | (HardwareSelected, Launched)
            | (Launched, AddressesResolved)
            | (AddressesResolved, Ready) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::HardwareSelected => write!(f, "hardware-selected"),
            Self::Launched => write!(f, "launched"),
            Self::AddressesResolved => write!(f, "addresses-resolved"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A machine started by [`Orchestrator::start_instance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedInstance {
    pub instance: InstanceId,
    pub characteristics: HardwareCharacteristics,
    pub addresses: Vec<Address>,
}

/// Addresses of one control-plane instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateServer {
    pub instance: InstanceId,
    pub addresses: Vec<Address>,
}

/// Drives provisioning for one environment.
pub struct Orchestrator {
    config: EnvironConfig,
    backend: Arc<dyn CloudBackend>,
    store: BootstrapStateStore,
    resolver: MetadataResolver,
    invalidator: Arc<dyn CredentialInvalidator>,
    /// Serialises bootstrap and destroy.
    env_lock: tokio::sync::Mutex<()>,
    phase: Mutex<EnvironmentPhase>,
    machines: Mutex<HashMap<String, MachinePhase>>,
    /// Machine id each launched instance was started for.
    launched: Mutex<HashMap<InstanceId, String>>,
}

impl Orchestrator {
    /// Create an orchestrator.
    ///
    /// Metadata under the control bucket is read from `storage`; other
    /// metadata URLs go to `remote`. An empty control bucket URL in
    /// `config` is replaced by the URL of `storage`.
    #[must_use]
    pub fn new(
        mut config: EnvironConfig,
        backend: Arc<dyn CloudBackend>,
        storage: Arc<dyn Storage>,
        remote: Arc<dyn IndexFetcher>,
    ) -> Self {
        if config.control_bucket_url.trim().is_empty() {
            config.control_bucket_url = storage.url("");
            debug!(url = %config.control_bucket_url, "Using environment storage as control bucket");
        }
        let fetcher = StorageIndexFetcher::new(storage.clone(), remote);
        Self {
            config,
            backend,
            store: BootstrapStateStore::new(storage),
            resolver: MetadataResolver::new(Arc::new(fetcher)),
            invalidator: Arc::new(LogInvalidator),
            env_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(EnvironmentPhase::Unbootstrapped),
            machines: Mutex::new(HashMap::new()),
            launched: Mutex::new(HashMap::new()),
        }
    }

    /// Use `invalidator` when the backend rejects the credential.
    #[must_use]
    pub fn with_invalidator(mut self, invalidator: Arc<dyn CredentialInvalidator>) -> Self {
        self.invalidator = invalidator;
        self
    }

    #[must_use]
    pub fn config(&self) -> &EnvironConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &BootstrapStateStore {
        &self.store
    }

    /// Current environment phase, refreshed from storage unless a
    /// bootstrap is in progress here.
    ///
    /// # Errors
    /// Returns an error if storage cannot be read.
    pub async fn environment_phase(&self) -> Result<EnvironmentPhase, ProvisionError> {
        if *lock(&self.phase) == EnvironmentPhase::Bootstrapping {
            return Ok(EnvironmentPhase::Bootstrapping);
        }
        self.refresh_phase().await
    }

    /// Last recorded phase of a machine start.
    #[must_use]
    pub fn machine_phase(&self, machine_id: &str) -> Option<MachinePhase> {
        lock(&self.machines).get(machine_id).copied()
    }

    /// Bootstrap the environment with one control-plane instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::AlreadyBootstrapped`] if the environment
    /// has a bootstrap record. Any failure leaves no record behind and no
    /// launched instance running.
    pub async fn bootstrap(&self, constraint: &Constraint) -> Result<BootstrapState, ProvisionError> {
        let _guard = self.env_lock.lock().await;

        if self.refresh_phase().await? != EnvironmentPhase::Unbootstrapped {
            return Err(ProvisionError::AlreadyBootstrapped);
        }
        self.transition(EnvironmentPhase::Bootstrapping)?;
        info!(environment = %self.config.name, constraint = %constraint, "Bootstrapping environment");

        match self.bootstrap_locked(constraint).await {
            Ok(state) => {
                self.transition(EnvironmentPhase::Bootstrapped)?;
                info!(
                    environment = %self.config.name,
                    instances = ?state.state_instances(),
                    "Environment bootstrapped"
                );
                Ok(state)
            }
            Err(e) => {
                self.transition(EnvironmentPhase::Unbootstrapped)?;
                warn!(environment = %self.config.name, error = %e, "Bootstrap failed");
                Err(e)
            }
        }
    }

    async fn bootstrap_locked(&self, constraint: &Constraint) -> Result<BootstrapState, ProvisionError> {
        let deadline = self.deadline();
        // A previous control plane may have been destroyed.
        lock(&self.machines).remove(BOOTSTRAP_MACHINE_ID);
        let role = MachineRole::Bootstrap {
            constraint: constraint.clone(),
        };
        let started = self
            .launch_machine(BOOTSTRAP_MACHINE_ID, BOOTSTRAP_NONCE, role, constraint, deadline)
            .await?;

        let state = BootstrapState::single(started.instance.clone(), started.characteristics);
        if let Err(e) = self.store.save_new(&state).await {
            self.abandon(BOOTSTRAP_MACHINE_ID, &started.instance).await;
            return Err(e);
        }
        self.advance(BOOTSTRAP_MACHINE_ID, MachinePhase::Ready)?;
        Ok(state)
    }

    /// Start a regular machine.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotBootstrapped`] before bootstrap, or the
    /// first failure of hardware selection, metadata resolution or launch.
    pub async fn start_instance(
        &self,
        machine_id: &str,
        nonce: &str,
        constraint: &Constraint,
    ) -> Result<StartedInstance, ProvisionError> {
        let deadline = self.deadline();
        let state = self.store.load().await?;
        info!(machine_id, constraint = %constraint, "Starting instance");

        let state_addresses = self
            .state_servers_for(&state, deadline)
            .await?
            .iter()
            .filter_map(|server| preferred_address(&server.addresses))
            .map(|addr| addr.value.clone())
            .collect();

        let role = MachineRole::Regular { state_addresses };
        let started = self
            .launch_machine(machine_id, nonce, role, constraint, deadline)
            .await?;
        self.advance(machine_id, MachinePhase::Ready)?;
        info!(machine_id, instance_id = %started.instance, "Instance started");
        Ok(started)
    }

    /// Terminate `instances`. If they include every control-plane
    /// instance, the bootstrap record is removed as well. Machines whose
    /// instances are terminated may be started again.
    ///
    /// # Errors
    ///
    /// Returns an error if termination or the record removal fails.
    pub async fn destroy(&self, instances: &[InstanceId]) -> Result<(), ProvisionError> {
        let _guard = self.env_lock.lock().await;
        let deadline = self.deadline();
        info!(environment = %self.config.name, count = instances.len(), "Destroying instances");

        if !instances.is_empty() {
            let backend = &self.backend;
            self.call("terminate instances", deadline, || backend.terminate_instances(instances))
                .await?;
            self.forget(instances);
        }

        match self.store.load().await {
            Ok(state) if state.is_covered_by(instances) => {
                self.store.remove().await?;
                self.refresh_phase().await?;
                info!(environment = %self.config.name, "Environment destroyed");
            }
            Ok(_) => debug!("Control plane instances remain"),
            Err(ProvisionError::NotBootstrapped) => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Addresses of every control-plane instance.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NotBootstrapped`] before bootstrap.
    pub async fn state_addresses(&self) -> Result<Vec<StateServer>, ProvisionError> {
        let state = self.store.load().await?;
        self.state_servers_for(&state, self.deadline()).await
    }

    /// All instances the backend runs for this environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    pub async fn all_instances(&self) -> Result<Vec<InstanceSummary>, ProvisionError> {
        let backend = &self.backend;
        self.call("list instances", self.deadline(), || backend.list_instances())
            .await
    }

    /// Backend status of an instance (e.g. "running", "terminated").
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InstanceNotFound`] for unknown ids.
    pub async fn instance_status(&self, id: &InstanceId) -> Result<String, ProvisionError> {
        let backend = &self.backend;
        self.call("instance state", self.deadline(), || backend.instance_state(id))
            .await
    }

    /// Image ids matching the environment for `arch` (any when `None`).
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::NoMatchingImages`] if no source matches.
    pub async fn validate_images(&self, arch: Option<&str>) -> Result<Vec<String>, ProvisionError> {
        let params = self.lookup_params(arch, image_sources(&self.config));
        let resolver = &self.resolver;
        let params = &params;
        self.fetch("validate images", self.deadline(), || resolver.validate_images(params))
            .await
    }

    async fn launch_machine(
        &self,
        machine_id: &str,
        nonce: &str,
        role: MachineRole,
        constraint: &Constraint,
        deadline: Option<Instant>,
    ) -> Result<StartedInstance, ProvisionError> {
        self.begin(machine_id)?;
        match self
            .launch_machine_inner(machine_id, nonce, role, constraint, deadline)
            .await
        {
            Ok(started) => Ok(started),
            Err(e) => {
                self.fail(machine_id);
                Err(e)
            }
        }
    }

    async fn launch_machine_inner(
        &self,
        machine_id: &str,
        nonce: &str,
        role: MachineRole,
        constraint: &Constraint,
        deadline: Option<Instant>,
    ) -> Result<StartedInstance, ProvisionError> {
        let Selection {
            instance_type,
            characteristics,
        } = self.select_hardware(constraint, deadline).await?;
        self.advance(machine_id, MachinePhase::HardwareSelected)?;

        let arch = characteristics.arch.as_str();
        let image_id = self.resolve_image(arch, deadline).await?;
        let tools = self.resolve_tools(arch, deadline).await?;

        let machine = MachineConfig {
            environment: self.config.name.clone(),
            machine_id: machine_id.to_string(),
            nonce: nonce.to_string(),
            tools,
            role,
        };
        let user_data = CloudConfig::for_machine(&machine).render()?;
        let root_disk = constraint
            .root_disk
            .unwrap_or(0)
            .max(self.config.default_root_disk);

        let request = LaunchRequest {
            machine_id: machine_id.to_string(),
            instance_type: instance_type.name.clone(),
            image_id,
            root_disk,
            user_data,
        };
        let backend = &self.backend;
        let request = &request;
        let launched = self
            .call("launch instance", deadline, || backend.launch_instance(request.clone()))
            .await?;
        lock(&self.launched).insert(launched.id.clone(), machine_id.to_string());
        self.advance(machine_id, MachinePhase::Launched)?;

        let addresses = self.config.scope_rules.classify_all(&launched.raw_addresses);
        self.advance(machine_id, MachinePhase::AddressesResolved)?;
        debug!(
            machine_id,
            instance_id = %launched.id,
            addresses = ?addresses.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "Resolved addresses"
        );

        Ok(StartedInstance {
            instance: launched.id,
            characteristics: HardwareCharacteristics {
                root_disk: Some(root_disk),
                ..characteristics
            },
            addresses,
        })
    }

    async fn select_hardware(
        &self,
        constraint: &Constraint,
        deadline: Option<Instant>,
    ) -> Result<Selection, ProvisionError> {
        let backend = &self.backend;
        let region = self.config.region.as_str();
        let catalog = self
            .call("list instance types", deadline, || backend.list_instance_types(region))
            .await?;
        let selection = hardware::select(constraint, &catalog, region)?;
        info!(
            instance_type = %selection.instance_type.name,
            hardware = %selection.characteristics,
            "Selected instance type"
        );
        Ok(selection)
    }

    async fn resolve_image(&self, arch: &str, deadline: Option<Instant>) -> Result<String, ProvisionError> {
        let params = self.lookup_params(Some(arch), image_sources(&self.config));
        let resolver = &self.resolver;
        let params = &params;
        let ids = self
            .fetch("resolve image", deadline, || resolver.validate_images(params))
            .await?;
        // Ids are sorted and non-empty.
        let image_id = ids.into_iter().next().ok_or_else(|| ProvisionError::NoMatchingImages {
            series: params.series.clone(),
            arch: arch.to_string(),
            region: params.region.clone(),
        })?;
        debug!(image_id = %image_id, "Resolved image");
        Ok(image_id)
    }

    async fn resolve_tools(&self, arch: &str, deadline: Option<Instant>) -> Result<ToolsSpec, ProvisionError> {
        let params = self.lookup_params(Some(arch), tools_sources(&self.config));
        let resolver = &self.resolver;
        let params = &params;
        let tools = self
            .fetch("resolve tools", deadline, || resolver.find_tools(params))
            .await?;

        let chosen = match &self.config.agent_version {
            Some(version) => tools.into_iter().find(|t| &t.version == version),
            None => tools.into_iter().max_by_key(ToolsSpec::version_number),
        };
        let tools = chosen.ok_or_else(|| ProvisionError::NoMatchingTools {
            series: params.series.clone(),
            arch: arch.to_string(),
        })?;
        debug!(version = %tools.version, url = %tools.url, "Resolved agent tools");
        Ok(tools)
    }

    async fn state_servers_for(
        &self,
        state: &BootstrapState,
        deadline: Option<Instant>,
    ) -> Result<Vec<StateServer>, ProvisionError> {
        let backend = &self.backend;
        let mut servers = Vec::with_capacity(state.state_instances().len());
        for id in state.state_instances() {
            let raw = self
                .call("instance addresses", deadline, || backend.instance_addresses(id))
                .await?;
            servers.push(StateServer {
                instance: id.clone(),
                addresses: self.config.scope_rules.classify_all(&raw),
            });
        }
        Ok(servers)
    }

    fn lookup_params(&self, arch: Option<&str>, sources: Vec<MetadataSource>) -> LookupParams {
        LookupParams {
            series: self.config.default_series.clone(),
            arch: arch.map(str::to_string),
            region: self.config.region.clone(),
            endpoint: self.config.endpoint.clone(),
            sources,
        }
    }

    /// Run a metadata lookup under the retry policy. Metadata mirrors do
    /// not use the backend credential, so their rejections never
    /// invalidate it.
    async fn fetch<T, F, Fut>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        f: F,
    ) -> Result<T, ProvisionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProvisionError>>,
    {
        with_retry_async(&self.config.retry, operation, deadline, f).await
    }

    /// Run a backend call under the retry policy, invalidating the
    /// credential when the backend rejects it.
    async fn call<T, F, Fut>(
        &self,
        operation: &str,
        deadline: Option<Instant>,
        f: F,
    ) -> Result<T, ProvisionError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProvisionError>>,
    {
        let result = with_retry_async(&self.config.retry, operation, deadline, f).await;
        if let Err(ProvisionError::AuthorizationFailed(reason)) = &result {
            warn!(operation, reason = %reason, "Backend rejected credential");
            if let Err(e) = self.invalidator.invalidate(reason).await {
                warn!(error = %e, "Failed to invalidate credential");
            }
        }
        result
    }

    /// Terminate an instance whose start cannot complete.
    async fn abandon(&self, machine_id: &str, id: &InstanceId) {
        self.fail(machine_id);
        lock(&self.launched).remove(id);
        let backend = &self.backend;
        let ids = std::slice::from_ref(id);
        match self
            .call("terminate instances", self.deadline(), || backend.terminate_instances(ids))
            .await
        {
            Ok(()) => info!(instance_id = %id, "Terminated abandoned instance"),
            Err(e) => warn!(instance_id = %id, error = %e, "Failed to terminate abandoned instance"),
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.config
            .operation_timeout_secs
            .map(|secs| Instant::now() + Duration::from_secs(secs))
    }

    async fn refresh_phase(&self) -> Result<EnvironmentPhase, ProvisionError> {
        let phase = if self.store.exists().await? {
            EnvironmentPhase::Bootstrapped
        } else {
            EnvironmentPhase::Unbootstrapped
        };
        *lock(&self.phase) = phase;
        Ok(phase)
    }

    fn transition(&self, next: EnvironmentPhase) -> Result<(), ProvisionError> {
        let mut phase = lock(&self.phase);
        if !phase.can_transition_to(next) {
            return Err(ProvisionError::InvalidState {
                from: phase.to_string(),
                to: next.to_string(),
            });
        }
        debug!(from = %*phase, to = %next, "Environment phase");
        *phase = next;
        Ok(())
    }

    /// Record a new start of `machine_id`. A machine may be started again
    /// only after a failed start.
    fn begin(&self, machine_id: &str) -> Result<(), ProvisionError> {
        let mut machines = lock(&self.machines);
        match machines.get(machine_id) {
            None | Some(MachinePhase::Failed) => {
                machines.insert(machine_id.to_string(), MachinePhase::Requested);
                Ok(())
            }
            Some(phase) => Err(ProvisionError::InvalidState {
                from: phase.to_string(),
                to: MachinePhase::Requested.to_string(),
            }),
        }
    }

    fn advance(&self, machine_id: &str, next: MachinePhase) -> Result<(), ProvisionError> {
        let mut machines = lock(&self.machines);
        let current = machines
            .get(machine_id)
            .copied()
            .unwrap_or(MachinePhase::Requested);
        if !current.can_transition_to(next) {
            return Err(ProvisionError::InvalidState {
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        debug!(machine_id, from = %current, to = %next, "Machine phase");
        machines.insert(machine_id.to_string(), next);
        Ok(())
    }

    /// Drop the records of machines running on `instances`.
    fn forget(&self, instances: &[InstanceId]) {
        let mut launched = lock(&self.launched);
        let mut machines = lock(&self.machines);
        for id in instances {
            if let Some(machine_id) = launched.remove(id) {
                debug!(machine_id, instance_id = %id, "Forgetting destroyed machine");
                machines.remove(&machine_id);
            }
        }
    }

    fn fail(&self, machine_id: &str) {
        let mut machines = lock(&self.machines);
        if let Some(phase) = machines.get_mut(machine_id) {
            if phase.can_transition_to(MachinePhase::Failed) {
                *phase = MachinePhase::Failed;
            }
        }
    }
}

/// Address regular machines use to reach a state server.
fn preferred_address(addresses: &[Address]) -> Option<&Address> {
    select_address(addresses, NetworkScope::CloudLocal)
        .or_else(|| select_address(addresses, NetworkScope::Public))
        .or_else(|| addresses.first())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockCloudBackend;
    use crate::metadata::StaticIndexFetcher;
    use crate::storage::MemoryStorage;

    fn orchestrator(backend: MockCloudBackend) -> Orchestrator {
        Orchestrator::new(
            EnvironConfig::new("sample", "test"),
            Arc::new(backend),
            Arc::new(MemoryStorage::new("test-bucket")),
            Arc::new(StaticIndexFetcher::new()),
        )
    }

    #[tokio::test]
    async fn test_destroy_nothing_skips_backend() {
        let mut backend = MockCloudBackend::new();
        backend.expect_terminate_instances().never();
        orchestrator(backend).destroy(&[]).await.unwrap();
    }

    #[tokio::test]
    async fn test_unmatched_constraint_never_launches() {
        let mut backend = MockCloudBackend::new();
        backend
            .expect_list_instance_types()
            .times(1)
            .returning(|_| Ok(Vec::new()));
        backend.expect_launch_instance().never();

        let orchestrator = orchestrator(backend);
        let err = orchestrator.bootstrap(&Constraint::any()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NoMatchingHardware { .. }));
        assert_eq!(orchestrator.machine_phase("0"), Some(MachinePhase::Failed));
        assert_eq!(
            orchestrator.environment_phase().await.unwrap(),
            EnvironmentPhase::Unbootstrapped
        );
    }

    #[test]
    fn test_environment_transitions() {
        use EnvironmentPhase::{Bootstrapped, Bootstrapping, Unbootstrapped};
        assert!(Unbootstrapped.can_transition_to(Bootstrapping));
        assert!(Bootstrapping.can_transition_to(Bootstrapped));
        assert!(Bootstrapping.can_transition_to(Unbootstrapped));
        assert!(Bootstrapped.can_transition_to(Unbootstrapped));
        assert!(!Unbootstrapped.can_transition_to(Bootstrapped));
        assert!(!Bootstrapped.can_transition_to(Bootstrapping));
    }

    #[test]
    fn test_machine_transitions() {
        use MachinePhase::{AddressesResolved, Failed, HardwareSelected, Launched, Ready, Requested};
        let path = [Requested, HardwareSelected, Launched, AddressesResolved, Ready];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        for phase in &path[..4] {
            assert!(phase.can_transition_to(Failed));
        }
        assert!(!Ready.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Requested));
        assert!(!Requested.can_transition_to(Launched));
    }

    #[test]
    fn test_preferred_address() {
        let rules = crate::providers::local::LocalBackend::scope_rules();
        let addrs = rules.classify_all(&["8.0.0.1", "host-0.testing.invalid", "127.0.0.1"]);
        assert_eq!(preferred_address(&addrs).unwrap().value, "127.0.0.1");
        assert!(preferred_address(&[]).is_none());
    }
}
