//! # Enclaves
//!
//! An enclave is one isolated network plus everything started on it. The
//! [`EnclaveManager`] creates and destroys enclaves and brings persisted
//! ones back after a restart; an [`Enclave`] is the handle through which
//! services, partitions, artifacts, and extensions are managed.
//!
//! ## Lifecycle
//!
//! ```text
//! create_enclave()
//!   1. record Creating
//!   2. provision network (gateway reserved)
//!   3. start control container (optional, reserved address)
//!   4. record Running
//!
//! destroy_enclave()           (every step attempted, failures collected)
//!   1. record Destroying
//!   2. destroy extensions
//!   3. remove services and sidecars
//!   4. remove control container
//!   5. remove remaining labelled containers (expanders, orphans)
//!   6. remove labelled volumes
//!   7. delete the files-artifact cache
//!   8. release every address
//!   9. remove network
//!  10. record Destroyed
//! ```
//!
//! Every mutation of an enclave rewrites its record, so a restarted engine
//! can [`reconcile`](EnclaveManager::reconcile) against the runtime.

pub mod service_network;

pub use self::service_network::{RepartitionRequest, ServiceNetwork};

use crate::artifact::{ArtifactEntry, ArtifactExpander, ChunkStream, FilesArtifact, FilesArtifactStore, StreamedDataChunk, UploadResponse};
use crate::config::EngineConfig;
use crate::constants::{APP_ID, ARTIFACTS_DIR, LABEL_APP_ID, LABEL_ENCLAVE_ID};
use crate::error::{Error, Result, TeardownReport};
use crate::extension::{ExtensionConnector, ExtensionStore};
use crate::ids::{EnclaveId, ExtensionId, PartitionId, ServiceId};
use crate::naming::{ObjectKind, ObjectNamer};
use crate::network::{AddressPool, NetworkProvisioner};
use crate::partition::{ConnectionState, PartitionTopology};
use crate::persistence::{EnclaveRecord, EnclaveState, ExtensionRecord, NetworkRecord, StateStore};
use crate::runtime::{ContainerRuntime, ExecResult, Labels};
use crate::service::{AddressRequest, HttpEndpointCheck, LaunchRequest, Service, ServiceConfig, ServiceLauncher};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

/// GUID of the control container; there is at most one per enclave.
const CONTROL_GUID: &str = "control";

// =============================================================================
// Enclave
// =============================================================================

/// Handle to one enclave.
pub struct Enclave {
    id: EnclaveId,
    created_at: DateTime<Utc>,
    state: Mutex<EnclaveState>,
    network: NetworkRecord,
    reserved_ips: Vec<Ipv4Addr>,
    control_container_id: Option<String>,
    namer: ObjectNamer,
    artifacts: Arc<FilesArtifactStore>,
    services: ServiceNetwork,
    extensions: ExtensionStore,
    records: StateStore,
    persist_lock: Mutex<()>,
}

impl std::fmt::Debug for Enclave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Enclave")
            .field("id", &self.id)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

impl Enclave {
    /// Enclave ID.
    #[must_use]
    pub fn id(&self) -> &EnclaveId {
        &self.id
    }

    /// Creation time.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EnclaveState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(EnclaveState::Destroying)
    }

    fn set_state(&self, state: EnclaveState) -> Result<()> {
        *self
            .state
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))? = state;
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state == EnclaveState::Running {
            Ok(())
        } else {
            Err(Error::InvalidState {
                object: format!("enclave {}", self.id),
                state: state.to_string(),
                expected: EnclaveState::Running.to_string(),
            })
        }
    }

    /// The enclave network.
    #[must_use]
    pub fn network(&self) -> &NetworkRecord {
        &self.network
    }

    /// The enclave's address pool.
    #[must_use]
    pub fn address_pool(&self) -> &Arc<AddressPool> {
        self.services.launcher().pool()
    }

    /// Services and partitions.
    #[must_use]
    pub fn service_network(&self) -> &ServiceNetwork {
        &self.services
    }

    /// Loaded extensions.
    #[must_use]
    pub fn extensions(&self) -> &ExtensionStore {
        &self.extensions
    }

    /// Files-artifact cache.
    #[must_use]
    pub fn artifacts(&self) -> &Arc<FilesArtifactStore> {
        &self.artifacts
    }

    /// Snapshot of everything persisted about the enclave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if a registry lock is poisoned.
    pub fn record(&self) -> Result<EnclaveRecord> {
        Ok(EnclaveRecord {
            id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
            network: Some(self.network.clone()),
            reserved_ips: self.reserved_ips.clone(),
            control_container_id: self.control_container_id.clone(),
            services: self.services.records(),
            topology: self.services.topology()?,
            extensions: self.extensions.records(),
        })
    }

    fn persist(&self) -> Result<()> {
        let _guard = self
            .persist_lock
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))?;
        self.records.save(&self.record()?)
    }

    /// Persists after a mutation, keeping the mutation's result.
    ///
    /// A failed save is logged, not returned: the mutation already happened
    /// and the next successful save records it.
    fn persisted<T>(&self, result: Result<T>) -> Result<T> {
        let value = result?;
        self.persist_or_warn();
        Ok(value)
    }

    fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            warn!(enclave = %self.id, error = %e, "could not persist enclave record");
        }
    }

    // =========================================================================
    // Services and Partitions
    // =========================================================================

    /// Adds a service. See [`ServiceNetwork::add_service`].
    ///
    /// # Errors
    ///
    /// [`Error::InvalidState`] unless the enclave is running, plus the
    /// service network's errors.
    pub async fn add_service(&self, id: &ServiceId, config: ServiceConfig) -> Result<Service> {
        self.ensure_running()?;
        self.persisted(self.services.add_service(id, config).await)
    }

    /// Removes a service. See [`ServiceNetwork::remove_service`].
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn remove_service(&self, id: &ServiceId) -> Result<()> {
        self.ensure_running()?;
        let result = self.services.remove_service(id).await;
        // Teardown failures still change the registry.
        self.persist_or_warn();
        result
    }

    /// Replaces the partition topology. See [`ServiceNetwork::repartition`].
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn repartition(&self, request: RepartitionRequest) -> Result<()> {
        self.ensure_running()?;
        self.persisted(self.services.repartition(request).await)
    }

    /// Sets the connection between two partitions.
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn set_connection(&self, a: PartitionId, b: PartitionId, state: ConnectionState) -> Result<()> {
        self.ensure_running()?;
        self.persisted(self.services.set_connection(a, b, state).await)
    }

    /// Removes the override between two partitions.
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn unset_connection(&self, a: PartitionId, b: PartitionId) -> Result<bool> {
        self.ensure_running()?;
        self.persisted(self.services.unset_connection(a, b).await)
    }

    /// Replaces the default connection.
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn set_default_connection(&self, state: ConnectionState) -> Result<()> {
        self.ensure_running()?;
        self.persisted(self.services.set_default_connection(state).await)
    }

    /// Connection from one service toward another as enforced.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] for an unknown service.
    pub async fn connection_between(&self, from: &ServiceId, to: &ServiceId) -> Result<ConnectionState> {
        self.services.connection_between(from, to).await
    }

    /// Runs a command in a service container.
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn exec(&self, id: &ServiceId, command: &[String]) -> Result<ExecResult> {
        self.ensure_running()?;
        self.services.exec(id, command).await
    }

    /// Freezes a service. See [`ServiceNetwork::pause_service`].
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn pause_service(&self, id: &ServiceId) -> Result<()> {
        self.ensure_running()?;
        self.services.pause_service(id).await
    }

    /// Resumes a paused service.
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn unpause_service(&self, id: &ServiceId) -> Result<()> {
        self.ensure_running()?;
        self.services.unpause_service(id).await
    }

    /// Waits for a service's HTTP endpoint.
    /// See [`ServiceNetwork::wait_for_http_endpoint`].
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn wait_for_http_endpoint(&self, id: &ServiceId, check: &HttpEndpointCheck) -> Result<()> {
        self.ensure_running()?;
        self.services.wait_for_http_endpoint(id, check).await
    }

    // =========================================================================
    // Files Artifacts
    // =========================================================================

    /// Stores in-memory `.tgz` content.
    ///
    /// # Errors
    ///
    /// Store errors; [`Error::InvalidState`] unless running.
    pub fn store_artifact(&self, name: Option<&str>, data: &[u8]) -> Result<FilesArtifact> {
        self.ensure_running()?;
        self.artifacts.store(name, data)
    }

    /// Packs and stores a directory.
    ///
    /// # Errors
    ///
    /// Archive or store errors; [`Error::InvalidState`] unless running.
    pub fn store_directory(&self, dir: &Path, name: Option<&str>) -> Result<FilesArtifact> {
        self.ensure_running()?;
        self.artifacts.store_directory(dir, name)
    }

    /// Copies `path` out of a service and stores it as a files artifact.
    ///
    /// # Errors
    ///
    /// As [`ServiceNetwork::copy_files_from_service`], plus store errors.
    pub async fn store_files_from_service(
        &self,
        id: &ServiceId,
        path: &str,
        name: Option<&str>,
    ) -> Result<FilesArtifact> {
        self.ensure_running()?;
        let data = self.services.copy_files_from_service(id, path).await?;
        let artifact = self.artifacts.store(name, &data)?;
        info!(enclave = %self.id, service = %id, path, artifact = %artifact.uuid, "stored files from service");
        Ok(artifact)
    }

    /// Receives a chunked upload.
    ///
    /// # Errors
    ///
    /// Integrity errors abort without creating an entry.
    pub async fn upload_artifact(&self, rx: &mut mpsc::Receiver<StreamedDataChunk>) -> Result<UploadResponse> {
        self.ensure_running()?;
        self.artifacts.upload_channel(rx).await
    }

    /// Streams an artifact back in verified chunks.
    ///
    /// # Errors
    ///
    /// [`Error::ArtifactNotFound`] or [`Error::AmbiguousArtifactId`].
    pub fn download_artifact(&self, identifier: &str) -> Result<ChunkStream> {
        self.artifacts.download(identifier)
    }

    /// Lists an artifact's files.
    ///
    /// # Errors
    ///
    /// Lookup or archive errors.
    pub fn inspect_artifact(&self, identifier: &str) -> Result<Vec<ArtifactEntry>> {
        self.artifacts.inspect(identifier)
    }

    // =========================================================================
    // Extensions
    // =========================================================================

    /// Loads an extension. See [`ExtensionStore::load`].
    ///
    /// # Errors
    ///
    /// As [`Enclave::add_service`].
    pub async fn load_extension(&self, id: &ExtensionId, image: &str, params: &str) -> Result<ExtensionRecord> {
        self.ensure_running()?;
        self.persisted(self.extensions.load(id, image, params).await)
    }

    /// Calls a loaded extension.
    ///
    /// # Errors
    ///
    /// As [`ExtensionStore::execute`].
    pub async fn execute_extension(&self, id: &ExtensionId, params: &str) -> Result<String> {
        self.ensure_running()?;
        self.extensions.execute(id, params).await
    }

    /// Unloads an extension.
    ///
    /// # Errors
    ///
    /// As [`ExtensionStore::unload`].
    pub async fn unload_extension(&self, id: &ExtensionId) -> Result<()> {
        self.ensure_running()?;
        let result = self.extensions.unload(id).await;
        if !matches!(result, Err(Error::ExtensionNotFound(_))) {
            self.persist_or_warn();
        }
        result
    }
}

// =============================================================================
// Enclave Manager
// =============================================================================

/// Outcome of [`EnclaveManager::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Enclaves brought back into service.
    pub restored: Vec<EnclaveId>,
    /// Enclaves whose network no longer exists, now marked destroyed.
    pub destroyed: Vec<EnclaveId>,
    /// Runtime networks labelled for enclaves without a record.
    pub orphan_networks: Vec<String>,
}

#[derive(Default)]
struct Registry {
    enclaves: BTreeMap<EnclaveId, Arc<Enclave>>,
    creating: BTreeSet<EnclaveId>,
}

/// Components shared by freshly created and restored enclaves.
struct EnclaveParts {
    id: EnclaveId,
    created_at: DateTime<Utc>,
    network: NetworkRecord,
    pool: Arc<AddressPool>,
    reserved_ips: Vec<Ipv4Addr>,
    control_container_id: Option<String>,
}

/// Creates, tracks, and destroys enclaves on one container runtime.
pub struct EnclaveManager {
    config: EngineConfig,
    runtime: Arc<dyn ContainerRuntime>,
    connector: Arc<dyn ExtensionConnector>,
    provisioner: NetworkProvisioner,
    records: StateStore,
    registry: Mutex<Registry>,
}

impl EnclaveManager {
    /// Creates a manager.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the configuration is invalid.
    pub fn new(
        config: EngineConfig,
        runtime: Arc<dyn ContainerRuntime>,
        connector: Arc<dyn ExtensionConnector>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            provisioner: NetworkProvisioner::new(runtime.clone(), &config),
            records: StateStore::new(&config.data_dir),
            config,
            runtime,
            connector,
            registry: Mutex::new(Registry::default()),
        })
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Registry>> {
        self.registry
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn assemble(&self, parts: EnclaveParts, state: EnclaveState) -> Result<Enclave> {
        let namer = ObjectNamer::new(parts.id.clone());
        let artifacts = Arc::new(FilesArtifactStore::open(
            self.config.enclave_dir(parts.id.as_str()).join(ARTIFACTS_DIR),
        )?);
        let expander = Arc::new(ArtifactExpander::new(artifacts.clone(), &self.config));
        let launcher = ServiceLauncher::new(
            self.runtime.clone(),
            namer.clone(),
            parts.network.id.clone(),
            parts.pool,
            expander,
            self.config.publish_ports,
        );
        Ok(Enclave {
            id: parts.id,
            created_at: parts.created_at,
            state: Mutex::new(state),
            network: parts.network,
            reserved_ips: parts.reserved_ips,
            control_container_id: parts.control_container_id,
            namer,
            artifacts,
            services: ServiceNetwork::new(launcher.clone(), &self.config),
            extensions: ExtensionStore::new(launcher, self.connector.clone(), &self.config),
            records: self.records.clone(),
            persist_lock: Mutex::new(()),
        })
    }

    /// Creates an enclave with its own network.
    ///
    /// # Errors
    ///
    /// - [`Error::EnclaveAlreadyExists`] if the ID is live or being created
    /// - [`Error::NoFreeSubnet`] or runtime errors; anything created is
    ///   removed and the record is marked destroyed
    #[instrument(skip(self), fields(enclave = %id))]
    pub async fn create_enclave(&self, id: &EnclaveId) -> Result<Arc<Enclave>> {
        {
            let mut registry = self.lock()?;
            let live = registry
                .enclaves
                .get(id)
                .is_some_and(|e| e.state() != EnclaveState::Destroyed);
            if live || !registry.creating.insert(id.clone()) {
                return Err(Error::EnclaveAlreadyExists(id.to_string()));
            }
        }

        let result = self.provision(id).await;
        let mut registry = self.lock()?;
        registry.creating.remove(id);
        let enclave = Arc::new(result?);
        registry.enclaves.insert(id.clone(), enclave.clone());
        Ok(enclave)
    }

    async fn provision(&self, id: &EnclaveId) -> Result<Enclave> {
        // A reused ID never sees artifacts a failed teardown left behind.
        let stale = self.config.enclave_dir(id.as_str()).join(ARTIFACTS_DIR);
        if stale.exists() {
            warn!(path = %stale.display(), "removing stale files artifacts");
            std::fs::remove_dir_all(&stale)?;
        }

        let mut record = EnclaveRecord::new(id.clone());
        self.records.save(&record)?;

        let namer = ObjectNamer::new(id.clone());
        let network = match self
            .provisioner
            .create_network(id, &namer.network_name(), &namer.kind_labels(ObjectKind::Network))
            .await
        {
            Ok(network) => network,
            Err(e) => {
                record.state = EnclaveState::Destroyed;
                if let Err(save_err) = self.records.save(&record) {
                    warn!(error = %save_err, "could not record failed enclave creation");
                }
                return Err(e);
            }
        };

        let parts = EnclaveParts {
            id: id.clone(),
            created_at: record.created_at,
            network: NetworkRecord {
                id: network.id.clone(),
                name: network.name.clone(),
                subnet: network.subnet,
                gateway: network.gateway,
            },
            pool: network.pool.clone(),
            reserved_ips: vec![network.gateway],
            control_container_id: None,
        };
        let mut enclave = self.assemble(parts, EnclaveState::Creating)?;

        if let Some(image) = &self.config.control_image {
            let mut request = LaunchRequest::new(ObjectKind::Control, CONTROL_GUID, image);
            request.address = AddressRequest::Allocate;
            match enclave.services.launcher().launch(request).await {
                Ok(launched) => {
                    enclave.reserved_ips.extend(launched.ip);
                    enclave.control_container_id = Some(launched.container_id);
                }
                Err(e) => {
                    error!(error = %e, "control container failed to start, removing enclave");
                    let report = self.teardown(&enclave).await;
                    if !report.is_clean() {
                        warn!(failures = report.failures().len(), "enclave creation left objects behind");
                    }
                    return Err(e);
                }
            }
        }

        enclave.set_state(EnclaveState::Running)?;
        enclave.persist()?;
        info!(subnet = %enclave.network.subnet, network = %enclave.network.id, "created enclave");
        Ok(enclave)
    }

    /// Destroys an enclave, attempting every step.
    ///
    /// Destroying an already destroyed enclave does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EnclaveNotFound`] for an unknown ID. Teardown
    /// failures are returned in the report, not as an error.
    #[instrument(skip(self), fields(enclave = %id))]
    pub async fn destroy_enclave(&self, id: &EnclaveId) -> Result<TeardownReport> {
        let enclave = self.lock()?.enclaves.get(id).cloned();
        let Some(enclave) = enclave else {
            return match self.records.load(id)? {
                Some(record) if record.state == EnclaveState::Destroyed => Ok(TeardownReport::new()),
                _ => Err(Error::EnclaveNotFound(id.to_string())),
            };
        };
        if enclave.state() == EnclaveState::Destroyed {
            return Ok(TeardownReport::new());
        }

        let report = self.teardown(&enclave).await;
        if report.is_clean() {
            info!("destroyed enclave");
        } else {
            warn!(failures = report.failures().len(), "destroyed enclave with failures");
        }
        Ok(report)
    }

    async fn teardown(&self, enclave: &Enclave) -> TeardownReport {
        let mut report = TeardownReport::new();
        let record_state = |state: EnclaveState, report: &mut TeardownReport| {
            if let Err(e) = enclave.set_state(state).and_then(|()| enclave.persist()) {
                report.record(format!("record of enclave {}", enclave.id), e);
            }
        };
        record_state(EnclaveState::Destroying, &mut report);

        report.merge(enclave.extensions.destroy_all().await);
        report.merge(enclave.services.destroy_all().await);

        let launcher = enclave.services.launcher();
        if let Some(control) = &enclave.control_container_id
            && let Err(e) = launcher.destroy(control).await
        {
            report.record(format!("control container {control}"), e);
        }

        let labels = enclave.namer.enclave_labels();
        match self.runtime.list_containers(&labels).await {
            Ok(containers) => {
                for container in containers {
                    if let Err(e) = self.runtime.remove_container(&container.id).await {
                        report.record(format!("container {}", container.name), e);
                    }
                }
            }
            Err(e) => report.record(format!("containers of enclave {}", enclave.id), e),
        }
        match self.runtime.list_volumes(&labels).await {
            Ok(volumes) => report.merge(launcher.remove_volumes(&volumes).await),
            Err(e) => report.record(format!("volumes of enclave {}", enclave.id), e),
        }
        if let Err(e) = enclave.artifacts.destroy() {
            report.record(format!("files artifacts of enclave {}", enclave.id), e);
        }

        launcher.pool().release_all();
        if let Err(e) = self.provisioner.destroy_network(&enclave.network.id).await {
            report.record(format!("network {}", enclave.network.name), e);
        }

        record_state(EnclaveState::Destroyed, &mut report);
        report
    }

    /// A tracked enclave.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EnclaveNotFound`] for an unknown ID.
    pub fn get_enclave(&self, id: &EnclaveId) -> Result<Arc<Enclave>> {
        self.lock()?
            .enclaves
            .get(id)
            .cloned()
            .ok_or_else(|| Error::EnclaveNotFound(id.to_string()))
    }

    /// Every tracked enclave, ordered by ID.
    #[must_use]
    pub fn list_enclaves(&self) -> Vec<Arc<Enclave>> {
        self.lock()
            .map(|r| r.enclaves.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Rebuilds in-memory state from persisted records and the runtime.
    ///
    /// - records whose network is gone are marked destroyed
    /// - surviving enclaves get their addresses reserved, services and
    ///   sidecars re-registered and re-pushed, and extensions re-dialed
    /// - enclaves interrupted while creating or destroying are torn down
    /// - labelled networks without a record are reported, not removed
    ///
    /// # Errors
    ///
    /// Returns an error only if records or runtime networks cannot be
    /// listed; per-enclave problems are logged.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let records = self.records.load_all()?;
        let mut app_labels = Labels::new();
        app_labels.insert(LABEL_APP_ID.to_string(), APP_ID.to_string());
        let networks = self.runtime.list_networks(&app_labels).await?;

        let known: BTreeSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
        for network in &networks {
            if let Some(owner) = network.labels.get(LABEL_ENCLAVE_ID)
                && !known.contains(owner.as_str())
            {
                warn!(network = %network.name, enclave = %owner, "ACTION REQUIRED: orphan enclave network");
                report.orphan_networks.push(network.name.clone());
            }
        }

        for mut record in records {
            if record.state == EnclaveState::Destroyed {
                continue;
            }
            if self.lock()?.enclaves.contains_key(&record.id) {
                continue;
            }
            let alive = record
                .network
                .as_ref()
                .is_some_and(|n| networks.iter().any(|candidate| candidate.id == n.id));
            if !alive {
                warn!(enclave = %record.id, "enclave network is gone, marking destroyed");
                record.state = EnclaveState::Destroyed;
                self.records.save(&record)?;
                report.destroyed.push(record.id);
                continue;
            }

            let id = record.id.clone();
            match self.restore(record).await {
                Ok(enclave) => {
                    let enclave = Arc::new(enclave);
                    self.lock()?.enclaves.insert(id.clone(), enclave.clone());
                    if enclave.state() == EnclaveState::Running {
                        report.restored.push(id);
                    } else {
                        warn!(enclave = %id, state = %enclave.state(), "finishing interrupted enclave teardown");
                        self.teardown(&enclave).await;
                        report.destroyed.push(id);
                    }
                }
                Err(e) => error!(enclave = %id, error = %e, "could not restore enclave"),
            }
        }
        Ok(report)
    }

    async fn restore(&self, record: EnclaveRecord) -> Result<Enclave> {
        let Some(network) = record.network.clone() else {
            return Err(Error::Internal(format!("enclave '{}' has no network", record.id)));
        };
        let pool = Arc::new(AddressPool::new(network.subnet));
        for ip in &record.reserved_ips {
            pool.reserve(*ip)?;
        }
        let parts = EnclaveParts {
            id: record.id.clone(),
            created_at: record.created_at,
            network,
            pool,
            reserved_ips: record.reserved_ips.clone(),
            control_container_id: record.control_container_id.clone(),
        };
        let enclave = self.assemble(parts, record.state)?;

        let topology: PartitionTopology = record.topology;
        if let Err(e) = enclave.services.restore(record.services, topology).await {
            warn!(enclave = %record.id, error = %e, "services restored with errors");
        }
        for extension in record.extensions {
            let extension_id = extension.id.clone();
            if let Err(e) = enclave.extensions.reattach(extension).await {
                warn!(enclave = %record.id, extension = %extension_id, error = %e, "could not reattach extension");
            }
        }
        if enclave.state() == EnclaveState::Running {
            enclave.persist()?;
        }
        info!(enclave = %record.id, services = enclave.services.services().len(), "restored enclave");
        Ok(enclave)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::InMemoryConnector;
    use crate::runtimes::InMemoryRuntime;
    use std::time::Duration;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> EngineConfig {
        EngineConfig {
            data_dir: dir.path().to_path_buf(),
            network_retry_interval: Duration::ZERO,
            ..EngineConfig::default()
        }
    }

    fn eid(s: &str) -> EnclaveId {
        EnclaveId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_create_reserves_gateway_and_persists() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        let manager =
            EnclaveManager::new(config(&dir), runtime.clone(), Arc::new(InMemoryConnector::echo())).unwrap();

        let enclave = manager.create_enclave(&eid("e1")).await.unwrap();
        assert_eq!(enclave.state(), EnclaveState::Running);
        assert!(enclave.address_pool().is_taken(enclave.network().gateway));
        assert!(runtime.has_network(&enclave.network().id));

        let record = StateStore::new(dir.path()).load(&eid("e1")).unwrap().unwrap();
        assert_eq!(record.state, EnclaveState::Running);
        assert_eq!(record.reserved_ips, vec![enclave.network().gateway]);

        assert!(matches!(
            manager.create_enclave(&eid("e1")).await.unwrap_err(),
            Error::EnclaveAlreadyExists(_)
        ));
    }

    #[tokio::test]
    async fn test_control_container_gets_reserved_address() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        let cfg = EngineConfig {
            control_image: Some("control:latest".to_string()),
            ..config(&dir)
        };
        let manager = EnclaveManager::new(cfg, runtime.clone(), Arc::new(InMemoryConnector::echo())).unwrap();
        let enclave = manager.create_enclave(&eid("e1")).await.unwrap();
        let record = enclave.record().unwrap();
        assert_eq!(record.reserved_ips.len(), 2);
        assert!(record.control_container_id.is_some());
        assert_eq!(runtime.running_container_names(), vec!["enclavenet--e1--control--control".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_network_creation_marks_destroyed() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        runtime.fail_next_network_creates(usize::MAX);
        let cfg = EngineConfig {
            max_network_attempts: 2,
            ..config(&dir)
        };
        let manager = EnclaveManager::new(cfg, runtime, Arc::new(InMemoryConnector::echo())).unwrap();
        let err = manager.create_enclave(&eid("e1")).await.unwrap_err();
        assert!(matches!(err, Error::NoFreeSubnet { .. }));
        let record = StateStore::new(dir.path()).load(&eid("e1")).unwrap().unwrap();
        assert_eq!(record.state, EnclaveState::Destroyed);
        assert!(manager.list_enclaves().is_empty());
        // Destroying the failed enclave again is a no-op.
        assert!(manager.destroy_enclave(&eid("e1")).await.unwrap().is_clean());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        let manager =
            EnclaveManager::new(config(&dir), runtime.clone(), Arc::new(InMemoryConnector::echo())).unwrap();
        let enclave = manager.create_enclave(&eid("e1")).await.unwrap();
        enclave
            .add_service(&ServiceId::new("s1").unwrap(), ServiceConfig::new("app"))
            .await
            .unwrap();

        let report = manager.destroy_enclave(&eid("e1")).await.unwrap();
        assert!(report.is_clean(), "{report}");
        assert_eq!(enclave.state(), EnclaveState::Destroyed);
        assert_eq!(runtime.network_count(), 0);
        assert!(runtime.container_names().is_empty());
        assert_eq!(enclave.address_pool().allocated_count(), 0);

        assert!(manager.destroy_enclave(&eid("e1")).await.unwrap().is_clean());
        assert!(matches!(
            enclave
                .add_service(&ServiceId::new("s2").unwrap(), ServiceConfig::new("app"))
                .await
                .unwrap_err(),
            Error::InvalidState { .. }
        ));
        assert!(matches!(
            manager.destroy_enclave(&eid("nope")).await.unwrap_err(),
            Error::EnclaveNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_destroy_continues_past_failures() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        let manager =
            EnclaveManager::new(config(&dir), runtime.clone(), Arc::new(InMemoryConnector::echo())).unwrap();
        let enclave = manager.create_enclave(&eid("e1")).await.unwrap();
        let s1 = enclave
            .add_service(&ServiceId::new("s1").unwrap(), ServiceConfig::new("app"))
            .await
            .unwrap();
        runtime.fail_container_kill(format!("service--{}", s1.guid));

        let report = manager.destroy_enclave(&eid("e1")).await.unwrap();
        // Service removal fails twice (registry pass and label sweep) and
        // the network cannot be removed while the container is attached.
        assert!(report.failures().len() >= 2);
        assert!(report.failures().iter().any(|f| f.object.starts_with("network")));
        assert_eq!(enclave.state(), EnclaveState::Destroyed);
        assert_eq!(runtime.container_names().len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_restores_running_enclaves() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        let connector = Arc::new(InMemoryConnector::echo());
        {
            let manager = EnclaveManager::new(config(&dir), runtime.clone(), connector.clone()).unwrap();
            let enclave = manager.create_enclave(&eid("keep")).await.unwrap();
            enclave
                .add_service(&ServiceId::new("s1").unwrap(), ServiceConfig::new("app"))
                .await
                .unwrap();
            enclave
                .load_extension(&ExtensionId::new("x").unwrap(), "ext", "{}")
                .await
                .unwrap();
            let gone = manager.create_enclave(&eid("gone")).await.unwrap();
            runtime.remove_network(&gone.network().id).await.unwrap();
        }

        let manager = EnclaveManager::new(config(&dir), runtime.clone(), connector).unwrap();
        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.restored, vec![eid("keep")]);
        assert_eq!(report.destroyed, vec![eid("gone")]);

        let enclave = manager.get_enclave(&eid("keep")).unwrap();
        let services = enclave.service_network().services();
        assert_eq!(services.len(), 1);
        assert!(enclave.address_pool().is_taken(services[0].ip));
        assert_eq!(
            enclave
                .execute_extension(&ExtensionId::new("x").unwrap(), "hi")
                .await
                .unwrap(),
            "hi"
        );
        assert!(manager.get_enclave(&eid("gone")).is_err());
    }

    #[tokio::test]
    async fn test_reused_id_starts_with_empty_artifact_cache() {
        let dir = TempDir::new().unwrap();
        let manager = EnclaveManager::new(
            config(&dir),
            Arc::new(InMemoryRuntime::new()),
            Arc::new(InMemoryConnector::echo()),
        )
        .unwrap();

        let first = manager.create_enclave(&eid("e1")).await.unwrap();
        let secret = first.store_artifact(Some("secret"), b"old-enclave-data").unwrap();
        let blob = first.artifacts().root().join(&secret.relative_path);
        assert!(blob.exists());

        assert!(manager.destroy_enclave(&eid("e1")).await.unwrap().is_clean());
        assert!(!blob.exists());

        let second = manager.create_enclave(&eid("e1")).await.unwrap();
        assert!(second.artifacts().list().is_empty());
        assert!(matches!(
            second.artifacts().read("secret").unwrap_err(),
            Error::ArtifactNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_failed_record_save_keeps_added_service() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir);
        let record_path = cfg
            .enclave_dir("e1")
            .join(crate::constants::ENCLAVE_RECORD_FILE);
        let manager = EnclaveManager::new(cfg, Arc::new(InMemoryRuntime::new()), Arc::new(InMemoryConnector::echo()))
            .unwrap();
        let enclave = manager.create_enclave(&eid("e1")).await.unwrap();

        // A directory in place of the record makes every save fail.
        std::fs::remove_file(&record_path).unwrap();
        std::fs::create_dir(&record_path).unwrap();

        let service = enclave
            .add_service(&ServiceId::new("s1").unwrap(), ServiceConfig::new("app"))
            .await
            .unwrap();
        assert_eq!(enclave.service_network().services(), vec![service]);
    }
}
