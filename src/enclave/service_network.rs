//! Services of one enclave and the partition rules between them.
//!
//! Two locks guard the service network:
//!
//! - the **update gate** (async) serializes every change to the topology,
//!   including the sidecar pushes it triggers, so no two repartitions or
//!   service additions interleave their mutation phases
//! - the **state lock** (sync) guards the registry itself and is held only
//!   for in-memory bookkeeping, never across a runtime call
//!
//! A topology change is computed on a copy, pushed to every sidecar, and
//! committed only once every push succeeded. If a push fails, the previous
//! rules are pushed back and the topology is left as it was.

use crate::artifact::archive;
use crate::config::EngineConfig;
use crate::constants::{LABEL_GUID, MAX_COMMAND_ARGS};
use crate::error::{Error, Result, TeardownReport};
use crate::ids::{PartitionId, ServiceGuid, ServiceId};
use crate::naming::ObjectKind;
use crate::partition::topology::ConnectionEntry;
use crate::partition::{
    ConnectionOverrides, ConnectionState, NetworkingSidecar, PartitionConnectionId,
    PartitionMembers, PartitionTopology, PeerRule, SidecarRules,
};
use crate::persistence::ServiceRecord;
use crate::runtime::{ContainerStatus, ExecResult, Labels};
use crate::service::{
    AddressRequest, ArtifactMount, HttpEndpointCheck, LaunchRequest, PublishedPort, Service,
    ServiceConfig, ServiceLauncher, availability,
};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{info, instrument, warn};

/// Capability sidecars need to run `tc`.
const SIDECAR_CAPABILITY: &str = "NET_ADMIN";

/// A repartition request addressed by service ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepartitionRequest {
    /// New partitions and their members.
    pub partitions: BTreeMap<PartitionId, BTreeSet<ServiceId>>,
    /// Connection overrides between partitions.
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
    /// Connection of every pair without an override.
    #[serde(default)]
    pub default_connection: ConnectionState,
}

struct RegisteredService {
    service: Service,
    sidecar: Option<Arc<NetworkingSidecar>>,
}

#[derive(Default)]
struct NetworkState {
    services: BTreeMap<ServiceId, RegisteredService>,
    /// IDs of services being launched.
    pending: BTreeSet<ServiceId>,
    topology: PartitionTopology,
}

type SidecarPush = (Arc<NetworkingSidecar>, SidecarRules);

impl NetworkState {
    fn find(&self, id: &ServiceId) -> Result<&RegisteredService> {
        self.services
            .get(id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))
    }

    /// Rules every sidecar must enforce under `topology`.
    fn sidecar_pushes(&self, topology: &PartitionTopology) -> Result<Vec<SidecarPush>> {
        let by_guid: BTreeMap<&ServiceGuid, &RegisteredService> = self
            .services
            .values()
            .map(|r| (&r.service.guid, r))
            .collect();

        let mut pushes = Vec::new();
        for guid in topology.services() {
            let Some(sidecar) = by_guid.get(guid).and_then(|r| r.sidecar.clone()) else {
                continue;
            };
            let mut rules = SidecarRules::default();
            for (partition, connection) in topology.effective_connections(guid)? {
                let ips = topology
                    .partitions()
                    .get(&partition)
                    .map(|members| {
                        members
                            .iter()
                            .filter_map(|m| by_guid.get(m).map(|r| r.service.ip))
                            .collect()
                    })
                    .unwrap_or_default();
                rules.peers.insert(partition, PeerRule { ips, connection });
            }
            pushes.push((sidecar, rules));
        }
        Ok(pushes)
    }

    fn sync_partitions(&mut self) {
        for registered in self.services.values_mut() {
            if let Some(partition) = self.topology.partition_of(&registered.service.guid) {
                registered.service.partition = partition.clone();
            }
        }
    }
}

/// Registry of an enclave's services, their sidecars, and the partition
/// topology.
pub struct ServiceNetwork {
    launcher: ServiceLauncher,
    partitioning_enabled: bool,
    sidecar_image: String,
    sidecar_interface: String,
    workers: usize,
    update_gate: tokio::sync::Mutex<()>,
    state: Mutex<NetworkState>,
}

impl ServiceNetwork {
    /// Creates an empty service network.
    #[must_use]
    pub fn new(launcher: ServiceLauncher, config: &EngineConfig) -> Self {
        Self {
            launcher,
            partitioning_enabled: config.partitioning_enabled,
            sidecar_image: config.sidecar_image.clone(),
            sidecar_interface: config.sidecar_interface.clone(),
            workers: config.worker_pool_size.max(1),
            update_gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(NetworkState::default()),
        }
    }

    /// The launcher services are started with.
    #[must_use]
    pub fn launcher(&self) -> &ServiceLauncher {
        &self.launcher
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, NetworkState>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn ensure_partitioning(&self) -> Result<()> {
        if self.partitioning_enabled {
            Ok(())
        } else {
            Err(Error::NotSupported(
                "partitioning is disabled for this engine".to_string(),
            ))
        }
    }

    // =========================================================================
    // Services
    // =========================================================================

    /// Launches a service and, with partitioning enabled, its sidecar.
    ///
    /// The service joins its partition and its sidecar enforces the current
    /// rules before this returns. Other sidecars are updated with the new
    /// address in the same step.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceAlreadyExists`] if the ID is taken
    /// - [`Error::NotSupported`] for a named partition while partitioning
    ///   is disabled
    /// - launch, expansion, or sidecar errors; everything started for the
    ///   service is removed again
    #[instrument(skip(self, config), fields(service = %id, image = %config.image))]
    pub async fn add_service(&self, id: &ServiceId, config: ServiceConfig) -> Result<Service> {
        let partition = config.partition.clone().unwrap_or_default();
        if !partition.is_default() {
            self.ensure_partitioning()?;
        }
        {
            let mut state = self.lock()?;
            if state.services.contains_key(id) || !state.pending.insert(id.clone()) {
                return Err(Error::ServiceAlreadyExists(id.to_string()));
            }
        }

        let result = self.start_service(id, config, partition).await;
        if let Ok(mut state) = self.state.lock() {
            state.pending.remove(id);
        }
        result
    }

    async fn start_service(
        &self,
        id: &ServiceId,
        config: ServiceConfig,
        partition: PartitionId,
    ) -> Result<Service> {
        let guid = ServiceGuid::generate(id);
        let mut request = LaunchRequest::new(ObjectKind::Service, guid.as_str(), config.image);
        request.id = Some(id.to_string());
        request.ports = config.ports.clone();
        request.env = config.env;
        request.entrypoint = config.entrypoint;
        request.cmd = config.cmd;
        request.artifacts = config
            .files_artifacts
            .into_iter()
            .map(|(identifier, mount_path)| ArtifactMount {
                identifier,
                mount_path,
            })
            .collect();
        request.address = config
            .static_ip
            .map_or(AddressRequest::Allocate, AddressRequest::Static);

        let launched = self.launcher.launch(request).await?;
        let Some(ip) = launched.ip else {
            return Err(Error::Internal(format!("service '{id}' launched without an address")));
        };
        let service = Service {
            id: id.clone(),
            guid: guid.clone(),
            ip,
            container_id: launched.container_id,
            ports: config.ports,
            partition: partition.clone(),
            artifact_volumes: launched.artifact_volumes,
            published_ports: launched
                .host_port_bindings
                .into_iter()
                .map(|(port, binding)| PublishedPort { port, binding })
                .collect(),
        };

        let sidecar = if self.partitioning_enabled {
            match self.start_sidecar(&guid, &service.container_id).await {
                Ok(sidecar) => Some(sidecar),
                Err(e) => {
                    self.discard(&service, None).await;
                    return Err(e);
                }
            }
        } else {
            None
        };

        let _gate = self.update_gate.lock().await;
        let registered = self.lock().map(|mut state| {
            state.services.insert(
                id.clone(),
                RegisteredService {
                    service: service.clone(),
                    sidecar: sidecar.clone(),
                },
            );
        });
        if let Err(e) = registered {
            self.discard(&service, sidecar.as_deref()).await;
            return Err(e);
        }

        let guid_for_topology = guid.clone();
        if let Err(e) = self
            .apply_topology(move |t| t.add_service(guid_for_topology, Some(partition)))
            .await
        {
            if let Ok(mut state) = self.state.lock() {
                state.services.remove(id);
            }
            self.discard(&service, sidecar.as_deref()).await;
            return Err(e);
        }
        info!(guid = %guid, ip = %service.ip, partition = %service.partition, "added service");
        Ok(service)
    }

    async fn start_sidecar(
        &self,
        guid: &ServiceGuid,
        container_id: &str,
    ) -> Result<Arc<NetworkingSidecar>> {
        let mut request = LaunchRequest::new(ObjectKind::Sidecar, guid.as_str(), &self.sidecar_image);
        request.owner_guid = Some(guid.to_string());
        request.address = AddressRequest::SharedNamespace(container_id.to_string());
        request.capabilities = vec![SIDECAR_CAPABILITY.to_string()];
        request.entrypoint = Some(vec!["sleep".to_string()]);
        request.cmd = Some(vec!["infinity".to_string()]);

        let launched = self.launcher.launch(request).await?;
        let sidecar = Arc::new(NetworkingSidecar::new(
            guid.clone(),
            launched.container_id,
            self.sidecar_interface.clone(),
        ));
        if let Err(e) = sidecar.initialize(self.launcher.runtime().as_ref()).await {
            if let Err(remove_err) = self.launcher.destroy(sidecar.container_id()).await {
                warn!(
                    container = %sidecar.container_id(),
                    error = %remove_err,
                    "ACTION REQUIRED: could not remove sidecar that failed to initialize"
                );
            }
            return Err(e);
        }
        Ok(sidecar)
    }

    /// Removes everything started for a service, collecting failures.
    async fn discard(&self, service: &Service, sidecar: Option<&NetworkingSidecar>) -> TeardownReport {
        let mut report = TeardownReport::new();
        if let Some(sidecar) = sidecar
            && let Err(e) = self.launcher.destroy(sidecar.container_id()).await
        {
            report.record(
                format!("sidecar of {} (container {})", service.id, sidecar.container_id()),
                e,
            );
        }
        if let Err(e) = self
            .launcher
            .destroy_and_release(&service.container_id, Some(service.ip))
            .await
        {
            report.record(
                format!("service {} (container {})", service.id, service.container_id),
                e,
            );
        }
        report.merge(self.launcher.remove_volumes(&service.artifact_volumes).await);
        report
    }

    /// Removes a service and its sidecar and releases its address.
    ///
    /// Remaining sidecars stop matching the address before the containers
    /// are removed.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceNotFound`] if the ID is unknown
    /// - a sidecar push error (nothing removed)
    /// - [`Error::Teardown`] listing containers or volumes left behind
    #[instrument(skip(self), fields(service = %id))]
    pub async fn remove_service(&self, id: &ServiceId) -> Result<()> {
        let _gate = self.update_gate.lock().await;
        let guid = self.lock()?.find(id)?.service.guid.clone();
        self.apply_topology(|t| {
            t.remove_service(&guid);
            Ok(())
        })
        .await?;

        let registered = self
            .lock()?
            .services
            .remove(id)
            .ok_or_else(|| Error::ServiceNotFound(id.to_string()))?;
        let report = self
            .discard(&registered.service, registered.sidecar.as_deref())
            .await;
        info!(guid = %registered.service.guid, "removed service");
        report.into_result()
    }

    /// Runs a command in a service container.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for an empty or oversized command
    /// - [`Error::ServiceNotFound`] if the ID is unknown
    pub async fn exec(&self, id: &ServiceId, command: &[String]) -> Result<ExecResult> {
        if command.is_empty() {
            return Err(Error::InvalidInput("command cannot be empty".to_string()));
        }
        if command.len() > MAX_COMMAND_ARGS {
            return Err(Error::InvalidInput(format!(
                "command has {} arguments, at most {MAX_COMMAND_ARGS} allowed",
                command.len()
            )));
        }
        let container_id = self.lock()?.find(id)?.service.container_id.clone();
        self.launcher.runtime().exec(&container_id, command).await
    }

    /// Freezes a service's processes. Its sidecar keeps running.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] if the ID is unknown, or the runtime's
    /// refusal (e.g. already paused).
    #[instrument(skip(self), fields(service = %id))]
    pub async fn pause_service(&self, id: &ServiceId) -> Result<()> {
        let container_id = self.lock()?.find(id)?.service.container_id.clone();
        self.launcher.runtime().pause_container(&container_id).await?;
        info!("paused service");
        Ok(())
    }

    /// Resumes a paused service.
    ///
    /// # Errors
    ///
    /// As [`ServiceNetwork::pause_service`].
    #[instrument(skip(self), fields(service = %id))]
    pub async fn unpause_service(&self, id: &ServiceId) -> Result<()> {
        let container_id = self.lock()?.find(id)?.service.container_id.clone();
        self.launcher.runtime().unpause_container(&container_id).await?;
        info!("unpaused service");
        Ok(())
    }

    /// Runtime status of a service's container.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceNotFound`] if the ID is unknown or its container is
    /// gone.
    pub async fn service_status(&self, id: &ServiceId) -> Result<ContainerStatus> {
        let service = self.get_service(id)?;
        let mut labels = Labels::new();
        labels.insert(LABEL_GUID.to_string(), service.guid.as_str().to_string());
        self.launcher
            .runtime()
            .list_containers(&labels)
            .await?
            .into_iter()
            .find(|c| c.id == service.container_id)
            .map(|c| c.status)
            .ok_or_else(|| Error::ServiceNotFound(format!("{id} (container {} is gone)", service.container_id)))
    }

    /// Copies `path` out of a service container as `.tgz` artifact content.
    ///
    /// The archive holds one top-level entry named after the basename of
    /// `path`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] for a relative or empty path
    /// - [`Error::ServiceNotFound`] if the ID is unknown
    /// - the runtime's error if the path does not exist
    /// - archive errors for an unsafe or oversized tarball
    #[instrument(skip(self), fields(service = %id))]
    pub async fn copy_files_from_service(&self, id: &ServiceId, path: &str) -> Result<Vec<u8>> {
        if !path.starts_with('/') || path.trim_end_matches('/').is_empty() {
            return Err(Error::InvalidInput(format!(
                "source path '{path}' must be absolute and not '/'"
            )));
        }
        let container_id = self.lock()?.find(id)?.service.container_id.clone();
        let tar = self
            .launcher
            .runtime()
            .copy_from_container(&container_id, path)
            .await?;
        archive::compress_tar(&tar)
    }

    /// Waits until a service answers an HTTP check on its private IP.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceNotFound`] if the ID is unknown
    /// - [`Error::InvalidState`] unless the service container is running
    /// - [`Error::EndpointUnavailable`] once the retries are spent
    #[instrument(skip(self, check), fields(service = %id, port = check.port))]
    pub async fn wait_for_http_endpoint(&self, id: &ServiceId, check: &HttpEndpointCheck) -> Result<()> {
        let service = self.get_service(id)?;
        let status = self.service_status(id).await?;
        if status != ContainerStatus::Running {
            return Err(Error::InvalidState {
                object: format!("service {id}"),
                state: status.to_string(),
                expected: ContainerStatus::Running.to_string(),
            });
        }
        availability::wait_for_endpoint(&check.url(service.ip), check).await
    }

    /// A registered service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] if the ID is unknown.
    pub fn get_service(&self, id: &ServiceId) -> Result<Service> {
        Ok(self.lock()?.find(id)?.service.clone())
    }

    /// Every registered service, ordered by ID.
    #[must_use]
    pub fn services(&self) -> Vec<Service> {
        self.lock()
            .map(|s| s.services.values().map(|r| r.service.clone()).collect())
            .unwrap_or_default()
    }

    /// Persistable records of every service.
    #[must_use]
    pub fn records(&self) -> Vec<ServiceRecord> {
        self.lock()
            .map(|s| {
                s.services
                    .values()
                    .map(|r| ServiceRecord {
                        service: r.service.clone(),
                        sidecar_container_id: r.sidecar.as_ref().map(|s| s.container_id().to_string()),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// A copy of the current topology.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the registry lock is poisoned.
    pub fn topology(&self) -> Result<PartitionTopology> {
        Ok(self.lock()?.topology.clone())
    }

    // =========================================================================
    // Partitioning
    // =========================================================================

    /// Replaces partitions, overrides, and the default connection.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupported`] if partitioning is disabled
    /// - [`Error::InvalidTopology`] (nothing changed) for an invalid request
    /// - a sidecar push error (topology and rules restored)
    #[instrument(skip(self, request), fields(partitions = request.partitions.len()))]
    pub async fn repartition(&self, request: RepartitionRequest) -> Result<()> {
        self.ensure_partitioning()?;
        let _gate = self.update_gate.lock().await;

        let (partitions, connections) = {
            let state = self.lock()?;
            let mut partitions = PartitionMembers::new();
            for (partition, members) in request.partitions {
                let mut guids = BTreeSet::new();
                for id in members {
                    let registered = state.services.get(&id).ok_or_else(|| {
                        Error::InvalidTopology(format!(
                            "partition '{partition}' names unknown service '{id}'"
                        ))
                    })?;
                    guids.insert(registered.service.guid.clone());
                }
                partitions.insert(partition, guids);
            }
            let mut connections = ConnectionOverrides::new();
            for entry in request.connections {
                connections.insert(PartitionConnectionId::new(entry.a, entry.b)?, entry.state);
            }
            (partitions, connections)
        };

        let default_connection = request.default_connection;
        self.apply_topology(move |t| t.repartition(partitions, connections, default_connection))
            .await?;
        info!("repartitioned services");
        Ok(())
    }

    /// Sets the connection between two partitions.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupported`] if partitioning is disabled
    /// - [`Error::InvalidTopology`] for `a == b` or an out-of-range state
    pub async fn set_connection(
        &self,
        a: PartitionId,
        b: PartitionId,
        connection: ConnectionState,
    ) -> Result<()> {
        self.ensure_partitioning()?;
        let _gate = self.update_gate.lock().await;
        self.apply_topology(move |t| t.set_connection(a, b, connection))
            .await
    }

    /// Removes the override between two partitions. Returns whether one
    /// existed.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupported`] if partitioning is disabled
    /// - [`Error::InvalidTopology`] for `a == b`
    pub async fn unset_connection(&self, a: PartitionId, b: PartitionId) -> Result<bool> {
        self.ensure_partitioning()?;
        let _gate = self.update_gate.lock().await;
        self.apply_topology(move |t| t.unset_connection(a, b)).await
    }

    /// Replaces the default connection.
    ///
    /// # Errors
    ///
    /// - [`Error::NotSupported`] if partitioning is disabled
    /// - [`Error::InvalidTopology`] for an out-of-range state
    pub async fn set_default_connection(&self, connection: ConnectionState) -> Result<()> {
        self.ensure_partitioning()?;
        let _gate = self.update_gate.lock().await;
        self.apply_topology(move |t| t.set_default_connection(connection))
            .await
    }

    /// Connection from `from` toward `to` as enforced by `from`'s sidecar.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] if either service is unknown.
    pub async fn connection_between(&self, from: &ServiceId, to: &ServiceId) -> Result<ConnectionState> {
        let (sidecar, target) = {
            let state = self.lock()?;
            let source = state.find(from)?;
            (source.sidecar.clone(), state.find(to)?.service.ip)
        };
        let Some(sidecar) = sidecar else {
            return Ok(ConnectionState::allowed());
        };
        Ok(sidecar
            .applied_rules()
            .await
            .map_or_else(ConnectionState::allowed, |rules| rules.connection_to(target)))
    }

    /// Applies `mutate` to a copy of the topology, pushes the resulting
    /// rules, and commits. The caller holds the update gate.
    async fn apply_topology<T, F>(&self, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut PartitionTopology) -> Result<T>,
    {
        let (output, next, pushes) = {
            let state = self.lock()?;
            let mut next = state.topology.clone();
            let output = mutate(&mut next)?;
            let pushes = state.sidecar_pushes(&next)?;
            (output, next, pushes)
        };

        if let Err(e) = self.push(pushes).await {
            let restore = {
                let state = self.lock()?;
                state.sidecar_pushes(&state.topology)?
            };
            if let Err(restore_err) = self.push(restore).await {
                warn!(
                    error = %restore_err,
                    "ACTION REQUIRED: sidecar rules could not be restored after a failed update"
                );
            }
            return Err(e);
        }

        let mut state = self.lock()?;
        state.topology = next;
        state.sync_partitions();
        Ok(output)
    }

    async fn push(&self, pushes: Vec<SidecarPush>) -> Result<()> {
        let runtime = self.launcher.runtime().clone();
        let results: Vec<Result<bool>> = stream::iter(pushes)
            .map(|(sidecar, rules)| {
                let runtime = runtime.clone();
                async move {
                    sidecar
                        .apply(runtime.as_ref(), &rules)
                        .await
                        .inspect_err(|e| {
                            warn!(guid = %sidecar.service_guid(), error = %e, "sidecar update failed");
                        })
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await;
        results.into_iter().collect::<Result<Vec<_>>>()?;
        Ok(())
    }

    // =========================================================================
    // Restart and Teardown
    // =========================================================================

    /// Re-registers services that survived an engine restart.
    ///
    /// Addresses are reserved again, sidecars are reset and re-pushed.
    /// Topology members without a record are dropped and records missing
    /// from the topology rejoin their recorded partition.
    ///
    /// # Errors
    ///
    /// Returns an address conflict or a sidecar push error. Services are
    /// registered either way so they can be removed.
    pub async fn restore(&self, records: Vec<ServiceRecord>, mut topology: PartitionTopology) -> Result<()> {
        let _gate = self.update_gate.lock().await;
        let runtime = self.launcher.runtime().clone();

        let known: BTreeSet<ServiceGuid> = records.iter().map(|r| r.service.guid.clone()).collect();
        let ghosts: Vec<ServiceGuid> = topology.services().filter(|g| !known.contains(*g)).cloned().collect();
        for guid in &ghosts {
            topology.remove_service(guid);
        }

        let mut restored = Vec::with_capacity(records.len());
        let mut first_error = None;
        for record in records {
            let service = record.service;
            if let Err(e) = self.launcher.pool().reserve(service.ip) {
                warn!(service = %service.id, ip = %service.ip, error = %e, "could not reserve restored address");
                first_error.get_or_insert(e);
            }
            if topology.partition_of(&service.guid).is_none() {
                topology.add_service(service.guid.clone(), Some(service.partition.clone()))?;
            }
            let sidecar = match record.sidecar_container_id {
                Some(container_id) if self.partitioning_enabled => {
                    let sidecar = Arc::new(NetworkingSidecar::new(
                        service.guid.clone(),
                        container_id,
                        self.sidecar_interface.clone(),
                    ));
                    if let Err(e) = sidecar.reset(runtime.as_ref()).await {
                        warn!(service = %service.id, error = %e, "could not reset sidecar");
                    }
                    Some(sidecar)
                }
                _ => None,
            };
            restored.push(RegisteredService { service, sidecar });
        }

        let pushes = {
            let mut state = self.lock()?;
            for registered in restored {
                state.services.insert(registered.service.id.clone(), registered);
            }
            state.topology = topology;
            state.sync_partitions();
            state.sidecar_pushes(&state.topology)?
        };
        info!(services = pushes.len(), "restored services");
        self.push(pushes).await?;
        first_error.map_or(Ok(()), Err)
    }

    /// Removes every service and sidecar, continuing past failures.
    pub async fn destroy_all(&self) -> TeardownReport {
        let _gate = self.update_gate.lock().await;
        let mut report = TeardownReport::new();
        let services: Vec<RegisteredService> = match self.lock() {
            Ok(mut state) => {
                state.topology = PartitionTopology::default();
                std::mem::take(&mut state.services).into_values().collect()
            }
            Err(e) => {
                report.record("service registry", e);
                return report;
            }
        };
        for registered in services {
            report.merge(
                self.discard(&registered.service, registered.sidecar.as_deref())
                    .await,
            );
        }
        report
    }
}
