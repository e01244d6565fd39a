//! Container launching on the enclave network.
//!
//! [`ServiceLauncher::launch`] is the single path through which the engine
//! starts long-running containers:
//!
//! 1. reserve an address (allocated, fixed, or none for shared namespaces)
//! 2. expand requested files artifacts into fresh volumes
//! 3. create and start the container with the volumes mounted
//!
//! If step 3 fails the address is released and the expansion volumes are
//! removed before the error is returned. A failed expansion in step 2 never
//! leaves a container behind because none was created yet.
//!
//! [`ServiceLauncher::run_to_completion`] starts a throwaway container on a
//! temporary address, waits for it with a timeout, and always removes it.

use crate::artifact::expander::{ArtifactExpander, ExpandedArtifact};
use crate::error::{Error, Result, TeardownReport};
use crate::naming::{ObjectAttributes, ObjectKind, ObjectNamer};
use crate::network::AddressPool;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, HostPortBinding, Mount, MountSource, NetworkAttachment, PortSpec,
};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How a launched container gets its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressRequest {
    /// Take the next free address from the pool.
    Allocate,
    /// Reserve this address.
    Static(Ipv4Addr),
    /// Join another container's network namespace; no address of its own.
    SharedNamespace(String),
}

/// A files artifact to expand and mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactMount {
    /// Artifact UUID, UUID prefix, or name.
    pub identifier: String,
    /// Absolute mount path inside the container.
    pub mount_path: String,
}

/// Everything needed to launch one container.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Kind of object, for naming and labels.
    pub kind: ObjectKind,
    /// GUID the container is named after.
    pub guid: String,
    /// User-facing ID, recorded as a label.
    pub id: Option<String>,
    /// Service owning this container (sidecars).
    pub owner_guid: Option<String>,
    /// Image reference.
    pub image: String,
    /// Declared ports.
    pub ports: Vec<PortSpec>,
    /// Environment.
    pub env: BTreeMap<String, String>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Command override.
    pub cmd: Option<Vec<String>>,
    /// Extra mounts.
    pub mounts: Vec<Mount>,
    /// Files artifacts to expand before creation.
    pub artifacts: Vec<ArtifactMount>,
    /// Address source.
    pub address: AddressRequest,
    /// Extra capabilities.
    pub capabilities: Vec<String>,
}

impl LaunchRequest {
    /// A request with only kind, GUID, and image set.
    #[must_use]
    pub fn new(kind: ObjectKind, guid: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            kind,
            guid: guid.into(),
            id: None,
            owner_guid: None,
            image: image.into(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            entrypoint: None,
            cmd: None,
            mounts: Vec::new(),
            artifacts: Vec::new(),
            address: AddressRequest::Allocate,
            capabilities: Vec::new(),
        }
    }
}

/// A container started by [`ServiceLauncher::launch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedContainer {
    /// Runtime container ID.
    pub container_id: String,
    /// Container name.
    pub name: String,
    /// Address, unless the container shares a namespace.
    pub ip: Option<Ipv4Addr>,
    /// Host bindings of published ports.
    pub host_port_bindings: BTreeMap<PortSpec, HostPortBinding>,
    /// Volumes holding expanded artifacts.
    pub artifact_volumes: Vec<String>,
}

/// Output of a container run to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRun {
    /// Exit code.
    pub exit_code: i64,
    /// Logs, collected only for non-zero exits.
    pub logs: String,
}

/// Starts and stops containers on one enclave network.
///
/// Cheap to clone; clones share the address pool and runtime.
#[derive(Clone)]
pub struct ServiceLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    namer: ObjectNamer,
    network_id: String,
    pool: Arc<AddressPool>,
    expander: Arc<ArtifactExpander>,
    publish_ports: bool,
}

impl ServiceLauncher {
    /// Creates a launcher for the network `network_id`.
    #[must_use]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        namer: ObjectNamer,
        network_id: String,
        pool: Arc<AddressPool>,
        expander: Arc<ArtifactExpander>,
        publish_ports: bool,
    ) -> Self {
        Self {
            runtime,
            namer,
            network_id,
            pool,
            expander,
            publish_ports,
        }
    }

    /// The container runtime.
    #[must_use]
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// The enclave's namer.
    #[must_use]
    pub fn namer(&self) -> &ObjectNamer {
        &self.namer
    }

    /// The enclave's address pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    fn acquire_address(&self, request: &AddressRequest) -> Result<Option<Ipv4Addr>> {
        match request {
            AddressRequest::Allocate => Ok(Some(self.pool.get_free_ip()?)),
            AddressRequest::Static(ip) => {
                self.pool.reserve(*ip)?;
                Ok(Some(*ip))
            }
            AddressRequest::SharedNamespace(_) => Ok(None),
        }
    }

    fn attachment(&self, request: &AddressRequest, ip: Option<Ipv4Addr>) -> Result<NetworkAttachment> {
        match (request, ip) {
            (AddressRequest::SharedNamespace(owner), _) => Ok(NetworkAttachment::Container(owner.clone())),
            (_, Some(ip)) => Ok(NetworkAttachment::Network {
                network_id: self.network_id.clone(),
                ip,
            }),
            (_, None) => Err(Error::Internal("network attachment without an address".to_string())),
        }
    }

    /// Launches a long-running container.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressPoolExhausted`] or [`Error::InvalidInput`] if no
    ///   address could be reserved
    /// - [`Error::ExpansionFailed`] if an artifact failed to expand; the
    ///   failed volume is kept for inspection
    /// - [`Error::Runtime`] if the runtime refused the container
    #[instrument(skip(self, request), fields(kind = %request.kind, guid = %request.guid))]
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchedContainer> {
        let ip = self.acquire_address(&request.address)?;

        let expanded: Vec<ExpandedArtifact> = if request.artifacts.is_empty() {
            Vec::new()
        } else {
            match self
                .expander
                .expand_all(self, &request.guid, &request.artifacts)
                .await
            {
                Ok(expanded) => expanded,
                Err(e) => {
                    self.release(ip);
                    return Err(e);
                }
            }
        };

        let name = self.namer.object_name(request.kind, &request.guid);
        let result = self.create(&request, &name, ip, &expanded).await;
        match result {
            Ok(started) => {
                info!(container = %started.id, ip = ?ip, name = %name, "launched container");
                Ok(LaunchedContainer {
                    container_id: started.id,
                    name,
                    ip,
                    host_port_bindings: started.host_port_bindings,
                    artifact_volumes: expanded.into_iter().map(|e| e.volume).collect(),
                })
            }
            Err(e) => {
                self.release(ip);
                let volumes: Vec<String> = expanded.into_iter().map(|e| e.volume).collect();
                let report = self.remove_volumes(&volumes).await;
                if !report.is_clean() {
                    warn!(name = %name, "launch failed and expansion volumes could not all be removed");
                }
                Err(e)
            }
        }
    }

    async fn create(
        &self,
        request: &LaunchRequest,
        name: &str,
        ip: Option<Ipv4Addr>,
        expanded: &[ExpandedArtifact],
    ) -> Result<crate::runtime::StartedContainer> {
        let mut spec = ContainerSpec::new(name, &request.image, self.attachment(&request.address, ip)?);
        spec.labels = self.namer.object_labels(
            request.kind,
            &ObjectAttributes {
                guid: Some(request.guid.clone()),
                id: request.id.clone(),
                private_ip: ip,
                owner_guid: request.owner_guid.clone(),
            },
        );
        spec.env = request.env.clone();
        spec.entrypoint = request.entrypoint.clone();
        spec.cmd = request.cmd.clone();
        spec.ports = request.ports.clone();
        spec.publish_ports = self.publish_ports && !request.ports.is_empty();
        spec.capabilities = request.capabilities.clone();
        spec.mounts = request.mounts.clone();
        spec.mounts.extend(expanded.iter().map(|e| Mount {
            source: MountSource::Volume(e.volume.clone()),
            target: e.mount_path.clone(),
            read_only: false,
        }));
        self.runtime.create_and_start_container(&spec).await
    }

    fn release(&self, ip: Option<Ipv4Addr>) {
        if let Some(ip) = ip {
            self.pool.release_ip(ip);
        }
    }

    /// Runs a throwaway container to completion on a temporary address.
    ///
    /// The container is removed whether it succeeded or not; a failed
    /// removal is logged for manual cleanup. Logs are collected only when
    /// the exit code is non-zero.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the container does not exit within `timeout`
    /// - address or runtime errors from starting it
    pub async fn run_to_completion(
        &self,
        kind: ObjectKind,
        owner_guid: &str,
        image: &str,
        cmd: Vec<String>,
        mounts: Vec<Mount>,
        timeout: Duration,
    ) -> Result<CompletedRun> {
        let ip = self.pool.get_free_ip()?;
        let name = self.namer.helper_name(kind, owner_guid);
        let mut spec = ContainerSpec::new(
            name.clone(),
            image,
            NetworkAttachment::Network {
                network_id: self.network_id.clone(),
                ip,
            },
        );
        spec.labels = self.namer.object_labels(
            kind,
            &ObjectAttributes {
                private_ip: Some(ip),
                owner_guid: Some(owner_guid.to_string()),
                ..ObjectAttributes::default()
            },
        );
        spec.cmd = Some(cmd);
        spec.mounts = mounts;

        let started = match self.runtime.create_and_start_container(&spec).await {
            Ok(started) => started,
            Err(e) => {
                self.pool.release_ip(ip);
                return Err(e);
            }
        };
        debug!(container = %started.id, name = %name, "started run-to-completion container");

        let outcome = match tokio::time::timeout(timeout, self.runtime.wait_for_exit(&started.id)).await {
            Ok(Ok(exit_code)) => {
                let logs = if exit_code == 0 {
                    String::new()
                } else {
                    self.runtime
                        .container_logs(&started.id)
                        .await
                        .unwrap_or_else(|e| format!("<logs unavailable: {e}>"))
                };
                Ok(CompletedRun { exit_code, logs })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout {
                operation: format!("waiting for {name}"),
                duration: timeout,
            }),
        };

        match self.runtime.remove_container(&started.id).await {
            Ok(()) => {
                self.pool.release_ip(ip);
            }
            Err(e) => {
                // The address stays reserved while the container may still hold it.
                warn!(
                    container = %started.id,
                    name = %name,
                    error = %e,
                    "ACTION REQUIRED: could not remove container, remove it manually"
                );
            }
        }
        outcome
    }

    /// Kills and removes a container.
    ///
    /// # Errors
    ///
    /// Returns the runtime error; the caller records it for manual cleanup.
    pub async fn destroy(&self, container_id: &str) -> Result<()> {
        self.runtime.remove_container(container_id).await?;
        debug!(container = %container_id, "removed container");
        Ok(())
    }

    /// Kills and removes a container, then releases its address.
    ///
    /// The address stays reserved if removal fails, since the container
    /// may still hold it.
    ///
    /// # Errors
    ///
    /// Returns the runtime error from removal.
    pub async fn destroy_and_release(&self, container_id: &str, ip: Option<Ipv4Addr>) -> Result<()> {
        self.destroy(container_id).await?;
        self.release(ip);
        Ok(())
    }

    /// Removes volumes, collecting failures.
    pub async fn remove_volumes(&self, volumes: &[String]) -> TeardownReport {
        let mut report = TeardownReport::new();
        for volume in volumes {
            if let Err(e) = self.runtime.remove_volume(volume).await {
                report.record(format!("volume {volume}"), e);
            }
        }
        report
    }
}
