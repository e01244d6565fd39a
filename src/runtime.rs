//! Container runtime trait - the narrow interface the engine drives.
//!
//! Every orchestration component depends only on [`ContainerRuntime`]:
//! - networks: `create_network`, `remove_network`, `list_networks`
//! - volumes: `create_volume`, `remove_volume`, `list_volumes`
//! - containers: `create_and_start_container`, `kill_container`,
//!   `remove_container`, `pause_container`, `unpause_container`,
//!   `wait_for_exit`, `exec`, `copy_from_container`, `container_logs`,
//!   `list_containers`
//!
//! Calls are fallible and may block; callers never hold a registry lock
//! across them. Listing is label-filtered so a restarted engine can find the
//! objects it owns.

use crate::error::Result;
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Object labels, kept sorted so generated commands are deterministic.
pub type Labels = BTreeMap<String, String>;

// =============================================================================
// Ports
// =============================================================================

/// Transport protocol of a declared port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    /// TCP.
    #[default]
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
            Self::Sctp => write!(f, "sctp"),
        }
    }
}

/// A port a container listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port number inside the container.
    pub number: u16,
    /// Transport protocol.
    #[serde(default)]
    pub protocol: TransportProtocol,
}

impl PortSpec {
    /// A TCP port.
    #[must_use]
    pub fn tcp(number: u16) -> Self {
        Self {
            number,
            protocol: TransportProtocol::Tcp,
        }
    }
}

impl std::fmt::Display for PortSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.number, self.protocol)
    }
}

/// Where a published port is reachable on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPortBinding {
    /// Host interface address.
    pub host_ip: String,
    /// Ephemeral host port.
    pub host_port: u16,
}

// =============================================================================
// Specs
// =============================================================================

/// Request to create an isolated network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkSpec {
    /// Network name.
    pub name: String,
    /// Subnet of the network.
    pub subnet: Ipv4Network,
    /// Gateway address inside the subnet.
    pub gateway: Ipv4Addr,
    /// Labels attached to the network.
    pub labels: Labels,
}

/// A network as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Runtime-assigned network ID.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Configured subnets (a network may have none, e.g. `host`).
    pub subnets: Vec<Ipv4Network>,
    /// Labels.
    pub labels: Labels,
}

/// Source of a container mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    /// Named runtime volume.
    Volume(String),
    /// Host directory.
    Bind(PathBuf),
}

/// A mount inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// What is mounted.
    pub source: MountSource,
    /// Absolute path inside the container.
    pub target: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// How a container joins the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkAttachment {
    /// Attach to a network with a fixed address.
    Network {
        /// Runtime network ID.
        network_id: String,
        /// Address inside the network's subnet.
        ip: Ipv4Addr,
    },
    /// Share the network namespace of another container.
    Container(String),
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name (unique on the host).
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Network attachment.
    pub network: NetworkAttachment,
    /// Labels.
    pub labels: Labels,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Command override.
    pub cmd: Option<Vec<String>>,
    /// Declared ports.
    pub ports: Vec<PortSpec>,
    /// Publish declared ports to ephemeral host ports.
    pub publish_ports: bool,
    /// Mounts.
    pub mounts: Vec<Mount>,
    /// Extra Linux capabilities (e.g. `NET_ADMIN` for sidecars).
    pub capabilities: Vec<String>,
}

impl ContainerSpec {
    /// A spec with only the required fields set.
    #[must_use]
    pub fn new(name: impl Into<String>, image: impl Into<String>, network: NetworkAttachment) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            network,
            labels: Labels::new(),
            env: BTreeMap::new(),
            entrypoint: None,
            cmd: None,
            ports: Vec::new(),
            publish_ports: false,
            mounts: Vec::new(),
            capabilities: Vec::new(),
        }
    }
}

/// A container that was created and started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedContainer {
    /// Runtime-assigned container ID.
    pub id: String,
    /// Host bindings of published ports.
    pub host_port_bindings: BTreeMap<PortSpec, HostPortBinding>,
}

// =============================================================================
// Container State
// =============================================================================

/// Coarse container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Created but not running.
    Created,
    /// Running.
    Running,
    /// Frozen by `pause_container`.
    Paused,
    /// Exited.
    Exited,
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Exited => write!(f, "exited"),
        }
    }
}

/// A container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Runtime-assigned container ID.
    pub id: String,
    /// Container name.
    pub name: String,
    /// Labels.
    pub labels: Labels,
    /// Status.
    pub status: ContainerStatus,
}

/// Result of command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit code of the command.
    pub exit_code: i64,
    /// Combined standard output and error.
    pub output: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

// =============================================================================
// Container Runtime Trait
// =============================================================================

/// Container runtime interface.
///
/// # Implementations
///
/// - `DockerRuntime`: talks to the Docker Engine API
/// - `InMemoryRuntime`: in-process fake with failure injection, for tests
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    // =========================================================================
    // Networks
    // =========================================================================

    /// Creates a network and returns its ID.
    ///
    /// Returns [`crate::Error::SubnetOverlap`] when the subnet collides with
    /// an existing network.
    async fn create_network(&self, spec: &NetworkSpec) -> Result<String>;

    /// Removes a network. Fails if containers are still attached.
    async fn remove_network(&self, network_id: &str) -> Result<()>;

    /// Lists networks, optionally filtered by labels (all must match).
    async fn list_networks(&self, labels: &Labels) -> Result<Vec<NetworkInfo>>;

    // =========================================================================
    // Volumes
    // =========================================================================

    /// Creates a named volume.
    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<()>;

    /// Removes a named volume.
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Lists volume names matching all labels.
    async fn list_volumes(&self, labels: &Labels) -> Result<Vec<String>>;

    // =========================================================================
    // Containers
    // =========================================================================

    /// Creates and starts a container.
    async fn create_and_start_container(&self, spec: &ContainerSpec) -> Result<StartedContainer>;

    /// Kills a running container (SIGKILL). Killing a stopped container is
    /// not an error.
    async fn kill_container(&self, container_id: &str) -> Result<()>;

    /// Removes a container, killing it first if needed.
    async fn remove_container(&self, container_id: &str) -> Result<()>;

    /// Freezes every process of a running container.
    async fn pause_container(&self, container_id: &str) -> Result<()>;

    /// Resumes a paused container.
    async fn unpause_container(&self, container_id: &str) -> Result<()>;

    /// Waits for a container to exit and returns its exit code.
    async fn wait_for_exit(&self, container_id: &str) -> Result<i64>;

    /// Runs a command inside a running container.
    async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecResult>;

    /// Copies `path` out of a container as an uncompressed tarball whose
    /// single top-level entry is the basename of `path`.
    async fn copy_from_container(&self, container_id: &str, path: &str) -> Result<Vec<u8>>;

    /// Lists containers (running or not) matching all labels.
    async fn list_containers(&self, labels: &Labels) -> Result<Vec<ContainerInfo>>;

    // =========================================================================
    // Optional Operations
    // =========================================================================

    /// Returns a container's combined logs.
    async fn container_logs(&self, container_id: &str) -> Result<String> {
        let _ = container_id;
        Err(crate::error::Error::NotSupported(format!(
            "logs not supported by {} runtime",
            self.name()
        )))
    }
}
