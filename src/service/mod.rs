//! # Services
//!
//! A service is a user container on the enclave network with a stable GUID,
//! one private IP, and membership in exactly one partition. Services,
//! extensions, sidecars, and expanders are all started by the same
//! [`ServiceLauncher`], parameterized by [`ObjectKind`](crate::naming::ObjectKind).
//! [`availability`] waits for a service's HTTP endpoint to answer.

pub mod availability;
pub mod launcher;

pub use self::availability::{HttpEndpointCheck, HttpMethod};
pub use self::launcher::{AddressRequest, ArtifactMount, LaunchRequest, LaunchedContainer, ServiceLauncher};

use crate::ids::{PartitionId, ServiceGuid, ServiceId};
use crate::runtime::{HostPortBinding, PortSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

/// A published port and where it is reachable on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPort {
    /// Port inside the container.
    pub port: PortSpec,
    /// Host side of the binding.
    pub binding: HostPortBinding,
}

/// A running service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// User-chosen ID.
    pub id: ServiceId,
    /// System GUID, immutable for the service's lifetime.
    pub guid: ServiceGuid,
    /// Private IP on the enclave network.
    pub ip: Ipv4Addr,
    /// Runtime container ID.
    pub container_id: String,
    /// Declared ports.
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    /// Partition the service belongs to.
    #[serde(default)]
    pub partition: PartitionId,
    /// Volumes holding expanded files artifacts.
    #[serde(default)]
    pub artifact_volumes: Vec<String>,
    /// Host bindings of published ports.
    #[serde(default)]
    pub published_ports: Vec<PublishedPort>,
}

/// Request to add a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Image reference.
    pub image: String,
    /// Declared ports.
    pub ports: Vec<PortSpec>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Entrypoint override.
    pub entrypoint: Option<Vec<String>>,
    /// Command override.
    pub cmd: Option<Vec<String>>,
    /// Files artifacts to expand, keyed by artifact identifier, valued by
    /// mount path.
    pub files_artifacts: BTreeMap<String, String>,
    /// Partition to join; the default partition if unset.
    pub partition: Option<PartitionId>,
    /// Fixed private IP instead of an allocated one.
    pub static_ip: Option<Ipv4Addr>,
}

impl ServiceConfig {
    /// A config running `image` with everything else defaulted.
    #[must_use]
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }
}
