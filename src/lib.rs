//! # enclavenet
//!
//! **Enclave Network Orchestration**
//!
//! This crate creates isolated container networks ("enclaves") on a
//! container runtime, launches services into them, and shapes the traffic
//! between groups of services to simulate network partitions, packet loss,
//! and latency. Files artifacts are cached per enclave and expanded into
//! volumes mounted by services; extensions are long-running helper
//! containers reachable over a small JSON protocol.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          EnclaveManager                             │
//! │     create_enclave → Enclave → destroy_enclave      reconcile       │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────┐ ┌──────────────────┐ ┌───────────────┐  │
//! │  │     ServiceNetwork     │ │ FilesArtifactStore│ │ExtensionStore │  │
//! │  │ services + topology    │ │ chunked transfers │ │ JSON over TCP │  │
//! │  │ sidecars (tc rules)    │ │ tgz blobs         │ │               │  │
//! │  └───────────┬────────────┘ └────────┬─────────┘ └──────┬────────┘  │
//! │              └──────────┬────────────┴──────────────────┘           │
//! │                  ┌──────┴────────┐   ┌──────────────────┐           │
//! │                  │ServiceLauncher│──►│ ArtifactExpander │           │
//! │                  └──────┬────────┘   └──────────────────┘           │
//! │                         │  AddressPool     NetworkProvisioner       │
//! ├─────────────────────────┼───────────────────────────────────────────┤
//! │                 ContainerRuntime trait                              │
//! │   ┌──────────────────┐              ┌──────────────────┐            │
//! │   │  DockerRuntime   │              │ InMemoryRuntime  │            │
//! │   └──────────────────┘              └──────────────────┘            │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Enclave Lifecycle
//!
//! ```text
//!   ┌──────────┐  network up  ┌─────────┐  destroy  ┌────────────┐
//!   │ Creating │ ───────────► │ Running │ ────────► │ Destroying │
//!   └────┬─────┘              └─────────┘           └─────┬──────┘
//!        │ failure                                        │
//!        ▼                                                ▼
//!   ┌───────────┐ ◄───────────────────────────────────────┘
//!   │ Destroyed │
//!   └───────────┘
//! ```
//!
//! Every state change and every mutation is written to the enclave record
//! before the call returns, so a restarted engine can rebuild its view with
//! [`EnclaveManager::reconcile`].
//!
//! # Invariants
//!
//! - Each private address in an enclave is held by at most one container,
//!   and the gateway is never handed out.
//! - Every service sees the connection its partition pair resolves to:
//!   a topology change is pushed to every sidecar or rolled back.
//! - Teardown attempts every step and reports what it could not remove.
//! - Registry locks are never held across a runtime call.
//!
//! # Example
//!
//! ```rust,ignore
//! use enclavenet::{EnclaveManager, EngineConfig, ServiceConfig};
//! use enclavenet::extension::TcpConnector;
//! use enclavenet::runtimes::DockerRuntime;
//!
//! let config = EngineConfig::from_env();
//! let runtime = Arc::new(DockerRuntime::from_config(&config)?);
//! let manager = EnclaveManager::new(config, runtime, Arc::new(TcpConnector::new(timeout)))?;
//!
//! let enclave = manager.create_enclave(&"demo".parse()?).await?;
//! enclave.add_service(&"api".parse()?, ServiceConfig::new("api:latest")).await?;
//! manager.destroy_enclave(enclave.id()).await?.into_result()?;
//! ```

pub mod artifact;
pub mod commands;
pub mod config;
pub mod constants;
pub mod enclave;
pub mod error;
pub mod extension;
pub mod ids;
pub mod naming;
pub mod network;
pub mod partition;
pub mod persistence;
pub mod runtime;
pub mod runtimes;
pub mod service;

// Re-exports for convenience
pub use artifact::{FilesArtifact, FilesArtifactStore};
pub use commands::{BulkCommandProcessor, BulkCommands, Command};
pub use config::EngineConfig;
pub use enclave::{Enclave, EnclaveManager, ReconcileReport, RepartitionRequest};
pub use error::{Error, Result, TeardownReport};
pub use ids::{EnclaveId, ExtensionId, PartitionId, ServiceGuid, ServiceId};
pub use partition::{ConnectionState, PartitionTopology};
pub use persistence::EnclaveState;
pub use runtime::{ContainerRuntime, ExecResult};
pub use service::{HttpEndpointCheck, Service, ServiceConfig};
