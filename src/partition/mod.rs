//! # Partitioning
//!
//! Services are grouped into partitions; connectivity between partitions is
//! open, degraded (packet loss, delay), or blocked. [`PartitionTopology`]
//! holds the graph and computes the effective connection of every service
//! toward every other partition. [`NetworkingSidecar`] turns one service's
//! effective connections into `tc` rules inside its network namespace.
//!
//! The topology never talks to the runtime; the enclave's service network
//! computes rules from it and pushes them to the sidecars.

pub mod connection;
pub mod sidecar;
pub mod topology;

pub use self::connection::{ConnectionState, DelayDistribution, PartitionConnectionId};
pub use self::sidecar::{NetworkingSidecar, PeerRule, SidecarRules};
pub use self::topology::{ConnectionOverrides, PartitionMembers, PartitionTopology, TopologySnapshot};
