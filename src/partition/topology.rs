//! Partition graph.
//!
//! Services are grouped into disjoint partitions. Connectivity between two
//! partitions is the explicit override for that pair if one exists, else the
//! default connection. Services in the same partition can always reach each
//! other.
//!
//! Every mutating operation validates its whole request before touching any
//! state, so a rejected call leaves the topology unchanged.

use crate::error::{Error, Result};
use crate::ids::{PartitionId, ServiceGuid};
use crate::partition::connection::{ConnectionState, PartitionConnectionId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Partition membership, keyed by partition.
pub type PartitionMembers = BTreeMap<PartitionId, BTreeSet<ServiceGuid>>;

/// Explicit connection overrides.
pub type ConnectionOverrides = BTreeMap<PartitionConnectionId, ConnectionState>;

/// The partition graph of one enclave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "TopologySnapshot", try_from = "TopologySnapshot")]
pub struct PartitionTopology {
    partitions: PartitionMembers,
    service_partitions: BTreeMap<ServiceGuid, PartitionId>,
    connections: ConnectionOverrides,
    default_connection: ConnectionState,
}

impl Default for PartitionTopology {
    fn default() -> Self {
        Self::new(ConnectionState::allowed())
    }
}

impl PartitionTopology {
    /// A topology holding only the (empty) default partition.
    #[must_use]
    pub fn new(default_connection: ConnectionState) -> Self {
        let mut partitions = PartitionMembers::new();
        partitions.insert(PartitionId::default_partition(), BTreeSet::new());
        Self {
            partitions,
            service_partitions: BTreeMap::new(),
            connections: ConnectionOverrides::new(),
            default_connection,
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Partition membership.
    #[must_use]
    pub fn partitions(&self) -> &PartitionMembers {
        &self.partitions
    }

    /// Explicit overrides.
    #[must_use]
    pub fn connections(&self) -> &ConnectionOverrides {
        &self.connections
    }

    /// Connection applied to pairs without an override.
    #[must_use]
    pub fn default_connection(&self) -> ConnectionState {
        self.default_connection
    }

    /// Partition of a service.
    #[must_use]
    pub fn partition_of(&self, guid: &ServiceGuid) -> Option<&PartitionId> {
        self.service_partitions.get(guid)
    }

    /// Number of registered services.
    #[must_use]
    pub fn service_count(&self) -> usize {
        self.service_partitions.len()
    }

    /// Every registered service.
    pub fn services(&self) -> impl Iterator<Item = &ServiceGuid> {
        self.service_partitions.keys()
    }

    /// Connection between two partitions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PartitionNotFound`] if either partition is unknown.
    pub fn connection_between_partitions(
        &self,
        a: &PartitionId,
        b: &PartitionId,
    ) -> Result<ConnectionState> {
        for partition in [a, b] {
            if !self.partitions.contains_key(partition) {
                return Err(Error::PartitionNotFound(partition.to_string()));
            }
        }
        if a == b {
            return Ok(ConnectionState::allowed());
        }
        let key = PartitionConnectionId::new(a.clone(), b.clone())?;
        Ok(self
            .connections
            .get(&key)
            .copied()
            .unwrap_or(self.default_connection))
    }

    /// Connection between the partitions of two services.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] if either service is unknown.
    pub fn connection_between(&self, a: &ServiceGuid, b: &ServiceGuid) -> Result<ConnectionState> {
        let pa = self
            .partition_of(a)
            .ok_or_else(|| Error::ServiceNotFound(a.to_string()))?;
        let pb = self
            .partition_of(b)
            .ok_or_else(|| Error::ServiceNotFound(b.to_string()))?;
        self.connection_between_partitions(pa, pb)
    }

    /// Connection from a service's partition to every other partition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotFound`] if the service is unknown.
    pub fn effective_connections(
        &self,
        guid: &ServiceGuid,
    ) -> Result<BTreeMap<PartitionId, ConnectionState>> {
        let own = self
            .partition_of(guid)
            .ok_or_else(|| Error::ServiceNotFound(guid.to_string()))?;
        self.partitions
            .keys()
            .filter(|p| *p != own)
            .map(|p| Ok((p.clone(), self.connection_between_partitions(own, p)?)))
            .collect()
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Adds a service to `partition` (the default partition if `None`),
    /// creating the partition if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceAlreadyExists`] if the service is registered.
    pub fn add_service(&mut self, guid: ServiceGuid, partition: Option<PartitionId>) -> Result<()> {
        if self.service_partitions.contains_key(&guid) {
            return Err(Error::ServiceAlreadyExists(guid.to_string()));
        }
        let partition = partition.unwrap_or_default();
        self.partitions
            .entry(partition.clone())
            .or_default()
            .insert(guid.clone());
        self.service_partitions.insert(guid, partition);
        Ok(())
    }

    /// Removes a service. Returns whether it was registered.
    pub fn remove_service(&mut self, guid: &ServiceGuid) -> bool {
        let Some(partition) = self.service_partitions.remove(guid) else {
            return false;
        };
        if let Some(members) = self.partitions.get_mut(&partition) {
            members.remove(guid);
        }
        true
    }

    /// Replaces partitions, overrides, and the default connection at once.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] (state unchanged) if:
    /// - no partitions are given
    /// - a registered service is missing or appears twice
    /// - an unknown service is named
    /// - an override names a partition not in `partitions`
    /// - a connection state is out of range
    pub fn repartition(
        &mut self,
        partitions: PartitionMembers,
        connections: ConnectionOverrides,
        default_connection: ConnectionState,
    ) -> Result<()> {
        if partitions.is_empty() {
            return Err(Error::InvalidTopology(
                "cannot repartition with no partitions".to_string(),
            ));
        }

        let mut service_partitions = BTreeMap::new();
        for (partition, members) in &partitions {
            for guid in members {
                if !self.service_partitions.contains_key(guid) {
                    return Err(Error::InvalidTopology(format!(
                        "partition '{partition}' names unknown service '{guid}'"
                    )));
                }
                if let Some(previous) = service_partitions.insert(guid.clone(), partition.clone()) {
                    return Err(Error::InvalidTopology(format!(
                        "service '{guid}' is in both '{previous}' and '{partition}'"
                    )));
                }
            }
        }
        let missing: Vec<String> = self
            .service_partitions
            .keys()
            .filter(|guid| !service_partitions.contains_key(*guid))
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(Error::InvalidTopology(format!(
                "services not assigned to any partition: {}",
                missing.join(", ")
            )));
        }

        for (key, state) in &connections {
            for endpoint in [key.lower(), key.upper()] {
                if !partitions.contains_key(endpoint) {
                    return Err(Error::InvalidTopology(format!(
                        "connection {key} names unknown partition '{endpoint}'"
                    )));
                }
            }
            state.validate()?;
        }
        default_connection.validate()?;

        self.partitions = partitions;
        self.service_partitions = service_partitions;
        self.connections = connections;
        self.default_connection = default_connection;
        Ok(())
    }

    /// Sets the override for `(a, b)`, creating either partition if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if `a == b` or the state is out of
    /// range.
    pub fn set_connection(
        &mut self,
        a: PartitionId,
        b: PartitionId,
        state: ConnectionState,
    ) -> Result<()> {
        state.validate()?;
        let key = PartitionConnectionId::new(a.clone(), b.clone())?;
        self.partitions.entry(a).or_default();
        self.partitions.entry(b).or_default();
        self.connections.insert(key, state);
        Ok(())
    }

    /// Removes the override for `(a, b)` so the pair falls back to the
    /// default connection. Returns whether an override existed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if `a == b`.
    pub fn unset_connection(&mut self, a: PartitionId, b: PartitionId) -> Result<bool> {
        let key = PartitionConnectionId::new(a, b)?;
        Ok(self.connections.remove(&key).is_some())
    }

    /// Replaces the default connection.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopology`] if the state is out of range.
    pub fn set_default_connection(&mut self, state: ConnectionState) -> Result<()> {
        state.validate()?;
        self.default_connection = state;
        Ok(())
    }
}

// =============================================================================
// Persistence Form
// =============================================================================

/// One override in persisted form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEntry {
    /// First partition.
    pub a: PartitionId,
    /// Second partition.
    pub b: PartitionId,
    /// State of the connection.
    pub state: ConnectionState,
}

/// Serialized form of [`PartitionTopology`]; JSON maps need string keys, so
/// overrides are written as a list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologySnapshot {
    /// Partition membership.
    pub partitions: PartitionMembers,
    /// Overrides.
    #[serde(default)]
    pub connections: Vec<ConnectionEntry>,
    /// Default connection.
    pub default_connection: ConnectionState,
}

impl From<PartitionTopology> for TopologySnapshot {
    fn from(topology: PartitionTopology) -> Self {
        Self {
            partitions: topology.partitions,
            connections: topology
                .connections
                .into_iter()
                .map(|(key, state)| ConnectionEntry {
                    a: key.lower().clone(),
                    b: key.upper().clone(),
                    state,
                })
                .collect(),
            default_connection: topology.default_connection,
        }
    }
}

impl TryFrom<TopologySnapshot> for PartitionTopology {
    type Error = Error;

    fn try_from(snapshot: TopologySnapshot) -> Result<Self> {
        let mut topology = Self::new(snapshot.default_connection);
        topology.partitions.clear();
        for (partition, members) in snapshot.partitions {
            for guid in &members {
                if topology
                    .service_partitions
                    .insert(guid.clone(), partition.clone())
                    .is_some()
                {
                    return Err(Error::InvalidTopology(format!(
                        "service '{guid}' appears in more than one partition"
                    )));
                }
            }
            topology.partitions.insert(partition, members);
        }
        for entry in snapshot.connections {
            topology.set_connection(entry.a, entry.b, entry.state)?;
        }
        Ok(topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> PartitionId {
        PartitionId::new(s).unwrap()
    }

    fn g(s: &str) -> ServiceGuid {
        ServiceGuid::parse(s).unwrap()
    }

    #[test]
    fn test_new_service_joins_default_partition() {
        let mut t = PartitionTopology::default();
        t.add_service(g("s1"), None).unwrap();
        assert!(t.partition_of(&g("s1")).unwrap().is_default());
        assert!(matches!(
            t.add_service(g("s1"), None),
            Err(Error::ServiceAlreadyExists(_))
        ));
    }

    #[test]
    fn test_unknown_partition_is_created_on_add() {
        let mut t = PartitionTopology::default();
        t.add_service(g("s1"), Some(p("edge"))).unwrap();
        assert!(t.partitions().contains_key(&p("edge")));
    }

    #[test]
    fn test_remove_service() {
        let mut t = PartitionTopology::default();
        t.add_service(g("s1"), None).unwrap();
        assert!(t.remove_service(&g("s1")));
        assert!(!t.remove_service(&g("s1")));
        assert_eq!(t.service_count(), 0);
    }

    #[test]
    fn test_same_partition_is_always_allowed() {
        let mut t = PartitionTopology::new(ConnectionState::blocked());
        t.add_service(g("s1"), None).unwrap();
        t.add_service(g("s2"), None).unwrap();
        assert!(t.connection_between(&g("s1"), &g("s2")).unwrap().is_unrestricted());
    }

    #[test]
    fn test_set_and_unset_connection() {
        let mut t = PartitionTopology::default();
        t.set_connection(p("a"), p("b"), ConnectionState::lossy(30.0))
            .unwrap();
        assert_eq!(
            t.connection_between_partitions(&p("b"), &p("a")).unwrap(),
            ConnectionState::lossy(30.0)
        );
        assert!(t.unset_connection(p("b"), p("a")).unwrap());
        assert!(!t.unset_connection(p("a"), p("b")).unwrap());
        assert!(t
            .connection_between_partitions(&p("a"), &p("b"))
            .unwrap()
            .is_unrestricted());
    }

    #[test]
    fn test_effective_connections_cover_other_partitions() {
        let mut t = PartitionTopology::default();
        t.add_service(g("s1"), Some(p("a"))).unwrap();
        t.add_service(g("s2"), Some(p("b"))).unwrap();
        t.set_connection(p("a"), p("b"), ConnectionState::blocked())
            .unwrap();
        let effective = t.effective_connections(&g("s1")).unwrap();
        assert_eq!(effective[&p("b")], ConnectionState::blocked());
        assert!(effective[&PartitionId::default_partition()].is_unrestricted());
        assert!(!effective.contains_key(&p("a")));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut t = PartitionTopology::default();
        t.add_service(g("s1"), Some(p("a"))).unwrap();
        t.set_connection(p("a"), p("b"), ConnectionState::blocked())
            .unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: PartitionTopology = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
