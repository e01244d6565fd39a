//! Isolated network creation.
//!
//! The provisioner carves fixed-size subnets out of a configured address
//! space. For each attempt it lists the subnets already used by runtime
//! networks, picks the first free candidate starting from an offset derived
//! from the enclave ID, and asks the runtime to create the network. A
//! concurrent creator may claim the same subnet between listing and
//! creation; the runtime then reports an overlap and the provisioner moves
//! on to the next candidate, up to a bounded number of attempts.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ids::EnclaveId;
use crate::network::allocator::AddressPool;
use crate::runtime::{ContainerRuntime, Labels, NetworkSpec};
use ipnetwork::Ipv4Network;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// A network created for an enclave.
#[derive(Debug, Clone)]
pub struct ProvisionedNetwork {
    /// Runtime network ID.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Subnet.
    pub subnet: Ipv4Network,
    /// Gateway address, already reserved in `pool`.
    pub gateway: Ipv4Addr,
    /// Address pool seeded with the gateway.
    pub pool: Arc<AddressPool>,
}

/// Creates and removes enclave networks.
pub struct NetworkProvisioner {
    runtime: Arc<dyn ContainerRuntime>,
    address_space: Ipv4Network,
    prefix_len: u8,
    max_attempts: usize,
    retry_interval: Duration,
}

impl NetworkProvisioner {
    /// Creates a provisioner from engine configuration.
    #[must_use]
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &EngineConfig) -> Self {
        Self {
            runtime,
            address_space: config.address_space,
            prefix_len: config.subnet_prefix_len,
            max_attempts: config.max_network_attempts,
            retry_interval: config.network_retry_interval,
        }
    }

    /// Creates an isolated network for `enclave`.
    ///
    /// # Errors
    ///
    /// - [`Error::NoFreeSubnet`] if the address space is full or every
    ///   attempt collided
    /// - any non-overlap runtime error, unchanged
    #[instrument(skip(self, labels), fields(enclave = %enclave))]
    pub async fn create_network(
        &self,
        enclave: &EnclaveId,
        name: &str,
        labels: &Labels,
    ) -> Result<ProvisionedNetwork> {
        let mut rejected: Vec<Ipv4Network> = Vec::new();
        let start = self.start_offset(enclave);

        for attempt in 1..=self.max_attempts {
            let mut used: Vec<Ipv4Network> = self
                .runtime
                .list_networks(&Labels::new())
                .await?
                .into_iter()
                .flat_map(|n| n.subnets)
                .collect();
            used.extend(rejected.iter().copied());

            let subnet = self
                .free_subnet(&used, start)
                .ok_or_else(|| Error::NoFreeSubnet {
                    attempts: attempt,
                    reason: format!("address space {} is exhausted", self.address_space),
                })?;
            let pool = Arc::new(AddressPool::new(subnet));
            let gateway = pool.get_free_ip()?;

            let spec = NetworkSpec {
                name: name.to_string(),
                subnet,
                gateway,
                labels: labels.clone(),
            };
            match self.runtime.create_network(&spec).await {
                Ok(id) => {
                    info!(network = %id, subnet = %subnet, gateway = %gateway, "created enclave network");
                    return Ok(ProvisionedNetwork {
                        id,
                        name: name.to_string(),
                        subnet,
                        gateway,
                        pool,
                    });
                }
                Err(Error::SubnetOverlap { .. }) => {
                    warn!(
                        subnet = %subnet,
                        attempt,
                        max_attempts = self.max_attempts,
                        "subnet already in use, retrying with another candidate"
                    );
                    rejected.push(subnet);
                    if attempt < self.max_attempts && !self.retry_interval.is_zero() {
                        tokio::time::sleep(self.retry_interval).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::NoFreeSubnet {
            attempts: self.max_attempts,
            reason: "every candidate subnet collided with another network".to_string(),
        })
    }

    /// Removes an enclave network.
    ///
    /// Containers must already be detached. Failures are returned for the
    /// caller to record; teardown continues regardless.
    pub async fn destroy_network(&self, network_id: &str) -> Result<()> {
        self.runtime.remove_network(network_id).await?;
        info!(network = %network_id, "removed enclave network");
        Ok(())
    }

    fn candidate_count(&self) -> u64 {
        1u64 << (self.prefix_len - self.address_space.prefix())
    }

    fn candidate(&self, index: u64) -> Option<Ipv4Network> {
        let base = u64::from(u32::from(self.address_space.network()));
        let step = 1u64 << (32 - u32::from(self.prefix_len));
        let addr = u32::try_from(base + index * step).ok()?;
        Ipv4Network::new(Ipv4Addr::from(addr), self.prefix_len).ok()
    }

    /// Spreads concurrent enclaves across the space so they rarely race for
    /// the same candidate.
    fn start_offset(&self, enclave: &EnclaveId) -> u64 {
        let digest = Sha256::digest(enclave.as_str().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes) % self.candidate_count()
    }

    fn free_subnet(&self, used: &[Ipv4Network], start: u64) -> Option<Ipv4Network> {
        let count = self.candidate_count();
        (0..count)
            .filter_map(|k| self.candidate((start + k) % count))
            .find(|candidate| {
                !is_multicast(candidate) && !used.iter().any(|u| overlaps(candidate, u))
            })
    }
}

/// Subnets are at least /29 and aligned, so touching 224.0.0.0/4 at either
/// end means lying inside it.
fn is_multicast(n: &Ipv4Network) -> bool {
    n.network().is_multicast() || n.broadcast().is_multicast()
}

fn overlaps(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}
