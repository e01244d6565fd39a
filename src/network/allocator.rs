//! Per-enclave IP address pool.
//!
//! An [`AddressPool`] hands out addresses from one subnet. The network and
//! broadcast addresses are never handed out, and callers may reserve
//! further addresses (the gateway, control containers) up front.
//!
//! ## Invariants
//!
//! - An address is returned by [`AddressPool::get_free_ip`] at most once
//!   until it is released.
//! - Releasing an address that is not allocated is a no-op that returns
//!   `false`. Teardown paths may therefore release unconditionally.
//!
//! All operations take a single mutex for an in-memory scan and never
//! suspend.

use crate::error::{Error, Result};
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tracing::debug;

/// Thread-safe pool of addresses within one subnet.
#[derive(Debug)]
pub struct AddressPool {
    subnet: Ipv4Network,
    taken: Mutex<BTreeSet<Ipv4Addr>>,
}

impl AddressPool {
    /// Creates a pool over `subnet` with nothing allocated.
    #[must_use]
    pub fn new(subnet: Ipv4Network) -> Self {
        Self {
            subnet,
            taken: Mutex::new(BTreeSet::new()),
        }
    }

    /// The subnet this pool allocates from.
    #[must_use]
    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeSet<Ipv4Addr>>> {
        self.taken
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    /// Whether `ip` may ever be handed out by this pool.
    fn is_assignable(&self, ip: Ipv4Addr) -> bool {
        if !self.subnet.contains(ip) {
            return false;
        }
        // /31 and /32 have no network or broadcast address.
        if self.subnet.prefix() >= 31 {
            return true;
        }
        ip != self.subnet.network() && ip != self.subnet.broadcast()
    }

    /// Marks the first free address as taken and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AddressPoolExhausted`] if every address is taken.
    pub fn get_free_ip(&self) -> Result<Ipv4Addr> {
        let mut taken = self.lock()?;
        let ip = self
            .subnet
            .iter()
            .find(|ip| self.is_assignable(*ip) && !taken.contains(ip))
            .ok_or_else(|| Error::AddressPoolExhausted {
                cidr: self.subnet.to_string(),
            })?;
        taken.insert(ip);
        debug!(ip = %ip, subnet = %self.subnet, "allocated address");
        Ok(ip)
    }

    /// Marks a specific address as taken.
    ///
    /// Used for caller-supplied addresses and when rebuilding a pool from
    /// persisted state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the address is outside the subnet,
    /// is the network or broadcast address, or is already taken.
    pub fn reserve(&self, ip: Ipv4Addr) -> Result<()> {
        if !self.is_assignable(ip) {
            return Err(Error::InvalidInput(format!(
                "{ip} is not an assignable address in {}",
                self.subnet
            )));
        }
        let mut taken = self.lock()?;
        if !taken.insert(ip) {
            return Err(Error::InvalidInput(format!("{ip} is already allocated")));
        }
        Ok(())
    }

    /// Returns an address to the pool.
    ///
    /// Returns `true` if the address was allocated, `false` if releasing
    /// was a no-op.
    pub fn release_ip(&self, ip: Ipv4Addr) -> bool {
        let released = match self.lock() {
            Ok(mut taken) => taken.remove(&ip),
            Err(e) => {
                tracing::warn!(ip = %ip, error = %e, "could not release address");
                false
            }
        };
        if !released {
            debug!(ip = %ip, "release of an unallocated address ignored");
        }
        released
    }

    /// Releases every allocated address and returns how many there were.
    pub fn release_all(&self) -> usize {
        match self.lock() {
            Ok(mut taken) => {
                let count = taken.len();
                taken.clear();
                count
            }
            Err(_) => 0,
        }
    }

    /// Whether `ip` is currently allocated.
    #[must_use]
    pub fn is_taken(&self, ip: Ipv4Addr) -> bool {
        self.lock().map(|t| t.contains(&ip)).unwrap_or(false)
    }

    /// Snapshot of every allocated address.
    #[must_use]
    pub fn allocated(&self) -> Vec<Ipv4Addr> {
        self.lock()
            .map(|t| t.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Number of allocated addresses.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.lock().map(|t| t.len()).unwrap_or(0)
    }
}
