//! Tests for the enclave address pool.
//!
//! Validates that no address is handed out twice while taken and that
//! released addresses come back.

use enclavenet::Error;
use enclavenet::network::AddressPool;
use ipnetwork::Ipv4Network;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

fn pool(cidr: &str) -> AddressPool {
    AddressPool::new(cidr.parse::<Ipv4Network>().unwrap())
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_allocates_every_host_address_once() {
    let pool = pool("10.1.0.0/28");
    let mut seen = BTreeSet::new();
    while let Ok(ip) = pool.get_free_ip() {
        assert!(seen.insert(ip), "{ip} handed out twice");
    }
    // 16 addresses minus network and broadcast.
    assert_eq!(seen.len(), 14);
    assert!(!seen.contains(&Ipv4Addr::new(10, 1, 0, 0)));
    assert!(!seen.contains(&Ipv4Addr::new(10, 1, 0, 15)));
    assert!(matches!(
        pool.get_free_ip().unwrap_err(),
        Error::AddressPoolExhausted { .. }
    ));
}

#[test]
fn test_released_address_is_reused() {
    let pool = pool("10.1.0.0/29");
    let ips: Vec<_> = (0..6).map(|_| pool.get_free_ip().unwrap()).collect();
    assert!(pool.get_free_ip().is_err());

    assert!(pool.release_ip(ips[2]));
    assert_eq!(pool.get_free_ip().unwrap(), ips[2]);
}

#[test]
fn test_interleaved_allocate_release_never_duplicates() {
    let pool = pool("10.1.0.0/27");
    let mut held: Vec<Ipv4Addr> = Vec::new();
    for round in 0..200usize {
        if round % 3 == 2 && !held.is_empty() {
            let ip = held.remove(round % held.len());
            assert!(pool.release_ip(ip));
        } else if let Ok(ip) = pool.get_free_ip() {
            assert!(!held.contains(&ip), "{ip} handed out while taken");
            held.push(ip);
        }
        assert_eq!(pool.allocated_count(), held.len());
    }
    for ip in held.drain(..) {
        assert!(pool.release_ip(ip));
    }
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn test_concurrent_allocation_is_unique() {
    let pool = Arc::new(pool("10.2.0.0/24"));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            std::thread::spawn(move || (0..30).map(|_| pool.get_free_ip().unwrap()).collect::<Vec<_>>())
        })
        .collect();
    let mut all = BTreeSet::new();
    for handle in handles {
        for ip in handle.join().unwrap() {
            assert!(all.insert(ip), "{ip} handed out twice");
        }
    }
    assert_eq!(all.len(), 240);
}

// =============================================================================
// Reservation Tests
// =============================================================================

#[test]
fn test_reserved_address_is_skipped() {
    let pool = pool("10.1.0.0/29");
    pool.reserve(Ipv4Addr::new(10, 1, 0, 1)).unwrap();
    assert_eq!(pool.get_free_ip().unwrap(), Ipv4Addr::new(10, 1, 0, 2));
    assert!(pool.reserve(Ipv4Addr::new(10, 1, 0, 2)).is_err());
}

#[test]
fn test_reserve_outside_subnet_is_rejected() {
    let pool = pool("10.1.0.0/29");
    assert!(matches!(
        pool.reserve(Ipv4Addr::new(10, 9, 0, 1)).unwrap_err(),
        Error::InvalidInput(_)
    ));
    assert!(pool.reserve(Ipv4Addr::new(10, 1, 0, 7)).is_err(), "broadcast is not assignable");
}

#[test]
fn test_release_of_unallocated_address_is_noop() {
    let pool = pool("10.1.0.0/29");
    assert!(!pool.release_ip(Ipv4Addr::new(10, 1, 0, 3)));
    assert_eq!(pool.allocated_count(), 0);
}
