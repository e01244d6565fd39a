//! End-to-end tests for enclaves on the in-memory runtime.
//!
//! Drives the public API the way an orchestration front-end would: create
//! an enclave, add services, partition and heal the network, mount files
//! artifacts, load extensions, and tear everything down.

use enclavenet::constants::DEFAULT_EXPANDER_IMAGE;
use enclavenet::extension::InMemoryConnector;
use enclavenet::persistence::StateStore;
use enclavenet::runtime::MountSource;
use enclavenet::runtimes::InMemoryRuntime;
use enclavenet::{
    ConnectionState, EnclaveId, EnclaveManager, EnclaveState, EngineConfig, Error, ExtensionId, PartitionId,
    RepartitionRequest, ServiceConfig, ServiceId,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    runtime: Arc<InMemoryRuntime>,
    connector: Arc<InMemoryConnector>,
    manager: EnclaveManager,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let runtime = Arc::new(InMemoryRuntime::new().with_exit_code(DEFAULT_EXPANDER_IMAGE, 0));
    let connector = Arc::new(InMemoryConnector::echo());
    let config = EngineConfig {
        data_dir: dir.path().to_path_buf(),
        network_retry_interval: Duration::ZERO,
        extension_availability_timeout: Duration::from_millis(600),
        ..EngineConfig::default()
    };
    let manager = EnclaveManager::new(config, runtime.clone(), connector.clone()).unwrap();
    Harness {
        _dir: dir,
        runtime,
        connector,
        manager,
    }
}

fn sid(s: &str) -> ServiceId {
    ServiceId::new(s).unwrap()
}

fn pid(s: &str) -> PartitionId {
    PartitionId::new(s).unwrap()
}

fn eid(s: &str) -> EnclaveId {
    EnclaveId::new(s).unwrap()
}

// =============================================================================
// Partition Scenario
// =============================================================================

#[tokio::test]
async fn test_partition_and_heal_scenario() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("scenario")).await.unwrap();
    let (s1, s2) = (sid("s1"), sid("s2"));

    enclave.add_service(&s1, ServiceConfig::new("app")).await.unwrap();
    enclave.add_service(&s2, ServiceConfig::new("app")).await.unwrap();
    assert!(enclave.connection_between(&s1, &s2).await.unwrap().is_unrestricted());

    let mut partitions = BTreeMap::new();
    partitions.insert(pid("p1"), BTreeSet::from([s1.clone()]));
    partitions.insert(pid("p2"), BTreeSet::from([s2.clone()]));
    enclave
        .repartition(RepartitionRequest {
            partitions,
            connections: Vec::new(),
            default_connection: ConnectionState::blocked(),
        })
        .await
        .unwrap();
    assert!(enclave.connection_between(&s1, &s2).await.unwrap().is_blocked());
    assert!(enclave.connection_between(&s2, &s1).await.unwrap().is_blocked());

    enclave
        .set_connection(pid("p1"), pid("p2"), ConnectionState::allowed())
        .await
        .unwrap();
    assert!(enclave.connection_between(&s1, &s2).await.unwrap().is_unrestricted());

    let pool = enclave.address_pool().clone();
    let network_id = enclave.network().id.clone();
    let report = h.manager.destroy_enclave(enclave.id()).await.unwrap();
    assert!(report.is_clean(), "{report}");
    assert_eq!(pool.allocated_count(), 0);
    assert!(!h.runtime.has_network(&network_id));
    assert!(h.runtime.container_names().is_empty());
    assert_eq!(enclave.state(), EnclaveState::Destroyed);
}

#[tokio::test]
async fn test_late_service_joins_blocked_partition() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("late")).await.unwrap();
    let (s1, s2, s3) = (sid("s1"), sid("s2"), sid("s3"));
    let in_partition = |image: &str, partition: &str| ServiceConfig {
        partition: Some(pid(partition)),
        ..ServiceConfig::new(image)
    };

    enclave.add_service(&s1, in_partition("app", "a")).await.unwrap();
    enclave.add_service(&s2, in_partition("app", "b")).await.unwrap();
    enclave
        .set_connection(pid("a"), pid("b"), ConnectionState::blocked())
        .await
        .unwrap();

    enclave.add_service(&s3, in_partition("app", "b")).await.unwrap();
    assert!(enclave.connection_between(&s1, &s3).await.unwrap().is_blocked());
    assert!(enclave.connection_between(&s3, &s1).await.unwrap().is_blocked());
    assert!(enclave.connection_between(&s2, &s3).await.unwrap().is_unrestricted());
}

#[tokio::test]
async fn test_lossy_connection_is_enforced() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("lossy")).await.unwrap();
    let (s1, s2) = (sid("s1"), sid("s2"));
    enclave
        .add_service(&s1, ServiceConfig { partition: Some(pid("a")), ..ServiceConfig::new("app") })
        .await
        .unwrap();
    enclave
        .add_service(&s2, ServiceConfig { partition: Some(pid("b")), ..ServiceConfig::new("app") })
        .await
        .unwrap();
    enclave
        .set_connection(pid("a"), pid("b"), ConnectionState::lossy(40.0))
        .await
        .unwrap();
    let state = enclave.connection_between(&s1, &s2).await.unwrap();
    assert_eq!(state.packet_loss_percentage(), 40.0);

    assert!(enclave.unset_connection(pid("a"), pid("b")).await.unwrap());
    assert!(enclave.connection_between(&s1, &s2).await.unwrap().is_unrestricted());
}

// =============================================================================
// Service Tests
// =============================================================================

#[tokio::test]
async fn test_services_get_distinct_addresses_and_release_them() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("addrs")).await.unwrap();
    let a = enclave.add_service(&sid("a"), ServiceConfig::new("app")).await.unwrap();
    let b = enclave.add_service(&sid("b"), ServiceConfig::new("app")).await.unwrap();
    assert_ne!(a.ip, b.ip);
    assert_ne!(a.ip, enclave.network().gateway);

    enclave.remove_service(&sid("a")).await.unwrap();
    assert!(!enclave.address_pool().is_taken(a.ip));
    assert!(matches!(
        enclave.remove_service(&sid("a")).await.unwrap_err(),
        Error::ServiceNotFound(_)
    ));
}

#[tokio::test]
async fn test_service_mounts_expanded_artifact() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("files")).await.unwrap();
    let source = TempDir::new().unwrap();
    std::fs::write(source.path().join("genesis.json"), "{}").unwrap();
    let artifact = enclave.store_directory(source.path(), Some("genesis")).unwrap();

    let mut config = ServiceConfig::new("node");
    config
        .files_artifacts
        .insert(artifact.short_uuid(), "/data/genesis".to_string());
    let service = enclave.add_service(&sid("node"), config).await.unwrap();
    assert_eq!(service.artifact_volumes.len(), 1);

    let spec = h.runtime.container_spec(&service.container_id).unwrap();
    let mount = spec
        .mounts
        .iter()
        .find(|m| m.target == "/data/genesis")
        .expect("artifact mount");
    assert!(matches!(&mount.source, MountSource::Volume(name) if *name == service.artifact_volumes[0]));

    h.manager.destroy_enclave(enclave.id()).await.unwrap();
    assert!(h.runtime.volume_names().is_empty());
}

#[tokio::test]
async fn test_unknown_artifact_fails_without_leaking() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("leak")).await.unwrap();
    let mut config = ServiceConfig::new("node");
    config.files_artifacts.insert("nope".to_string(), "/data".to_string());

    let err = enclave.add_service(&sid("node"), config).await.unwrap_err();
    assert!(matches!(err, Error::ArtifactNotFound(_)), "unexpected error: {err}");
    assert_eq!(enclave.address_pool().allocated_count(), 1, "only the gateway stays reserved");
    assert!(enclave.service_network().services().is_empty());
}

// =============================================================================
// Extension Tests
// =============================================================================

#[tokio::test]
async fn test_extension_load_execute_unload() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("ext")).await.unwrap();
    let x = ExtensionId::new("x").unwrap();

    enclave.load_extension(&x, "lambda:1", r#"{"a":1}"#).await.unwrap();
    assert!(matches!(
        enclave.load_extension(&x, "lambda:1", "{}").await.unwrap_err(),
        Error::ExtensionAlreadyLoaded(_)
    ));
    assert_eq!(enclave.execute_extension(&x, "ping").await.unwrap(), "ping");
    assert!(!h.connector.calls().is_empty());

    enclave.unload_extension(&x).await.unwrap();
    assert!(matches!(
        enclave.execute_extension(&x, "ping").await.unwrap_err(),
        Error::ExtensionNotFound(_)
    ));
}

#[tokio::test]
async fn test_unavailable_extension_is_cleaned_up() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("slow")).await.unwrap();
    h.connector.set_available(false);
    let x = ExtensionId::new("x").unwrap();

    let err = enclave.load_extension(&x, "lambda:1", "{}").await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }), "unexpected error: {err}");
    assert!(h.runtime.container_names().is_empty());
    assert_eq!(enclave.address_pool().allocated_count(), 1);

    // The ID is free again.
    h.connector.set_available(true);
    enclave.load_extension(&x, "lambda:1", "{}").await.unwrap();
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_enclaves_get_disjoint_subnets() {
    let h = harness();
    let a = h.manager.create_enclave(&eid("a")).await.unwrap();
    let b = h.manager.create_enclave(&eid("b")).await.unwrap();
    assert!(!a.network().subnet.overlaps(b.network().subnet));
    assert_eq!(h.manager.list_enclaves().len(), 2);
}

#[tokio::test]
async fn test_mutations_are_persisted() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("saved")).await.unwrap();
    enclave.add_service(&sid("s1"), ServiceConfig::new("app")).await.unwrap();

    let record = StateStore::new(&h.manager.config().data_dir)
        .load(&eid("saved"))
        .unwrap()
        .unwrap();
    assert_eq!(record.state, EnclaveState::Running);
    assert_eq!(record.services.len(), 1);
    assert_eq!(record.services[0].service.id, sid("s1"));
}

#[tokio::test]
async fn test_destroyed_enclave_rejects_mutations() {
    let h = harness();
    let enclave = h.manager.create_enclave(&eid("gone")).await.unwrap();
    h.manager.destroy_enclave(enclave.id()).await.unwrap();

    let err = enclave
        .set_default_connection(ConnectionState::blocked())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));

    // The ID can be reused once destroyed.
    let again = h.manager.create_enclave(&eid("gone")).await.unwrap();
    assert_eq!(again.state(), EnclaveState::Running);
}
