//! Registry of loaded extensions.
//!
//! At most one live extension exists per ID. A load reserves the ID with a
//! placeholder before any container is started, so two concurrent loads of
//! the same ID cannot both proceed; the placeholder is dropped again if the
//! load fails.
//!
//! The registry lock is held only for map bookkeeping. Launching, probing,
//! executing, and killing all happen outside it, on a cloned handle.

use crate::config::EngineConfig;
use crate::constants::{EXTENSION_PARAMS_ENV, EXTENSION_POLL_INTERVAL, MAX_EXTENSIONS};
use crate::error::{Error, Result, TeardownReport};
use crate::extension::client::{ExtensionClient, ExtensionConnector};
use crate::ids::{ExtensionId, ServiceGuid};
use crate::naming::ObjectKind;
use crate::persistence::ExtensionRecord;
use crate::runtime::PortSpec;
use crate::service::{LaunchRequest, ServiceLauncher};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

/// A loaded extension.
pub struct LoadedExtension {
    record: ExtensionRecord,
    client: Arc<dyn ExtensionClient>,
}

impl LoadedExtension {
    /// Persistable description of the extension.
    #[must_use]
    pub fn record(&self) -> &ExtensionRecord {
        &self.record
    }
}

enum Slot {
    Loading,
    Loaded(Arc<LoadedExtension>),
}

/// Registry of the extensions loaded in one enclave.
pub struct ExtensionStore {
    launcher: ServiceLauncher,
    connector: Arc<dyn ExtensionConnector>,
    port: u16,
    availability_timeout: Duration,
    entries: Mutex<BTreeMap<ExtensionId, Slot>>,
}

impl ExtensionStore {
    /// Creates an empty store launching through `launcher`.
    #[must_use]
    pub fn new(
        launcher: ServiceLauncher,
        connector: Arc<dyn ExtensionConnector>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            launcher,
            connector,
            port: config.extension_port,
            availability_timeout: config.extension_availability_timeout,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<ExtensionId, Slot>>> {
        self.entries
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn loaded(&self, id: &ExtensionId) -> Result<Arc<LoadedExtension>> {
        match self.lock()?.get(id) {
            Some(Slot::Loaded(ext)) => Ok(ext.clone()),
            _ => Err(Error::ExtensionNotFound(id.to_string())),
        }
    }

    fn clear_placeholder(&self, id: &ExtensionId) {
        if let Ok(mut entries) = self.entries.lock()
            && matches!(entries.get(id), Some(Slot::Loading))
        {
            entries.remove(id);
        }
    }

    /// Starts an extension container and registers it once it answers.
    ///
    /// The container receives `params` in its environment and must accept
    /// a ping within the configured availability timeout. If it does not,
    /// it is removed and its address released before the error returns.
    ///
    /// # Errors
    ///
    /// - [`Error::ExtensionAlreadyLoaded`] if `id` is loaded or loading
    /// - [`Error::InvalidState`] if the extension limit is reached
    /// - launch errors, or [`Error::Timeout`] if the extension never answers
    #[instrument(skip(self, params), fields(extension = %id, image = %image))]
    pub async fn load(&self, id: &ExtensionId, image: &str, params: &str) -> Result<ExtensionRecord> {
        {
            let mut entries = self.lock()?;
            if entries.contains_key(id) {
                return Err(Error::ExtensionAlreadyLoaded(id.to_string()));
            }
            if entries.len() >= MAX_EXTENSIONS {
                return Err(Error::InvalidState {
                    object: "extension store".to_string(),
                    state: format!("{} extensions loaded", entries.len()),
                    expected: format!("fewer than {MAX_EXTENSIONS}"),
                });
            }
            entries.insert(id.clone(), Slot::Loading);
        }

        match self.start(id, image, params).await {
            Ok(loaded) => {
                let record = loaded.record.clone();
                self.lock()?.insert(id.clone(), Slot::Loaded(Arc::new(loaded)));
                info!(ip = %record.ip, container = %record.container_id, "loaded extension");
                Ok(record)
            }
            Err(e) => {
                self.clear_placeholder(id);
                Err(e)
            }
        }
    }

    async fn start(&self, id: &ExtensionId, image: &str, params: &str) -> Result<LoadedExtension> {
        let guid = ServiceGuid::parse(format!("{id}-{}", uuid::Uuid::now_v7().simple()))?;
        let mut request = LaunchRequest::new(ObjectKind::Extension, guid.as_str(), image);
        request.id = Some(id.to_string());
        request.env.insert(EXTENSION_PARAMS_ENV.to_string(), params.to_string());
        request.ports = vec![PortSpec::tcp(self.port)];

        let launched = self.launcher.launch(request).await?;
        let Some(ip) = launched.ip else {
            return Err(Error::Internal(format!("extension '{id}' launched without an address")));
        };
        let client = self.connector.connect(SocketAddr::new(ip.into(), self.port));

        if let Err(e) = self.wait_until_available(id, client.as_ref()).await {
            if let Err(remove_err) = self
                .launcher
                .destroy_and_release(&launched.container_id, Some(ip))
                .await
            {
                warn!(
                    container = %launched.container_id,
                    error = %remove_err,
                    "ACTION REQUIRED: could not remove unavailable extension container"
                );
            }
            return Err(e);
        }

        Ok(LoadedExtension {
            record: ExtensionRecord {
                id: id.clone(),
                guid,
                image: image.to_string(),
                container_id: launched.container_id,
                ip,
            },
            client,
        })
    }

    async fn wait_until_available(&self, id: &ExtensionId, client: &dyn ExtensionClient) -> Result<()> {
        let poll = async {
            loop {
                match client.ping().await {
                    Ok(()) => return,
                    Err(e) => {
                        debug!(extension = %id, error = %e, "extension not available yet");
                        sleep(EXTENSION_POLL_INTERVAL).await;
                    }
                }
            }
        };
        timeout(self.availability_timeout, poll)
            .await
            .map_err(|_| Error::Timeout {
                operation: format!("waiting for extension '{id}' to become available"),
                duration: self.availability_timeout,
            })
    }

    /// Forwards `params` to a loaded extension.
    ///
    /// # Errors
    ///
    /// - [`Error::ExtensionNotFound`] if `id` is not loaded
    /// - [`Error::Extension`] if the call fails
    pub async fn execute(&self, id: &ExtensionId, params: &str) -> Result<String> {
        let ext = self.loaded(id)?;
        ext.client.execute(params).await.map_err(|e| match e {
            Error::Extension { reason, .. } => Error::Extension {
                id: id.to_string(),
                reason,
            },
            other => other,
        })
    }

    /// Removes an extension from the registry and kills its container.
    ///
    /// # Errors
    ///
    /// - [`Error::ExtensionNotFound`] if `id` is not loaded
    /// - the runtime error if the container could not be removed; the entry
    ///   is gone either way and the container needs manual cleanup
    #[instrument(skip(self), fields(extension = %id))]
    pub async fn unload(&self, id: &ExtensionId) -> Result<()> {
        let ext = {
            let mut entries = self.lock()?;
            match entries.get(id) {
                Some(Slot::Loaded(_)) => match entries.remove(id) {
                    Some(Slot::Loaded(ext)) => ext,
                    _ => return Err(Error::ExtensionNotFound(id.to_string())),
                },
                _ => return Err(Error::ExtensionNotFound(id.to_string())),
            }
        };
        let record = ext.record();
        self.launcher
            .destroy_and_release(&record.container_id, Some(record.ip))
            .await
            .inspect_err(|e| {
                warn!(
                    container = %record.container_id,
                    error = %e,
                    "ACTION REQUIRED: extension unloaded but its container could not be removed"
                );
            })?;
        info!("unloaded extension");
        Ok(())
    }

    /// Kills every loaded extension, continuing past failures.
    pub async fn destroy_all(&self) -> TeardownReport {
        let mut report = TeardownReport::new();
        let loaded: Vec<Arc<LoadedExtension>> = match self.lock() {
            Ok(mut entries) => {
                let ids: Vec<ExtensionId> = entries
                    .iter()
                    .filter(|(_, slot)| matches!(slot, Slot::Loaded(_)))
                    .map(|(id, _)| id.clone())
                    .collect();
                ids.iter()
                    .filter_map(|id| match entries.remove(id) {
                        Some(Slot::Loaded(ext)) => Some(ext),
                        _ => None,
                    })
                    .collect()
            }
            Err(e) => {
                report.record("extension registry", e);
                return report;
            }
        };

        for ext in loaded {
            let record = ext.record();
            if let Err(e) = self
                .launcher
                .destroy_and_release(&record.container_id, Some(record.ip))
                .await
            {
                report.record(
                    format!("extension {} (container {})", record.id, record.container_id),
                    e,
                );
            }
        }
        report
    }

    /// Re-registers an extension that survived an engine restart.
    ///
    /// The address is reserved again and a client is dialed; an extension
    /// that does not answer is still registered so it can be unloaded.
    ///
    /// # Errors
    ///
    /// - [`Error::ExtensionAlreadyLoaded`] if the ID is already registered
    /// - [`Error::InvalidInput`] if the address is already taken
    pub async fn reattach(&self, record: ExtensionRecord) -> Result<()> {
        {
            let entries = self.lock()?;
            if entries.contains_key(&record.id) {
                return Err(Error::ExtensionAlreadyLoaded(record.id.to_string()));
            }
        }
        self.launcher.pool().reserve(record.ip)?;
        let client = self.connector.connect(SocketAddr::new(record.ip.into(), self.port));
        if let Err(e) = client.ping().await {
            warn!(extension = %record.id, error = %e, "reattached extension does not answer");
        }
        let id = record.id.clone();
        self.lock()?
            .insert(id, Slot::Loaded(Arc::new(LoadedExtension { record, client })));
        Ok(())
    }

    /// Loaded extensions with their addresses.
    #[must_use]
    pub fn list(&self) -> Vec<(ExtensionId, Ipv4Addr)> {
        self.records().into_iter().map(|r| (r.id, r.ip)).collect()
    }

    /// Persistable records of the loaded extensions.
    #[must_use]
    pub fn records(&self) -> Vec<ExtensionRecord> {
        match self.entries.lock() {
            Ok(entries) => entries
                .values()
                .filter_map(|slot| match slot {
                    Slot::Loaded(ext) => Some(ext.record.clone()),
                    Slot::Loading => None,
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{ArtifactExpander, FilesArtifactStore};
    use crate::extension::client::InMemoryConnector;
    use crate::ids::EnclaveId;
    use crate::naming::ObjectNamer;
    use crate::network::AddressPool;
    use crate::runtime::{ContainerRuntime, Labels, NetworkSpec};
    use crate::runtimes::InMemoryRuntime;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        runtime: Arc<InMemoryRuntime>,
        connector: Arc<InMemoryConnector>,
        store: ExtensionStore,
        pool: Arc<AddressPool>,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        let subnet: ipnetwork::Ipv4Network = "10.7.0.0/24".parse().unwrap();
        let network_id = runtime
            .create_network(&NetworkSpec {
                name: "n".to_string(),
                subnet,
                gateway: subnet.nth(1).unwrap(),
                labels: Labels::new(),
            })
            .await
            .unwrap();
        let config = EngineConfig {
            extension_availability_timeout: Duration::from_millis(600),
            ..EngineConfig::default()
        };
        let artifacts = Arc::new(FilesArtifactStore::open(dir.path().join("artifacts")).unwrap());
        let pool = Arc::new(AddressPool::new(subnet));
        let launcher = ServiceLauncher::new(
            runtime.clone(),
            ObjectNamer::new(EnclaveId::new("e1").unwrap()),
            network_id,
            pool.clone(),
            Arc::new(ArtifactExpander::new(artifacts, &config)),
            false,
        );
        let connector = Arc::new(InMemoryConnector::new(|params| {
            if params == "fail" {
                Err("handler failed".to_string())
            } else {
                Ok(format!("done:{params}"))
            }
        }));
        let store = ExtensionStore::new(launcher, connector.clone(), &config);
        Fixture {
            _dir: dir,
            runtime,
            connector,
            store,
            pool,
        }
    }

    fn ext(id: &str) -> ExtensionId {
        ExtensionId::new(id).unwrap()
    }

    #[tokio::test]
    async fn test_load_execute_unload() {
        let f = fixture().await;
        let record = f.store.load(&ext("x"), "ext-image", "{\"a\":1}").await.unwrap();
        let spec = f.runtime.container_spec(&record.container_id).unwrap();
        assert_eq!(spec.env[EXTENSION_PARAMS_ENV], "{\"a\":1}");
        assert_eq!(f.store.list(), vec![(ext("x"), record.ip)]);

        assert_eq!(f.store.execute(&ext("x"), "p").await.unwrap(), "done:p");
        f.store.unload(&ext("x")).await.unwrap();
        assert!(f.runtime.container_names().is_empty());
        assert!(!f.pool.is_taken(record.ip));
        assert!(matches!(
            f.store.execute(&ext("x"), "p").await.unwrap_err(),
            Error::ExtensionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_double_load_fails() {
        let f = fixture().await;
        f.store.load(&ext("x"), "img", "").await.unwrap();
        let err = f.store.load(&ext("x"), "img", "").await.unwrap_err();
        assert!(matches!(err, Error::ExtensionAlreadyLoaded(_)));
        assert_eq!(f.runtime.container_names().len(), 1);
    }

    #[tokio::test]
    async fn test_unload_missing_fails() {
        let f = fixture().await;
        assert!(matches!(
            f.store.unload(&ext("nope")).await.unwrap_err(),
            Error::ExtensionNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_unavailable_extension_is_cleaned_up() {
        let f = fixture().await;
        f.connector.set_available(false);
        let err = f.store.load(&ext("x"), "img", "").await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(f.runtime.container_names().is_empty());
        assert_eq!(f.pool.allocated_count(), 0);

        // The ID is free again.
        f.connector.set_available(true);
        f.store.load(&ext("x"), "img", "").await.unwrap();
    }

    #[tokio::test]
    async fn test_execute_error_names_extension() {
        let f = fixture().await;
        f.store.load(&ext("x"), "img", "").await.unwrap();
        match f.store.execute(&ext("x"), "fail").await.unwrap_err() {
            Error::Extension { id, reason } => {
                assert_eq!(id, "x");
                assert_eq!(reason, "handler failed");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_destroy_all_reports_every_failure() {
        let f = fixture().await;
        let a = f.store.load(&ext("a"), "img", "").await.unwrap();
        f.store.load(&ext("b"), "img", "").await.unwrap();
        f.store.load(&ext("c"), "img", "").await.unwrap();
        f.runtime.fail_container_kill(a.guid.as_str());

        let report = f.store.destroy_all().await;
        assert_eq!(report.failures().len(), 1);
        assert!(report.failures()[0].object.contains("extension a"));
        assert!(f.store.list().is_empty());
        assert_eq!(f.runtime.container_names().len(), 1);
        // Only the address of the container still present stays reserved.
        assert_eq!(f.pool.allocated(), vec![a.ip]);
    }

    #[tokio::test]
    async fn test_reattach_reserves_address() {
        let f = fixture().await;
        let record = ExtensionRecord {
            id: ext("old"),
            guid: ServiceGuid::parse("old-1").unwrap(),
            image: "img".to_string(),
            container_id: "c-1".to_string(),
            ip: "10.7.0.9".parse().unwrap(),
        };
        f.store.reattach(record.clone()).await.unwrap();
        assert!(f.pool.is_taken(record.ip));
        assert_eq!(f.store.records(), vec![record.clone()]);
        assert!(f.store.reattach(record).await.is_err());
        assert_eq!(f.store.execute(&ext("old"), "q").await.unwrap(), "done:q");
    }
}
