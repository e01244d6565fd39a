//! Persisted enclave state.
//!
//! Each enclave has one JSON record:
//!
//! ```text
//! <data-dir>/enclaves/
//! └── <enclave-id>/
//!     ├── enclave.json    (EnclaveRecord, atomically rewritten)
//!     └── artifacts/      (files-artifact cache)
//! ```
//!
//! Records are rewritten after every mutation. They describe what the engine
//! believes exists; the runtime's labelled objects remain the authority and
//! are cross-checked on start (see `EnclaveManager::reconcile`).

use crate::constants::{ENCLAVE_RECORD_FILE, ENCLAVES_DIR};
use crate::error::{Error, Result};
use crate::ids::{EnclaveId, ExtensionId, ServiceGuid};
use crate::partition::PartitionTopology;
use crate::service::Service;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Writes `bytes` to `path` through a uniquely named temp file and a
/// rename, so readers see either the old or the new content.
///
/// # Errors
///
/// Returns an I/O error if the directory, write, or rename fails.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));
    fs::write(&temp_path, bytes)?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Io(e)
    })?;
    Ok(())
}

// =============================================================================
// Enclave State
// =============================================================================

/// Enclave lifecycle state.
///
/// ```text
///   Creating ──▶ Running ──▶ Destroying ──▶ Destroyed
///       │                        ▲
///       └────────────────────────┘  (failed creation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnclaveState {
    /// Network and control containers are being set up.
    Creating,
    /// Ready for services.
    Running,
    /// Teardown in progress.
    Destroying,
    /// Every owned object was removed (or reported for manual cleanup).
    Destroyed,
}

impl std::fmt::Display for EnclaveState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Destroying => write!(f, "destroying"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

/// The enclave network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRecord {
    /// Runtime network ID.
    pub id: String,
    /// Network name.
    pub name: String,
    /// Subnet.
    pub subnet: Ipv4Network,
    /// Gateway address.
    pub gateway: Ipv4Addr,
}

/// A service and its sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// The service.
    #[serde(flatten)]
    pub service: Service,
    /// Networking sidecar container, if partitioning is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar_container_id: Option<String>,
}

/// A loaded extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionRecord {
    /// Extension ID.
    pub id: ExtensionId,
    /// GUID used for naming its container.
    pub guid: ServiceGuid,
    /// Image the extension runs.
    pub image: String,
    /// Runtime container ID.
    pub container_id: String,
    /// Private IP.
    pub ip: Ipv4Addr,
}

/// Everything persisted about one enclave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnclaveRecord {
    /// Enclave ID.
    pub id: EnclaveId,
    /// Lifecycle state.
    pub state: EnclaveState,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Network, once provisioned.
    #[serde(default)]
    pub network: Option<NetworkRecord>,
    /// Addresses reserved outside the service registry (gateway, control).
    #[serde(default)]
    pub reserved_ips: Vec<Ipv4Addr>,
    /// Control-plane container, if one was started.
    #[serde(default)]
    pub control_container_id: Option<String>,
    /// Services.
    #[serde(default)]
    pub services: Vec<ServiceRecord>,
    /// Partition topology.
    #[serde(default)]
    pub topology: PartitionTopology,
    /// Loaded extensions.
    #[serde(default)]
    pub extensions: Vec<ExtensionRecord>,
}

impl EnclaveRecord {
    /// A fresh record in `Creating`.
    #[must_use]
    pub fn new(id: EnclaveId) -> Self {
        Self {
            id,
            state: EnclaveState::Creating,
            created_at: Utc::now(),
            network: None,
            reserved_ips: Vec::new(),
            control_container_id: None,
            services: Vec::new(),
            topology: PartitionTopology::default(),
            extensions: Vec::new(),
        }
    }
}

// =============================================================================
// State Store
// =============================================================================

/// Reads and writes enclave records under the data directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// A store rooted at `<data_dir>/enclaves`.
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join(ENCLAVES_DIR),
        }
    }

    fn record_path(&self, id: &EnclaveId) -> PathBuf {
        self.root.join(id.as_str()).join(ENCLAVE_RECORD_FILE)
    }

    /// Writes a record.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, record: &EnclaveRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        write_atomic(&path, &serde_json::to_vec_pretty(record)?)?;
        debug!(enclave = %record.id, state = %record.state, "saved enclave record");
        Ok(())
    }

    /// Reads one record, `None` if the enclave was never persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    pub fn load(&self, id: &EnclaveId) -> Result<Option<EnclaveRecord>> {
        let path = self.record_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
    }

    /// Reads every record. Unreadable records are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error only if the enclaves directory cannot be listed.
    pub fn load_all(&self) -> Result<Vec<EnclaveRecord>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path().join(ENCLAVE_RECORD_FILE);
            if !path.exists() {
                continue;
            }
            match fs::read(&path)
                .map_err(Error::from)
                .and_then(|bytes| serde_json::from_slice::<EnclaveRecord>(&bytes).map_err(Error::from))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable enclave record"),
            }
        }
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}
