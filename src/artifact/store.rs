//! # Files-Artifact Cache
//!
//! Per-enclave cache of files artifacts. Artifact content is stored
//! content-addressed; an index maps artifact UUIDs and names to content.
//!
//! ## Storage Model
//!
//! ```text
//! <enclave-dir>/artifacts/
//! ├── index.json                 (artifact index, atomically rewritten)
//! └── blobs/
//!     └── sha256/
//!         └── ab/
//!             └── abcd1234....tgz  (compressed artifact content)
//! ```
//!
//! The cache root is bind-mounted read-only into expander containers, so an
//! artifact's `relative_path` is also its path under the expander's mount.
//!
//! ## Immutability
//!
//! Entries are never modified after they are written. Storing under a name
//! that already exists creates a new UUID; name lookups resolve to the most
//! recent entry. Identical content shares one blob.
//!
//! ## Lookup
//!
//! An identifier is resolved as, in order:
//! 1. a full UUID
//! 2. a unique UUID prefix of at least [`MIN_SHORT_UUID_LEN`] hex characters
//! 3. an artifact name (latest wins)

use crate::artifact::archive::{self, ArtifactEntry};
use crate::artifact::stream::{ChunkReceiver, ChunkStream, StreamedDataChunk, chunk_hash};
use crate::constants::{
    ARTIFACT_INDEX_FILE, MAX_ARTIFACT_NAME_LEN, MAX_ARTIFACT_SIZE, MAX_UNIQUE_NAME_ATTEMPTS,
    MIN_SHORT_UUID_LEN,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Directory (under the cache root) holding content-addressed blobs.
const BLOBS_DIR: &str = "blobs";

/// A cached files artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesArtifact {
    /// Identity.
    pub uuid: Uuid,
    /// Name; not necessarily unique across history.
    pub name: String,
    /// Hex SHA-256 of the compressed content.
    pub content_hash: String,
    /// Compressed size in bytes.
    pub size: u64,
    /// Blob path relative to the cache root.
    pub relative_path: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// URL or content key this artifact was fetched from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_key: Option<String>,
}

impl FilesArtifact {
    /// First 12 hex characters of the UUID.
    #[must_use]
    pub fn short_uuid(&self) -> String {
        self.uuid.simple().to_string()[..12].to_string()
    }
}

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    /// UUID of the new artifact.
    pub uuid: Uuid,
    /// Name of the new artifact.
    pub name: String,
    /// Hex SHA-256 of the content.
    pub content_hash: String,
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    artifacts: Vec<FilesArtifact>,
}

/// Content-addressed files-artifact cache for one enclave.
pub struct FilesArtifactStore {
    root: PathBuf,
    index: RwLock<Vec<FilesArtifact>>,
    fetch_lock: tokio::sync::Mutex<()>,
}

impl FilesArtifactStore {
    /// Opens (or creates) the cache at `root`, loading any persisted index.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the index is
    /// unreadable.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOBS_DIR))?;

        let index_path = root.join(ARTIFACT_INDEX_FILE);
        let artifacts = if index_path.exists() {
            let index: Index = serde_json::from_slice(&fs::read(&index_path)?)?;
            index.artifacts
        } else {
            Vec::new()
        };
        info!(
            root = %root.display(),
            artifacts = artifacts.len(),
            "files artifact store opened"
        );

        Ok(Self {
            root,
            index: RwLock::new(artifacts),
            fetch_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Cache root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_index(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<FilesArtifact>>> {
        self.index
            .read()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn write_index(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<FilesArtifact>>> {
        self.index
            .write()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    fn relative_blob_path(content_hash: &str) -> Result<String> {
        // SECURITY: the hash becomes a path component
        if content_hash.len() != 64 || !content_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Internal(format!(
                "malformed content hash '{content_hash}'"
            )));
        }
        Ok(format!(
            "{BLOBS_DIR}/sha256/{}/{content_hash}.tgz",
            &content_hash[..2]
        ))
    }

    fn persist(&self, artifacts: &[FilesArtifact]) -> Result<()> {
        let index = Index {
            artifacts: artifacts.to_vec(),
        };
        crate::persistence::write_atomic(
            &self.root.join(ARTIFACT_INDEX_FILE),
            &serde_json::to_vec_pretty(&index)?,
        )
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Stores compressed artifact content under `name` (or a generated
    /// unique name).
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a bad name or oversize content.
    pub fn store(&self, name: Option<&str>, data: &[u8]) -> Result<FilesArtifact> {
        self.store_with_source(name, data, None)
    }

    fn store_with_source(
        &self,
        name: Option<&str>,
        data: &[u8],
        source_key: Option<String>,
    ) -> Result<FilesArtifact> {
        let name = match name {
            Some(name) => {
                validate_name(name)?;
                name.to_string()
            }
            None => self.unique_name()?,
        };
        if data.len() as u64 > MAX_ARTIFACT_SIZE {
            return Err(Error::ChunkTooLarge {
                size: data.len() as u64,
                limit: MAX_ARTIFACT_SIZE,
            });
        }

        let content_hash = chunk_hash(data);
        let relative_path = Self::relative_blob_path(&content_hash)?;
        let path = self.root.join(&relative_path);

        // Held across the blob write so a concurrent removal of the last
        // entry sharing this content cannot delete the blob underneath us.
        let mut index = self.write_index()?;
        if path.exists() {
            debug!(hash = %content_hash, "artifact content already cached");
        } else {
            crate::persistence::write_atomic(&path, data)?;
        }

        let artifact = FilesArtifact {
            uuid: Uuid::new_v4(),
            name,
            content_hash,
            size: data.len() as u64,
            relative_path,
            created_at: Utc::now(),
            source_key,
        };

        index.push(artifact.clone());
        if let Err(e) = self.persist(&index) {
            index.pop();
            return Err(e);
        }
        info!(
            artifact = %artifact.uuid,
            name = %artifact.name,
            size = artifact.size,
            "stored files artifact"
        );
        Ok(artifact)
    }

    /// Packs a directory and stores it.
    ///
    /// # Errors
    ///
    /// See [`archive::pack_directory`] and [`FilesArtifactStore::store`].
    pub fn store_directory(&self, dir: &Path, name: Option<&str>) -> Result<FilesArtifact> {
        let data = archive::pack_directory(dir)?;
        self.store(name, &data)
    }

    /// Receives a chunked upload and stores it once fully validated.
    ///
    /// # Errors
    ///
    /// Integrity errors abort the upload without creating an entry.
    pub fn upload(
        &self,
        chunks: impl IntoIterator<Item = StreamedDataChunk>,
    ) -> Result<UploadResponse> {
        let received = ChunkReceiver::receive_all(chunks)?;
        self.commit_upload(received)
    }

    /// Receives a chunked upload from a channel and stores it once fully
    /// validated.
    ///
    /// # Errors
    ///
    /// Integrity errors abort the upload without creating an entry.
    pub async fn upload_channel(
        &self,
        rx: &mut mpsc::Receiver<StreamedDataChunk>,
    ) -> Result<UploadResponse> {
        let received = ChunkReceiver::receive_channel(rx).await?;
        self.commit_upload(received)
    }

    fn commit_upload(&self, received: crate::artifact::stream::ReceivedContent) -> Result<UploadResponse> {
        let name = (!received.name.is_empty()).then_some(received.name.as_str());
        let artifact = self.store(name, &received.data)?;
        Ok(UploadResponse {
            uuid: artifact.uuid,
            name: artifact.name,
            content_hash: artifact.content_hash,
            size: artifact.size,
        })
    }

    /// Returns the artifact previously fetched for `source_key`, or fetches,
    /// stores, and returns it.
    ///
    /// Fetches are serialized so a source is fetched at most once.
    ///
    /// # Errors
    ///
    /// Propagates fetch and store errors.
    pub async fn get_or_insert_with<F, Fut>(
        &self,
        source_key: &str,
        name: Option<&str>,
        fetch: F,
    ) -> Result<FilesArtifact>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let _guard = self.fetch_lock.lock().await;
        let cached = self
            .read_index()?
            .iter()
            .rev()
            .find(|a| a.source_key.as_deref() == Some(source_key))
            .cloned();
        if let Some(cached) = cached {
            debug!(source = %source_key, artifact = %cached.uuid, "artifact served from cache");
            return Ok(cached);
        }
        let data = fetch().await?;
        self.store_with_source(name, &data, Some(source_key.to_string()))
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Resolves an identifier to an artifact.
    ///
    /// # Errors
    ///
    /// [`Error::ArtifactNotFound`] or [`Error::AmbiguousArtifactId`].
    pub fn get(&self, identifier: &str) -> Result<FilesArtifact> {
        let index = self.read_index()?;

        if let Ok(uuid) = Uuid::parse_str(identifier)
            && let Some(found) = index.iter().find(|a| a.uuid == uuid)
        {
            return Ok(found.clone());
        }

        let prefix = identifier.to_ascii_lowercase().replace('-', "");
        if prefix.len() >= MIN_SHORT_UUID_LEN && prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            let matches: Vec<&FilesArtifact> = index
                .iter()
                .filter(|a| a.uuid.simple().to_string().starts_with(&prefix))
                .collect();
            match matches.as_slice() {
                [one] => return Ok((*one).clone()),
                [] => {}
                many => {
                    return Err(Error::AmbiguousArtifactId {
                        identifier: identifier.to_string(),
                        matches: many.len(),
                    });
                }
            }
        }

        index
            .iter()
            .rev()
            .find(|a| a.name == identifier)
            .cloned()
            .ok_or_else(|| Error::ArtifactNotFound(identifier.to_string()))
    }

    /// Reads and verifies an artifact's content.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if the cached blob no longer matches its
    /// recorded hash.
    pub fn read(&self, identifier: &str) -> Result<Vec<u8>> {
        let artifact = self.get(identifier)?;
        let data = fs::read(self.root.join(&artifact.relative_path))?;
        let actual = chunk_hash(&data);
        if actual != artifact.content_hash {
            return Err(Error::Internal(format!(
                "cached content of artifact {} is corrupt: expected {}, found {actual}",
                artifact.uuid, artifact.content_hash
            )));
        }
        Ok(data)
    }

    /// Streams an artifact with the same hash chaining used for uploads.
    ///
    /// # Errors
    ///
    /// See [`FilesArtifactStore::read`].
    pub fn download(&self, identifier: &str) -> Result<ChunkStream> {
        let artifact = self.get(identifier)?;
        let data = self.read(&artifact.uuid.to_string())?;
        Ok(ChunkStream::new(data, artifact.name))
    }

    /// Lists the files inside an artifact.
    ///
    /// # Errors
    ///
    /// See [`archive::list_entries`].
    pub fn inspect(&self, identifier: &str) -> Result<Vec<ArtifactEntry>> {
        archive::list_entries(&self.read(identifier)?)
    }

    /// Unpacks an artifact into a local directory.
    ///
    /// # Errors
    ///
    /// See [`archive::unpack`].
    pub fn extract_to_directory(&self, identifier: &str, dest: &Path) -> Result<()> {
        archive::unpack(&self.read(identifier)?, dest)
    }

    /// Every artifact, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<FilesArtifact> {
        self.read_index().map(|i| i.clone()).unwrap_or_default()
    }

    /// Removes an artifact's index entry, and its blob when no other entry
    /// shares the content.
    ///
    /// # Errors
    ///
    /// See [`FilesArtifactStore::get`].
    pub fn remove(&self, identifier: &str) -> Result<FilesArtifact> {
        let target = self.get(identifier)?;
        let mut index = self.write_index()?;
        let before = index.clone();
        index.retain(|a| a.uuid != target.uuid);
        if let Err(e) = self.persist(&index) {
            *index = before;
            return Err(e);
        }
        let blob_unused = !index.iter().any(|a| a.content_hash == target.content_hash);
        if blob_unused
            && let Err(e) = fs::remove_file(self.root.join(&target.relative_path))
        {
            warn!(artifact = %target.uuid, error = %e, "could not remove artifact blob");
        }
        drop(index);
        info!(artifact = %target.uuid, name = %target.name, "removed files artifact");
        Ok(target)
    }

    /// Generates a name not used by any artifact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Internal`] if every attempt collided.
    pub fn unique_name(&self) -> Result<String> {
        let index = self.read_index()?;
        for _ in 0..MAX_UNIQUE_NAME_ATTEMPTS {
            let candidate = format!("artifact-{}", &Uuid::new_v4().simple().to_string()[..8]);
            if !index.iter().any(|a| a.name == candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::Internal(format!(
            "no unique artifact name found after {MAX_UNIQUE_NAME_ATTEMPTS} attempts"
        )))
    }

    /// Forgets every artifact and deletes the cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be removed; the in-memory
    /// index is cleared either way.
    pub fn destroy(&self) -> Result<()> {
        let mut index = self.write_index()?;
        let removed = index.len();
        index.clear();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        drop(index);
        info!(root = %self.root.display(), artifacts = removed, "files artifact store destroyed");
        Ok(())
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_ARTIFACT_NAME_LEN {
        return Err(Error::InvalidInput(format!(
            "artifact name must be 1..={MAX_ARTIFACT_NAME_LEN} bytes"
        )));
    }
    if name.chars().any(|c| c.is_control() || c == '/') {
        return Err(Error::InvalidInput(format!(
            "artifact name '{name}' contains '/' or control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_same_name_creates_new_uuid() {
        let dir = TempDir::new().unwrap();
        let store = FilesArtifactStore::open(dir.path()).unwrap();
        let first = store.store(Some("cfg"), b"one").unwrap();
        let second = store.store(Some("cfg"), b"two").unwrap();
        assert_ne!(first.uuid, second.uuid);
        assert_eq!(store.get("cfg").unwrap().uuid, second.uuid);
        assert_eq!(store.read(&first.uuid.to_string()).unwrap(), b"one");
    }

    #[test]
    fn test_identical_content_shares_blob() {
        let dir = TempDir::new().unwrap();
        let store = FilesArtifactStore::open(dir.path()).unwrap();
        let a = store.store(Some("a"), b"same").unwrap();
        let b = store.store(Some("b"), b"same").unwrap();
        assert_eq!(a.relative_path, b.relative_path);
        store.remove("a").unwrap();
        assert!(dir.path().join(&b.relative_path).exists());
        store.remove("b").unwrap();
        assert!(!dir.path().join(&b.relative_path).exists());
    }

    #[test]
    fn test_index_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let uuid = {
            let store = FilesArtifactStore::open(dir.path()).unwrap();
            store.store(Some("persist"), b"data").unwrap().uuid
        };
        let store = FilesArtifactStore::open(dir.path()).unwrap();
        assert_eq!(store.get("persist").unwrap().uuid, uuid);
    }

    #[test]
    fn test_short_uuid_lookup() {
        let dir = TempDir::new().unwrap();
        let store = FilesArtifactStore::open(dir.path()).unwrap();
        let artifact = store.store(None, b"x").unwrap();
        assert!(artifact.name.starts_with("artifact-"));
        assert_eq!(store.get(&artifact.short_uuid()).unwrap().uuid, artifact.uuid);
        assert!(matches!(
            store.get("does-not-exist"),
            Err(Error::ArtifactNotFound(_))
        ));
    }

    #[test]
    fn test_destroy_removes_blobs_and_index() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("artifacts");
        let store = FilesArtifactStore::open(&root).unwrap();
        let artifact = store.store(Some("gone"), b"data").unwrap();
        store.destroy().unwrap();
        assert!(store.list().is_empty());
        assert!(!root.join(&artifact.relative_path).exists());
        assert!(!root.exists());
        // A second destroy finds nothing to remove.
        store.destroy().unwrap();

        let reopened = FilesArtifactStore::open(&root).unwrap();
        assert!(reopened.list().is_empty());
    }

    #[test]
    fn test_rejects_bad_names() {
        let dir = TempDir::new().unwrap();
        let store = FilesArtifactStore::open(dir.path()).unwrap();
        assert!(store.store(Some(""), b"x").is_err());
        assert!(store.store(Some("a/b"), b"x").is_err());
        assert!(store.list().is_empty());
    }
}
