//! Expansion of files artifacts into volumes.
//!
//! For each artifact a fresh volume is created and a throwaway expander
//! container extracts the cached tarball into it:
//!
//! ```text
//!   expander container
//!   ├── /files-artifacts  ◄── artifact cache (bind, read-only)
//!   └── /dest             ◄── new volume (read-write)
//!
//!   tar -xzf /files-artifacts/blobs/sha256/ab/<hash>.tgz -C /dest
//! ```
//!
//! A non-zero exit keeps the volume so the failure can be inspected. The
//! artifacts of one launch are expanded concurrently, bounded by the
//! configured worker pool.

use crate::artifact::store::{FilesArtifact, FilesArtifactStore};
use crate::config::EngineConfig;
use crate::constants::{EXPANDER_CACHE_MOUNT, EXPANDER_DEST_MOUNT};
use crate::error::{Error, Result};
use crate::naming::{ObjectAttributes, ObjectKind};
use crate::runtime::{Mount, MountSource};
use crate::service::{ArtifactMount, ServiceLauncher};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// An artifact expanded into a volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedArtifact {
    /// Artifact that was expanded.
    pub artifact: Uuid,
    /// Volume holding its files.
    pub volume: String,
    /// Where the volume is to be mounted.
    pub mount_path: String,
}

/// Expands cached artifacts into volumes.
pub struct ArtifactExpander {
    store: Arc<FilesArtifactStore>,
    image: String,
    timeout: Duration,
    workers: usize,
}

impl ArtifactExpander {
    /// Creates an expander reading from `store`.
    #[must_use]
    pub fn new(store: Arc<FilesArtifactStore>, config: &EngineConfig) -> Self {
        Self {
            store,
            image: config.expander_image.clone(),
            timeout: config.expansion_timeout,
            workers: config.worker_pool_size.max(1),
        }
    }

    /// The cache artifacts are expanded from.
    #[must_use]
    pub fn store(&self) -> &Arc<FilesArtifactStore> {
        &self.store
    }

    /// Expands every artifact for the service `owner_guid`.
    ///
    /// All identifiers are resolved before any volume is created. If any
    /// expansion fails, volumes of the successful ones are removed and the
    /// first error is returned.
    ///
    /// # Errors
    ///
    /// - [`Error::ArtifactNotFound`] / [`Error::AmbiguousArtifactId`] for a
    ///   bad identifier
    /// - [`Error::InvalidInput`] for a relative mount path
    /// - [`Error::ExpansionFailed`] if an expander exits non-zero
    pub async fn expand_all(
        &self,
        launcher: &ServiceLauncher,
        owner_guid: &str,
        mounts: &[ArtifactMount],
    ) -> Result<Vec<ExpandedArtifact>> {
        let mut resolved = Vec::with_capacity(mounts.len());
        for mount in mounts {
            if !mount.mount_path.starts_with('/') {
                return Err(Error::InvalidInput(format!(
                    "mount path '{}' must be absolute",
                    mount.mount_path
                )));
            }
            resolved.push((mount, self.store.get(&mount.identifier)?));
        }

        let results: Vec<Result<ExpandedArtifact>> = stream::iter(resolved)
            .map(|(mount, artifact)| self.expand_into_volume(launcher, owner_guid, mount, artifact))
            .buffer_unordered(self.workers)
            .collect()
            .await;

        let mut expanded = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(e) => expanded.push(e),
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            let volumes: Vec<String> = expanded.into_iter().map(|e| e.volume).collect();
            launcher.remove_volumes(&volumes).await;
            return Err(e);
        }
        Ok(expanded)
    }

    async fn expand_into_volume(
        &self,
        launcher: &ServiceLauncher,
        owner_guid: &str,
        mount: &ArtifactMount,
        artifact: FilesArtifact,
    ) -> Result<ExpandedArtifact> {
        let namer = launcher.namer();
        let runtime = launcher.runtime();
        let volume = namer.helper_name(ObjectKind::ArtifactVolume, owner_guid);
        let labels = namer.object_labels(
            ObjectKind::ArtifactVolume,
            &ObjectAttributes {
                id: Some(artifact.name.clone()),
                owner_guid: Some(owner_guid.to_string()),
                ..ObjectAttributes::default()
            },
        );
        runtime.create_volume(&volume, &labels).await?;

        let cmd = vec![
            "tar".to_string(),
            "-xzf".to_string(),
            format!("{EXPANDER_CACHE_MOUNT}/{}", artifact.relative_path),
            "-C".to_string(),
            EXPANDER_DEST_MOUNT.to_string(),
        ];
        let mounts = vec![
            Mount {
                source: MountSource::Bind(self.store.root().to_path_buf()),
                target: EXPANDER_CACHE_MOUNT.to_string(),
                read_only: true,
            },
            Mount {
                source: MountSource::Volume(volume.clone()),
                target: EXPANDER_DEST_MOUNT.to_string(),
                read_only: false,
            },
        ];

        match launcher
            .run_to_completion(ObjectKind::Expander, owner_guid, &self.image, cmd, mounts, self.timeout)
            .await
        {
            Ok(run) if run.exit_code == 0 => {
                info!(artifact = %artifact.uuid, volume = %volume, "expanded files artifact");
                Ok(ExpandedArtifact {
                    artifact: artifact.uuid,
                    volume,
                    mount_path: mount.mount_path.clone(),
                })
            }
            Ok(run) => {
                warn!(
                    artifact = %artifact.uuid,
                    volume = %volume,
                    exit_code = run.exit_code,
                    "expansion failed, volume kept for inspection"
                );
                Err(Error::ExpansionFailed {
                    artifact: mount.identifier.clone(),
                    exit_code: run.exit_code,
                    logs: run.logs,
                })
            }
            Err(e) => {
                if let Err(remove_err) = runtime.remove_volume(&volume).await {
                    warn!(
                        volume = %volume,
                        error = %remove_err,
                        "ACTION REQUIRED: could not remove expansion volume, remove it manually"
                    );
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::EnclaveId;
    use crate::naming::ObjectNamer;
    use crate::network::AddressPool;
    use crate::runtime::{ContainerRuntime, Labels, NetworkSpec};
    use crate::runtimes::InMemoryRuntime;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        runtime: Arc<InMemoryRuntime>,
        launcher: ServiceLauncher,
        store: Arc<FilesArtifactStore>,
    }

    async fn fixture(runtime: InMemoryRuntime) -> Fixture {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(runtime);
        let subnet: ipnetwork::Ipv4Network = "10.6.0.0/24".parse().unwrap();
        let network_id = runtime
            .create_network(&NetworkSpec {
                name: "n".to_string(),
                subnet,
                gateway: subnet.nth(1).unwrap(),
                labels: Labels::new(),
            })
            .await
            .unwrap();
        let store = Arc::new(FilesArtifactStore::open(dir.path().join("artifacts")).unwrap());
        let config = EngineConfig {
            worker_pool_size: 2,
            expansion_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let expander = Arc::new(ArtifactExpander::new(store.clone(), &config));
        let launcher = ServiceLauncher::new(
            runtime.clone(),
            ObjectNamer::new(EnclaveId::new("e1").unwrap()),
            network_id,
            Arc::new(AddressPool::new(subnet)),
            expander,
            false,
        );
        Fixture {
            _dir: dir,
            runtime,
            launcher,
            store,
        }
    }

    fn service_request(artifacts: &[ArtifactMount]) -> crate::service::LaunchRequest {
        let mut request = crate::service::LaunchRequest::new(ObjectKind::Service, "svc-1", "app");
        request.artifacts = artifacts.to_vec();
        request
    }

    fn mount(identifier: &str, path: &str) -> ArtifactMount {
        ArtifactMount {
            identifier: identifier.to_string(),
            mount_path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn test_expands_each_artifact_into_its_own_volume() {
        let image = EngineConfig::default().expander_image;
        let f = fixture(InMemoryRuntime::new().with_exit_code(image, 0)).await;
        f.store.store(Some("a"), b"one").unwrap();
        f.store.store(Some("b"), b"two").unwrap();

        let launched = f
            .launcher
            .launch(service_request(&[mount("a", "/a"), mount("b", "/b")]))
            .await
            .unwrap();
        assert_eq!(launched.artifact_volumes.len(), 2);
        assert_eq!(f.runtime.volume_names().len(), 2);
        // Only the service remains; expanders are removed.
        assert_eq!(f.runtime.container_names().len(), 1);
        let spec = f.runtime.container_spec(&launched.container_id).unwrap();
        let targets: Vec<_> = spec.mounts.iter().map(|m| m.target.as_str()).collect();
        assert!(targets.contains(&"/a") && targets.contains(&"/b"));
    }

    #[tokio::test]
    async fn test_failed_expansion_keeps_volume_and_creates_no_service() {
        let image = EngineConfig::default().expander_image;
        let f = fixture(
            InMemoryRuntime::new()
                .with_exit_code(image.clone(), 1)
                .with_logs(image, "tar: invalid magic"),
        )
        .await;
        f.store.store(Some("a"), b"one").unwrap();

        let err = f
            .launcher
            .launch(service_request(&[mount("a", "/a")]))
            .await
            .unwrap_err();
        match err {
            Error::ExpansionFailed { exit_code, logs, .. } => {
                assert_eq!(exit_code, 1);
                assert!(logs.contains("invalid magic"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.runtime.container_names().is_empty());
        assert_eq!(f.runtime.volume_names().len(), 1);
        assert_eq!(f.launcher.pool().allocated_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_artifact_creates_nothing() {
        let f = fixture(InMemoryRuntime::new()).await;
        let err = f
            .launcher
            .launch(service_request(&[mount("missing", "/m")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ArtifactNotFound(_)));
        assert!(f.runtime.volume_names().is_empty());
    }
}
