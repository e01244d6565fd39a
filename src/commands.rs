//! Bulk command files.
//!
//! A bulk file is a JSON document listing enclave operations to run in
//! order:
//!
//! ```json
//! {"commands": [
//!   {"type": "ADD_SERVICE", "args": {"service_id": "api", "config": {"image": "api:1"}}},
//!   {"type": "SET_CONNECTION", "args": {"a": "left", "b": "right", "state": {"type": "blocked"}}}
//! ]}
//! ```
//!
//! [`BulkCommandProcessor::run`] stops at the first failing command and
//! reports its index; commands before it stay applied.

use crate::artifact::FilesArtifact;
use crate::enclave::{Enclave, RepartitionRequest};
use crate::error::{Error, Result};
use crate::ids::{ExtensionId, PartitionId, ServiceId};
use crate::partition::ConnectionState;
use crate::runtime::ExecResult;
use crate::service::{HttpEndpointCheck, Service, ServiceConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, instrument};

/// A parsed bulk command file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkCommands {
    /// Commands, run in order.
    pub commands: Vec<Command>,
}

impl BulkCommands {
    /// Parses a bulk command document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] for malformed JSON or an unknown
    /// command type.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// One enclave operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "args", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    AddService {
        service_id: ServiceId,
        config: ServiceConfig,
    },
    RemoveService {
        service_id: ServiceId,
    },
    Repartition(RepartitionRequest),
    SetConnection {
        a: PartitionId,
        b: PartitionId,
        state: ConnectionState,
    },
    UnsetConnection {
        a: PartitionId,
        b: PartitionId,
    },
    SetDefaultConnection {
        state: ConnectionState,
    },
    LoadExtension {
        extension_id: ExtensionId,
        image: String,
        #[serde(default)]
        params: String,
    },
    ExecuteExtension {
        extension_id: ExtensionId,
        #[serde(default)]
        params: String,
    },
    UnloadExtension {
        extension_id: ExtensionId,
    },
    ExecCommand {
        service_id: ServiceId,
        command: Vec<String>,
    },
    /// Packs a local directory into a files artifact.
    StoreFilesArtifact {
        path: PathBuf,
        #[serde(default)]
        name: Option<String>,
    },
    /// Copies a path out of a service into a files artifact.
    StoreFilesFromService {
        service_id: ServiceId,
        path: String,
        #[serde(default)]
        name: Option<String>,
    },
    PauseService {
        service_id: ServiceId,
    },
    UnpauseService {
        service_id: ServiceId,
    },
    WaitForHttpEndpoint {
        service_id: ServiceId,
        check: HttpEndpointCheck,
    },
}

impl Command {
    /// Wire name of the command type.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddService { .. } => "ADD_SERVICE",
            Self::RemoveService { .. } => "REMOVE_SERVICE",
            Self::Repartition(_) => "REPARTITION",
            Self::SetConnection { .. } => "SET_CONNECTION",
            Self::UnsetConnection { .. } => "UNSET_CONNECTION",
            Self::SetDefaultConnection { .. } => "SET_DEFAULT_CONNECTION",
            Self::LoadExtension { .. } => "LOAD_EXTENSION",
            Self::ExecuteExtension { .. } => "EXECUTE_EXTENSION",
            Self::UnloadExtension { .. } => "UNLOAD_EXTENSION",
            Self::ExecCommand { .. } => "EXEC_COMMAND",
            Self::StoreFilesArtifact { .. } => "STORE_FILES_ARTIFACT",
            Self::StoreFilesFromService { .. } => "STORE_FILES_FROM_SERVICE",
            Self::PauseService { .. } => "PAUSE_SERVICE",
            Self::UnpauseService { .. } => "UNPAUSE_SERVICE",
            Self::WaitForHttpEndpoint { .. } => "WAIT_FOR_HTTP_ENDPOINT",
        }
    }
}

/// Result of one successful command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CommandOutput {
    /// The command returns nothing.
    Done,
    /// A service was added.
    Service(Service),
    /// Whether an override existed before it was unset.
    Unset(bool),
    /// An extension was loaded at this address.
    Extension(std::net::Ipv4Addr),
    /// Extension response.
    Response(String),
    /// Output of a successful exec.
    Exec(ExecResult),
    /// A files artifact was stored.
    Artifact(FilesArtifact),
}

/// Runs bulk commands against one enclave.
pub struct BulkCommandProcessor<'a> {
    enclave: &'a Enclave,
}

impl<'a> BulkCommandProcessor<'a> {
    /// Creates a processor for `enclave`.
    #[must_use]
    pub fn new(enclave: &'a Enclave) -> Self {
        Self { enclave }
    }

    /// Runs every command in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandAborted`] with the index of the first
    /// failing command. A non-zero exec exit counts as a failure.
    #[instrument(skip_all, fields(enclave = %self.enclave.id(), commands = bulk.commands.len()))]
    pub async fn run(&self, bulk: BulkCommands) -> Result<Vec<CommandOutput>> {
        let mut outputs = Vec::with_capacity(bulk.commands.len());
        for (index, command) in bulk.commands.into_iter().enumerate() {
            let kind = command.kind();
            debug!(index, command = kind, "running command");
            let output = self.dispatch(command).await.map_err(|e| Error::CommandAborted {
                index,
                command: kind.to_string(),
                source: Box::new(e),
            })?;
            outputs.push(output);
        }
        info!(completed = outputs.len(), "bulk commands finished");
        Ok(outputs)
    }

    async fn dispatch(&self, command: Command) -> Result<CommandOutput> {
        let enclave = self.enclave;
        Ok(match command {
            Command::AddService { service_id, config } => {
                CommandOutput::Service(enclave.add_service(&service_id, config).await?)
            }
            Command::RemoveService { service_id } => {
                enclave.remove_service(&service_id).await?;
                CommandOutput::Done
            }
            Command::Repartition(request) => {
                enclave.repartition(request).await?;
                CommandOutput::Done
            }
            Command::SetConnection { a, b, state } => {
                enclave.set_connection(a, b, state).await?;
                CommandOutput::Done
            }
            Command::UnsetConnection { a, b } => CommandOutput::Unset(enclave.unset_connection(a, b).await?),
            Command::SetDefaultConnection { state } => {
                enclave.set_default_connection(state).await?;
                CommandOutput::Done
            }
            Command::LoadExtension {
                extension_id,
                image,
                params,
            } => {
                let record = enclave.load_extension(&extension_id, &image, &params).await?;
                CommandOutput::Extension(record.ip)
            }
            Command::ExecuteExtension { extension_id, params } => {
                CommandOutput::Response(enclave.execute_extension(&extension_id, &params).await?)
            }
            Command::UnloadExtension { extension_id } => {
                enclave.unload_extension(&extension_id).await?;
                CommandOutput::Done
            }
            Command::ExecCommand { service_id, command } => {
                let result = enclave.exec(&service_id, &command).await?;
                if !result.is_success() {
                    return Err(Error::CommandFailed {
                        exit_code: result.exit_code,
                        output: result.output,
                    });
                }
                CommandOutput::Exec(result)
            }
            Command::StoreFilesArtifact { path, name } => {
                CommandOutput::Artifact(enclave.store_directory(&path, name.as_deref())?)
            }
            Command::StoreFilesFromService { service_id, path, name } => CommandOutput::Artifact(
                enclave
                    .store_files_from_service(&service_id, &path, name.as_deref())
                    .await?,
            ),
            Command::PauseService { service_id } => {
                enclave.pause_service(&service_id).await?;
                CommandOutput::Done
            }
            Command::UnpauseService { service_id } => {
                enclave.unpause_service(&service_id).await?;
                CommandOutput::Done
            }
            Command::WaitForHttpEndpoint { service_id, check } => {
                enclave.wait_for_http_endpoint(&service_id, &check).await?;
                CommandOutput::Done
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::enclave::EnclaveManager;
    use crate::extension::InMemoryConnector;
    use crate::ids::EnclaveId;
    use crate::runtimes::InMemoryRuntime;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn enclave(dir: &TempDir, runtime: Arc<InMemoryRuntime>) -> (EnclaveManager, Arc<Enclave>) {
        enclave_with(dir, runtime, true).await
    }

    async fn enclave_with(
        dir: &TempDir,
        runtime: Arc<InMemoryRuntime>,
        partitioning_enabled: bool,
    ) -> (EnclaveManager, Arc<Enclave>) {
        let config = EngineConfig {
            data_dir: dir.path().to_path_buf(),
            network_retry_interval: Duration::ZERO,
            partitioning_enabled,
            ..EngineConfig::default()
        };
        let manager = EnclaveManager::new(config, runtime, Arc::new(InMemoryConnector::echo())).unwrap();
        let enclave = manager.create_enclave(&EnclaveId::new("bulk").unwrap()).await.unwrap();
        (manager, enclave)
    }

    #[test]
    fn test_parse_tagged_commands() {
        let bulk = BulkCommands::from_json(
            r#"{"commands": [
                {"type": "ADD_SERVICE", "args": {"service_id": "api", "config": {"image": "api:1"}}},
                {"type": "SET_CONNECTION", "args": {"a": "left", "b": "right", "state": {"type": "blocked"}}},
                {"type": "EXEC_COMMAND", "args": {"service_id": "api", "command": ["true"]}}
            ]}"#,
        )
        .unwrap();
        assert_eq!(bulk.commands.len(), 3);
        assert_eq!(bulk.commands[0].kind(), "ADD_SERVICE");
        assert!(matches!(
            &bulk.commands[1],
            Command::SetConnection { state, .. } if state.is_blocked()
        ));
    }

    #[test]
    fn test_unknown_command_is_rejected() {
        let err = BulkCommands::from_json(r#"{"commands": [{"type": "REBOOT", "args": {}}]}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[tokio::test]
    async fn test_run_applies_commands_in_order() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        let (_manager, enclave) = enclave(&dir, runtime).await;

        let bulk = BulkCommands::from_json(
            r#"{"commands": [
                {"type": "ADD_SERVICE", "args": {"service_id": "a", "config": {"image": "app", "partition": "left"}}},
                {"type": "ADD_SERVICE", "args": {"service_id": "b", "config": {"image": "app", "partition": "right"}}},
                {"type": "SET_CONNECTION", "args": {"a": "left", "b": "right", "state": {"type": "blocked"}}},
                {"type": "EXEC_COMMAND", "args": {"service_id": "a", "command": ["echo", "hi"]}}
            ]}"#,
        )
        .unwrap();
        let outputs = BulkCommandProcessor::new(&enclave).run(bulk).await.unwrap();
        assert_eq!(outputs.len(), 4);
        assert!(matches!(outputs[0], CommandOutput::Service(_)));
        assert!(matches!(outputs[3], CommandOutput::Exec(_)));

        let a = ServiceId::new("a").unwrap();
        let b = ServiceId::new("b").unwrap();
        assert!(enclave.connection_between(&a, &b).await.unwrap().is_blocked());
    }

    #[tokio::test]
    async fn test_failed_exec_aborts_with_index() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new());
        // No sidecars, so the only exec is the one in the file.
        let (_manager, enclave) = enclave_with(&dir, runtime.clone(), false).await;
        runtime.fail_next_exec(1);

        let bulk = BulkCommands::from_json(
            r#"{"commands": [
                {"type": "ADD_SERVICE", "args": {"service_id": "a", "config": {"image": "app"}}},
                {"type": "EXEC_COMMAND", "args": {"service_id": "a", "command": ["false"]}},
                {"type": "REMOVE_SERVICE", "args": {"service_id": "a"}}
            ]}"#,
        )
        .unwrap();
        let err = BulkCommandProcessor::new(&enclave).run(bulk).await.unwrap_err();
        match err {
            Error::CommandAborted { index, command, source } => {
                assert_eq!(index, 1);
                assert_eq!(command, "EXEC_COMMAND");
                assert!(matches!(*source, Error::CommandFailed { exit_code: 1, .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The service added before the failure stays.
        assert_eq!(enclave.service_network().services().len(), 1);
    }

    #[tokio::test]
    async fn test_store_files_artifact_from_directory() {
        let dir = TempDir::new().unwrap();
        let content = TempDir::new().unwrap();
        std::fs::write(content.path().join("config.toml"), "answer = 42\n").unwrap();
        let (_manager, enclave) = enclave(&dir, Arc::new(InMemoryRuntime::new())).await;

        let outputs = BulkCommandProcessor::new(&enclave)
            .run(BulkCommands {
                commands: vec![Command::StoreFilesArtifact {
                    path: content.path().to_path_buf(),
                    name: Some("conf".to_string()),
                }],
            })
            .await
            .unwrap();
        let CommandOutput::Artifact(artifact) = &outputs[0] else {
            panic!("expected an artifact");
        };
        assert_eq!(artifact.name, "conf");
        let entries = enclave.inspect_artifact("conf").unwrap();
        assert!(entries.iter().any(|e| e.path.ends_with("config.toml")));
    }

    #[tokio::test]
    async fn test_pause_and_copy_out_of_service() {
        let dir = TempDir::new().unwrap();
        let runtime = Arc::new(InMemoryRuntime::new().with_file("app", "/out/report.txt", "done"));
        let (_manager, enclave) = enclave_with(&dir, runtime.clone(), false).await;

        let bulk = BulkCommands::from_json(
            r#"{"commands": [
                {"type": "ADD_SERVICE", "args": {"service_id": "a", "config": {"image": "app"}}},
                {"type": "PAUSE_SERVICE", "args": {"service_id": "a"}},
                {"type": "UNPAUSE_SERVICE", "args": {"service_id": "a"}},
                {"type": "STORE_FILES_FROM_SERVICE", "args": {"service_id": "a", "path": "/out", "name": "report"}}
            ]}"#,
        )
        .unwrap();
        let outputs = BulkCommandProcessor::new(&enclave).run(bulk).await.unwrap();
        let CommandOutput::Artifact(artifact) = &outputs[3] else {
            panic!("expected an artifact");
        };
        assert_eq!(artifact.name, "report");
        let entries = enclave.inspect_artifact("report").unwrap();
        assert!(entries.iter().any(|e| e.path == "out/report.txt"));
    }

    #[tokio::test]
    async fn test_wait_on_paused_service_aborts() {
        let dir = TempDir::new().unwrap();
        let (_manager, enclave) = enclave_with(&dir, Arc::new(InMemoryRuntime::new()), false).await;

        let bulk = BulkCommands::from_json(
            r#"{"commands": [
                {"type": "ADD_SERVICE", "args": {"service_id": "a", "config": {"image": "app"}}},
                {"type": "PAUSE_SERVICE", "args": {"service_id": "a"}},
                {"type": "WAIT_FOR_HTTP_ENDPOINT", "args": {"service_id": "a", "check": {"port": 80, "retries": 1}}}
            ]}"#,
        )
        .unwrap();
        let err = BulkCommandProcessor::new(&enclave).run(bulk).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CommandAborted { index: 2, ref source, .. } if matches!(**source, Error::InvalidState { .. })
        ));
    }
}
