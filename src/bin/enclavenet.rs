//! enclavenet - enclave orchestration CLI
//!
//! Creates and destroys isolated container networks ("enclaves") on the
//! local Docker daemon and runs bulk command files against them.
//!
//! ## Usage
//!
//! ```sh
//! enclavenet create <enclave-id>
//! enclavenet destroy <enclave-id>
//! enclavenet list
//! enclavenet run <enclave-id> <bulk-commands.json>
//! enclavenet version
//! ```
//!
//! Global flags: `--config <file>` loads a YAML engine configuration,
//! `--verbose` turns on debug logging. `RUST_LOG` overrides both.

use enclavenet::commands::{BulkCommandProcessor, BulkCommands};
use enclavenet::config::EngineConfig;
use enclavenet::constants::EXTENSION_CALL_TIMEOUT;
use enclavenet::enclave::EnclaveManager;
use enclavenet::extension::TcpConnector;
use enclavenet::ids::EnclaveId;
use enclavenet::runtimes::DockerRuntime;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Create { id: String },
    Destroy { id: String },
    List,
    Run { id: String, file: PathBuf },
    Version,
    Help,
}

#[derive(Debug)]
struct Cli {
    command: Command,
    config: Option<PathBuf>,
    verbose: bool,
}

fn parse_args() -> Result<Cli, String> {
    let mut config = None;
    let mut verbose = false;
    let mut positional = Vec::new();

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().ok_or("--config requires a path")?;
                config = Some(PathBuf::from(path));
            }
            "--verbose" | "-V" => verbose = true,
            _ => positional.push(arg),
        }
    }

    let command = match positional.first().map(String::as_str) {
        None | Some("help" | "--help" | "-h") => Command::Help,
        Some("create") => Command::Create {
            id: positional.get(1).cloned().ok_or("create requires <enclave-id>")?,
        },
        Some("destroy") => Command::Destroy {
            id: positional.get(1).cloned().ok_or("destroy requires <enclave-id>")?,
        },
        Some("list") => Command::List,
        Some("run") => {
            if positional.len() < 3 {
                return Err("run requires <enclave-id> <bulk-commands.json>".to_string());
            }
            Command::Run {
                id: positional[1].clone(),
                file: PathBuf::from(&positional[2]),
            }
        }
        Some("version" | "--version" | "-v") => Command::Version,
        Some(unknown) => return Err(format!("unknown command: {unknown}")),
    };

    Ok(Cli {
        command,
        config,
        verbose,
    })
}

// =============================================================================
// Command Implementations
// =============================================================================

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig, String> {
    match path {
        Some(path) => EngineConfig::from_yaml_file(path).map_err(|e| format!("config {}: {e}", path.display())),
        None => Ok(EngineConfig::from_env()),
    }
}

async fn manager(config: EngineConfig) -> Result<EnclaveManager, String> {
    let runtime = Arc::new(DockerRuntime::from_config(&config).map_err(|e| e.to_string())?);
    let connector = Arc::new(TcpConnector::new(EXTENSION_CALL_TIMEOUT));
    let manager = EnclaveManager::new(config, runtime, connector).map_err(|e| e.to_string())?;
    let report = manager.reconcile().await.map_err(|e| format!("reconcile: {e}"))?;
    for network in &report.orphan_networks {
        eprintln!("warning: network {network} belongs to no known enclave");
    }
    Ok(manager)
}

fn enclave_id(id: &str) -> Result<EnclaveId, String> {
    EnclaveId::new(id).map_err(|e| e.to_string())
}

async fn cmd_create(manager: &EnclaveManager, id: &str) -> Result<(), String> {
    let enclave = manager
        .create_enclave(&enclave_id(id)?)
        .await
        .map_err(|e| e.to_string())?;
    println!(
        "{}\t{}\t{}",
        enclave.id(),
        enclave.network().subnet,
        enclave.network().id
    );
    Ok(())
}

async fn cmd_destroy(manager: &EnclaveManager, id: &str) -> Result<(), String> {
    let report = manager
        .destroy_enclave(&enclave_id(id)?)
        .await
        .map_err(|e| e.to_string())?;
    report.into_result().map_err(|e| e.to_string())
}

fn cmd_list(manager: &EnclaveManager) {
    println!("{:<24} {:<12} {:<18} SERVICES", "ID", "STATE", "SUBNET");
    for enclave in manager.list_enclaves() {
        println!(
            "{:<24} {:<12} {:<18} {}",
            enclave.id().to_string(),
            enclave.state().to_string(),
            enclave.network().subnet.to_string(),
            enclave.service_network().services().len()
        );
    }
}

async fn cmd_run(manager: &EnclaveManager, id: &str, file: &Path) -> Result<(), String> {
    let enclave = manager.get_enclave(&enclave_id(id)?).map_err(|e| e.to_string())?;
    let json = std::fs::read_to_string(file).map_err(|e| format!("{}: {e}", file.display()))?;
    let bulk = BulkCommands::from_json(&json).map_err(|e| e.to_string())?;
    let outputs = BulkCommandProcessor::new(&enclave)
        .run(bulk)
        .await
        .map_err(|e| e.to_string())?;
    let rendered = serde_json::to_string_pretty(&outputs).map_err(|e| format!("serialize: {e}"))?;
    println!("{rendered}");
    Ok(())
}

fn cmd_version() {
    println!("enclavenet {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        "enclavenet - enclave orchestration

USAGE:
    enclavenet [--config <file>] [--verbose] <command> [args...]

COMMANDS:
    create <enclave-id>                   Create an enclave and its network
    destroy <enclave-id>                  Destroy an enclave and everything in it
    list                                  List enclaves
    run <enclave-id> <bulk-commands.json> Run a bulk command file
    version                               Show version
    help                                  Show this help"
    );
}

fn init_logging(verbose: bool) {
    let default = if verbose { "enclavenet=debug" } else { "enclavenet=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), String> {
    match cli.command {
        Command::Version => {
            cmd_version();
            Ok(())
        }
        Command::Help => {
            cmd_help();
            Ok(())
        }
        command => {
            let manager = manager(load_config(cli.config.as_ref())?).await?;
            match command {
                Command::Create { id } => cmd_create(&manager, &id).await,
                Command::Destroy { id } => cmd_destroy(&manager, &id).await,
                Command::List => {
                    cmd_list(&manager);
                    Ok(())
                }
                Command::Run { id, file } => cmd_run(&manager, &id, &file).await,
                Command::Version | Command::Help => Ok(()),
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match parse_args() {
        Ok(cli) => {
            init_logging(cli.verbose);
            match dispatch(cli).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
