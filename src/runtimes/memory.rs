//! In-memory container runtime.
//!
//! A process-local fake of [`ContainerRuntime`] used by the test suites and
//! by callers that want to exercise orchestration logic without a container
//! engine. It enforces the same invariants a real runtime does (unique
//! names, non-overlapping subnets, one address per container per network,
//! no removal of networks with attached containers) and supports failure
//! injection:
//!
//! - `fail_next_network_creates(n)`: next `n` network creations report a
//!   subnet overlap
//! - `fail_next_container_create(reason)`: next container creation fails
//! - `fail_container_kill(name_fragment)`: kills of matching containers fail
//! - `fail_next_exec(n)`: next `n` execs return a non-zero exit code
//! - `with_exit_code(image, code)`: containers of `image` exit immediately
//!
//! `with_file(image, path, contents)` seeds a file into every container of
//! `image` for [`ContainerRuntime::copy_from_container`].
//!
//! Every `exec` is recorded and can be inspected with [`InMemoryRuntime::exec_log`].

use crate::error::{Error, Result};
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerStatus, ExecResult, HostPortBinding,
    Labels, NetworkAttachment, NetworkInfo, NetworkSpec, StartedContainer,
};
use async_trait::async_trait;
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;

/// Exit code reported for killed containers.
const KILLED_EXIT_CODE: i64 = 137;

/// First host port handed out for published ports.
const FIRST_HOST_PORT: u16 = 32768;

/// A recorded `exec` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    /// Container the command ran in.
    pub container_id: String,
    /// Container name.
    pub container_name: String,
    /// Command and arguments.
    pub command: Vec<String>,
}

struct FakeNetwork {
    name: String,
    subnet: Ipv4Network,
    labels: Labels,
}

struct FakeContainer {
    spec: ContainerSpec,
    status: ContainerStatus,
    exit_code: Option<i64>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    next_host_port: u16,
    networks: BTreeMap<String, FakeNetwork>,
    volumes: BTreeMap<String, Labels>,
    containers: BTreeMap<String, FakeContainer>,
    exec_log: Vec<ExecRecord>,
    overlap_failures: usize,
    create_failure: Option<String>,
    kill_failures: Vec<String>,
    exec_failures: usize,
    exit_codes: HashMap<String, i64>,
    logs: HashMap<String, String>,
    files: HashMap<String, BTreeMap<String, Vec<u8>>>,
}

impl State {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}{:012x}", self.next_id)
    }
}

/// In-memory [`ContainerRuntime`].
pub struct InMemoryRuntime {
    state: Mutex<State>,
}

impl InMemoryRuntime {
    /// Creates an empty runtime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_host_port: FIRST_HOST_PORT,
                ..State::default()
            }),
        }
    }

    /// Containers of `image` exit immediately with `code` after starting.
    #[must_use]
    pub fn with_exit_code(self, image: impl Into<String>, code: i64) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.exit_codes.insert(image.into(), code);
        }
        self
    }

    /// Containers of `image` report `logs` from [`ContainerRuntime::container_logs`].
    #[must_use]
    pub fn with_logs(self, image: impl Into<String>, logs: impl Into<String>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.logs.insert(image.into(), logs.into());
        }
        self
    }

    /// Containers of `image` hold a file at absolute `path`.
    #[must_use]
    pub fn with_file(self, image: impl Into<String>, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.seed_file(image, path, contents);
        self
    }

    /// As [`InMemoryRuntime::with_file`], on a shared runtime.
    pub fn seed_file(&self, image: impl Into<String>, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .files
                .entry(image.into())
                .or_default()
                .insert(path.into(), contents.into());
        }
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    // =========================================================================
    // Failure Injection
    // =========================================================================

    /// The next `count` network creations fail with a subnet overlap.
    pub fn fail_next_network_creates(&self, count: usize) {
        if let Ok(mut state) = self.state() {
            state.overlap_failures = count;
        }
    }

    /// The next container creation fails with `reason`.
    pub fn fail_next_container_create(&self, reason: impl Into<String>) {
        if let Ok(mut state) = self.state() {
            state.create_failure = Some(reason.into());
        }
    }

    /// Kills and removals of containers whose name contains `fragment` fail.
    pub fn fail_container_kill(&self, fragment: impl Into<String>) {
        if let Ok(mut state) = self.state() {
            state.kill_failures.push(fragment.into());
        }
    }

    /// The next `count` execs exit with code 1.
    pub fn fail_next_exec(&self, count: usize) {
        if let Ok(mut state) = self.state() {
            state.exec_failures = count;
        }
    }

    /// Registers a network the engine does not own (e.g. created by another
    /// tool) so that subnet scanning has to avoid it.
    pub fn add_foreign_network(&self, name: &str, subnet: Ipv4Network) {
        if let Ok(mut state) = self.state() {
            let id = state.next_id("net");
            state.networks.insert(
                id,
                FakeNetwork {
                    name: name.to_string(),
                    subnet,
                    labels: Labels::new(),
                },
            );
        }
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every recorded exec, oldest first.
    #[must_use]
    pub fn exec_log(&self) -> Vec<ExecRecord> {
        self.state().map(|s| s.exec_log.clone()).unwrap_or_default()
    }

    /// Number of existing networks.
    #[must_use]
    pub fn network_count(&self) -> usize {
        self.state().map(|s| s.networks.len()).unwrap_or_default()
    }

    /// Whether a network with this ID exists.
    #[must_use]
    pub fn has_network(&self, network_id: &str) -> bool {
        self.state()
            .map(|s| s.networks.contains_key(network_id))
            .unwrap_or_default()
    }

    /// Names of all existing containers.
    #[must_use]
    pub fn container_names(&self) -> Vec<String> {
        self.state()
            .map(|s| s.containers.values().map(|c| c.spec.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of running containers.
    #[must_use]
    pub fn running_container_names(&self) -> Vec<String> {
        self.state()
            .map(|s| {
                s.containers
                    .values()
                    .filter(|c| c.status == ContainerStatus::Running)
                    .map(|c| c.spec.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The `ContainerSpec` a container was created with.
    #[must_use]
    pub fn container_spec(&self, container_id: &str) -> Option<ContainerSpec> {
        self.state()
            .ok()?
            .containers
            .get(container_id)
            .map(|c| c.spec.clone())
    }

    /// Status of a container, `None` once removed.
    #[must_use]
    pub fn container_status(&self, container_id: &str) -> Option<ContainerStatus> {
        self.state()
            .ok()?
            .containers
            .get(container_id)
            .map(|c| c.status)
    }

    /// Names of all existing volumes.
    #[must_use]
    pub fn volume_names(&self) -> Vec<String> {
        self.state()
            .map(|s| s.volumes.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn kill_should_fail(state: &State, name: &str) -> bool {
        state.kill_failures.iter().any(|f| name.contains(f.as_str()))
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

fn labels_match(have: &Labels, want: &Labels) -> bool {
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}

fn overlaps(a: &Ipv4Network, b: &Ipv4Network) -> bool {
    a.contains(b.network()) || b.contains(a.network())
}

/// Tars every seeded file at or below `path`, rooted at its basename.
fn tar_files(files: &BTreeMap<String, Vec<u8>>, path: &str) -> Result<Option<Vec<u8>>> {
    let path = path.trim_end_matches('/');
    let base = path.rsplit('/').next().unwrap_or(path);
    let mut builder = tar::Builder::new(Vec::new());
    let mut found = false;
    for (file, contents) in files {
        let relative = if file == path {
            base.to_string()
        } else if let Some(rest) = file.strip_prefix(path).and_then(|r| r.strip_prefix('/')) {
            format!("{base}/{rest}")
        } else {
            continue;
        };
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, relative, contents.as_slice())?;
        found = true;
    }
    if !found {
        return Ok(None);
    }
    Ok(Some(builder.into_inner()?))
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let mut state = self.state()?;
        if state.overlap_failures > 0 {
            state.overlap_failures -= 1;
            return Err(Error::SubnetOverlap {
                subnet: spec.subnet.to_string(),
            });
        }
        if state.networks.values().any(|n| overlaps(&n.subnet, &spec.subnet)) {
            return Err(Error::SubnetOverlap {
                subnet: spec.subnet.to_string(),
            });
        }
        if state.networks.values().any(|n| n.name == spec.name) {
            return Err(Error::runtime(
                "create_network",
                &spec.name,
                "network name already in use",
            ));
        }
        let id = state.next_id("net");
        state.networks.insert(
            id.clone(),
            FakeNetwork {
                name: spec.name.clone(),
                subnet: spec.subnet,
                labels: spec.labels.clone(),
            },
        );
        Ok(id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        let mut state = self.state()?;
        let attached = state.containers.values().any(|c| {
            matches!(&c.spec.network, NetworkAttachment::Network { network_id: n, .. } if n == network_id)
        });
        if attached {
            return Err(Error::runtime(
                "remove_network",
                network_id,
                "network has active endpoints",
            ));
        }
        state
            .networks
            .remove(network_id)
            .map(|_| ())
            .ok_or_else(|| Error::runtime("remove_network", network_id, "no such network"))
    }

    async fn list_networks(&self, labels: &Labels) -> Result<Vec<NetworkInfo>> {
        let state = self.state()?;
        Ok(state
            .networks
            .iter()
            .filter(|(_, n)| labels_match(&n.labels, labels))
            .map(|(id, n)| NetworkInfo {
                id: id.clone(),
                name: n.name.clone(),
                subnets: vec![n.subnet],
                labels: n.labels.clone(),
            })
            .collect())
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<()> {
        let mut state = self.state()?;
        if state.volumes.contains_key(name) {
            return Err(Error::runtime("create_volume", name, "volume already exists"));
        }
        state.volumes.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state()?;
        let in_use = state.containers.values().any(|c| {
            c.spec
                .mounts
                .iter()
                .any(|m| m.source == crate::runtime::MountSource::Volume(name.to_string()))
        });
        if in_use {
            return Err(Error::runtime("remove_volume", name, "volume is in use"));
        }
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::runtime("remove_volume", name, "no such volume"))
    }

    async fn list_volumes(&self, labels: &Labels) -> Result<Vec<String>> {
        let state = self.state()?;
        Ok(state
            .volumes
            .iter()
            .filter(|(_, l)| labels_match(l, labels))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn create_and_start_container(&self, spec: &ContainerSpec) -> Result<StartedContainer> {
        let mut state = self.state()?;
        if let Some(reason) = state.create_failure.take() {
            return Err(Error::runtime("create_container", &spec.name, reason));
        }
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(Error::runtime(
                "create_container",
                &spec.name,
                "container name already in use",
            ));
        }
        match &spec.network {
            NetworkAttachment::Network { network_id, ip } => {
                let network = state.networks.get(network_id).ok_or_else(|| {
                    Error::runtime("create_container", &spec.name, "no such network")
                })?;
                if !network.subnet.contains(*ip) {
                    return Err(Error::runtime(
                        "create_container",
                        &spec.name,
                        format!("{ip} is outside {}", network.subnet),
                    ));
                }
                let taken = state.containers.values().any(|c| {
                    matches!(&c.spec.network, NetworkAttachment::Network { network_id: n, ip: i }
                        if n == network_id && i == ip)
                });
                if taken {
                    return Err(Error::runtime(
                        "create_container",
                        &spec.name,
                        format!("address {ip} already in use"),
                    ));
                }
            }
            NetworkAttachment::Container(target) => {
                let running = state
                    .containers
                    .get(target)
                    .is_some_and(|c| c.status == ContainerStatus::Running);
                if !running {
                    return Err(Error::runtime(
                        "create_container",
                        &spec.name,
                        format!("namespace owner {target} is not running"),
                    ));
                }
            }
        }
        for mount in &spec.mounts {
            if let crate::runtime::MountSource::Volume(volume) = &mount.source
                && !state.volumes.contains_key(volume)
            {
                return Err(Error::runtime(
                    "create_container",
                    &spec.name,
                    format!("no such volume {volume}"),
                ));
            }
        }

        let mut host_port_bindings = BTreeMap::new();
        if spec.publish_ports {
            for port in &spec.ports {
                let host_port = state.next_host_port;
                state.next_host_port = state.next_host_port.wrapping_add(1);
                host_port_bindings.insert(
                    *port,
                    HostPortBinding {
                        host_ip: Ipv4Addr::LOCALHOST.to_string(),
                        host_port,
                    },
                );
            }
        }

        let exit_code = state.exit_codes.get(&spec.image).copied();
        let id = state.next_id("ctr");
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec: spec.clone(),
                status: if exit_code.is_some() {
                    ContainerStatus::Exited
                } else {
                    ContainerStatus::Running
                },
                exit_code,
            },
        );
        Ok(StartedContainer {
            id,
            host_port_bindings,
        })
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state()?;
        let fail = match state.containers.get(container_id) {
            Some(c) => Self::kill_should_fail(&state, &c.spec.name),
            None => return Err(Error::runtime("kill_container", container_id, "no such container")),
        };
        if fail {
            return Err(Error::runtime("kill_container", container_id, "injected kill failure"));
        }
        if let Some(container) = state.containers.get_mut(container_id)
            && matches!(container.status, ContainerStatus::Running | ContainerStatus::Paused)
        {
            container.status = ContainerStatus::Exited;
            container.exit_code = Some(KILLED_EXIT_CODE);
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state()?;
        let fail = match state.containers.get(container_id) {
            Some(c) => Self::kill_should_fail(&state, &c.spec.name),
            None => return Err(Error::runtime("remove_container", container_id, "no such container")),
        };
        if fail {
            return Err(Error::runtime("remove_container", container_id, "injected removal failure"));
        }
        state.containers.remove(container_id);
        Ok(())
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state()?;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Error::runtime("pause_container", container_id, "no such container"))?;
        if container.status != ContainerStatus::Running {
            return Err(Error::runtime(
                "pause_container",
                container_id,
                format!("container is {}", container.status),
            ));
        }
        container.status = ContainerStatus::Paused;
        Ok(())
    }

    async fn unpause_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state()?;
        let container = state
            .containers
            .get_mut(container_id)
            .ok_or_else(|| Error::runtime("unpause_container", container_id, "no such container"))?;
        if container.status != ContainerStatus::Paused {
            return Err(Error::runtime("unpause_container", container_id, "container is not paused"));
        }
        container.status = ContainerStatus::Running;
        Ok(())
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<i64> {
        loop {
            {
                let state = self.state()?;
                let container = state.containers.get(container_id).ok_or_else(|| {
                    Error::runtime("wait_for_exit", container_id, "no such container")
                })?;
                if let Some(code) = container.exit_code {
                    return Ok(code);
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecResult> {
        let mut state = self.state()?;
        let name = match state.containers.get(container_id) {
            Some(c) if c.status == ContainerStatus::Running => c.spec.name.clone(),
            Some(c) => {
                return Err(Error::runtime(
                    "exec",
                    container_id,
                    format!("container is {}", c.status),
                ));
            }
            None => return Err(Error::runtime("exec", container_id, "no such container")),
        };
        state.exec_log.push(ExecRecord {
            container_id: container_id.to_string(),
            container_name: name,
            command: command.to_vec(),
        });
        if state.exec_failures > 0 {
            state.exec_failures -= 1;
            return Ok(ExecResult {
                exit_code: 1,
                output: "injected exec failure".to_string(),
            });
        }
        Ok(ExecResult {
            exit_code: 0,
            output: String::new(),
        })
    }

    async fn copy_from_container(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        let state = self.state()?;
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| Error::runtime("copy_from_container", container_id, "no such container"))?;
        let tar = match state.files.get(&container.spec.image) {
            Some(files) => tar_files(files, path)?,
            None => None,
        };
        tar.ok_or_else(|| {
            Error::runtime(
                "copy_from_container",
                container_id,
                format!("no such file or directory: {path}"),
            )
        })
    }

    async fn list_containers(&self, labels: &Labels) -> Result<Vec<ContainerInfo>> {
        let state = self.state()?;
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| labels_match(&c.spec.labels, labels))
            .map(|(id, c)| ContainerInfo {
                id: id.clone(),
                name: c.spec.name.clone(),
                labels: c.spec.labels.clone(),
                status: c.status,
            })
            .collect())
    }

    async fn container_logs(&self, container_id: &str) -> Result<String> {
        let state = self.state()?;
        let container = state
            .containers
            .get(container_id)
            .ok_or_else(|| Error::runtime("container_logs", container_id, "no such container"))?;
        Ok(state
            .logs
            .get(&container.spec.image)
            .cloned()
            .unwrap_or_default())
    }
}
