//! Docker runtime adapter.
//!
//! Talks to the Docker Engine API over its local control socket through
//! `bollard`. Each request is bounded by the configured runtime call
//! timeout; waiting for a container to exit is the one open-ended call.
//!
//! ## Error Mapping
//!
//! | API outcome                                          | Error                  |
//! |------------------------------------------------------|------------------------|
//! | error body contains [`SUBNET_OVERLAP_MARKER`]        | `Error::SubnetOverlap` |
//! | request timed out                                    | `Error::Timeout`       |
//! | any other API or transport error                     | `Error::Runtime`       |

use crate::config::EngineConfig;
use crate::constants::{MAX_OUTPUT_SIZE, SUBNET_OVERLAP_MARKER};
use crate::error::{Error, Result};
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerStatus, ExecResult, HostPortBinding,
    Labels, MountSource, NetworkAttachment, NetworkInfo, NetworkSpec, PortSpec, StartedContainer,
    TransportProtocol,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions,
    ListContainersOptions, LogsOptions, NetworkingConfig, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{
    ContainerSummary, EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig,
    Mount as DockerMount, MountTypeEnum, Network, PortBinding,
};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions};
use futures::StreamExt;
use ipnetwork::Ipv4Network;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

/// Loopback address published ports bind to.
const PUBLISH_HOST_IP: &str = "127.0.0.1";

/// Container runtime backed by the Docker Engine API.
pub struct DockerRuntime {
    docker: Docker,
    call_timeout: Duration,
}

impl DockerRuntime {
    /// Wraps an existing client.
    #[must_use]
    pub fn new(docker: Docker, call_timeout: Duration) -> Self {
        Self {
            docker: docker.with_timeout(call_timeout),
            call_timeout,
        }
    }

    /// Connects to the socket named in the configuration, or to the local
    /// defaults (`DOCKER_HOST`, then the platform socket).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Runtime`] if the client cannot be set up. No request
    /// is made until the first call.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let docker = match &config.runtime_socket {
            Some(socket) => Docker::connect_with_unix(
                &socket.to_string_lossy(),
                config.runtime_call_timeout.as_secs(),
                bollard::API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| Error::runtime("connect", "docker", e))?;
        Ok(Self::new(docker, config.runtime_call_timeout))
    }

    fn error(&self, operation: &str, object: &str, e: DockerError) -> Error {
        map_error(operation, object, e, self.call_timeout)
    }
}

/// Maps an API error, recognizing subnet overlaps and timeouts.
fn map_error(operation: &str, object: &str, e: DockerError, call_timeout: Duration) -> Error {
    match e {
        DockerError::DockerResponseServerError { message, .. } if message.contains(SUBNET_OVERLAP_MARKER) => {
            Error::SubnetOverlap {
                subnet: object.to_string(),
            }
        }
        DockerError::RequestTimeoutError => Error::Timeout {
            operation: format!("{operation} {object}"),
            duration: call_timeout,
        },
        other => Error::runtime(operation, object, other),
    }
}

fn label_map(labels: &Labels) -> HashMap<String, String> {
    labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// `label=k=v` filters; every label must match.
fn label_filters(labels: &Labels) -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    if !labels.is_empty() {
        filters.insert(
            "label".to_string(),
            labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
        );
    }
    filters
}

fn append_capped(buffer: &mut Vec<u8>, bytes: &[u8], what: &str) {
    let room = MAX_OUTPUT_SIZE.saturating_sub(buffer.len());
    if bytes.len() > room {
        if room > 0 {
            warn!("{what} truncated to {MAX_OUTPUT_SIZE} bytes");
        }
        buffer.extend_from_slice(&bytes[..room]);
    } else {
        buffer.extend_from_slice(bytes);
    }
}

/// Builds the create-container request for a spec.
fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut host_config = HostConfig {
        cap_add: (!spec.capabilities.is_empty()).then(|| spec.capabilities.clone()),
        mounts: Some(
            spec.mounts
                .iter()
                .map(|mount| {
                    let (typ, source) = match &mount.source {
                        MountSource::Volume(name) => (MountTypeEnum::VOLUME, name.clone()),
                        MountSource::Bind(path) => (MountTypeEnum::BIND, path.display().to_string()),
                    };
                    DockerMount {
                        target: Some(mount.target.clone()),
                        source: Some(source),
                        typ: Some(typ),
                        read_only: Some(mount.read_only),
                        ..DockerMount::default()
                    }
                })
                .collect(),
        ),
        ..HostConfig::default()
    };

    let mut networking_config = None;
    match &spec.network {
        NetworkAttachment::Network { network_id, ip } => {
            host_config.network_mode = Some(network_id.clone());
            let endpoint = EndpointSettings {
                ipam_config: Some(EndpointIpamConfig {
                    ipv4_address: Some(ip.to_string()),
                    ..EndpointIpamConfig::default()
                }),
                ..EndpointSettings::default()
            };
            networking_config = Some(NetworkingConfig {
                endpoints_config: HashMap::from([(network_id.clone(), endpoint)]),
            });
        }
        NetworkAttachment::Container(target) => {
            host_config.network_mode = Some(format!("container:{target}"));
        }
    }

    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .iter()
        .map(|port| (port.to_string(), HashMap::new()))
        .collect();
    if spec.publish_ports && !spec.ports.is_empty() {
        host_config.port_bindings = Some(
            spec.ports
                .iter()
                .map(|port| {
                    let binding = PortBinding {
                        host_ip: Some(PUBLISH_HOST_IP.to_string()),
                        host_port: None,
                    };
                    (port.to_string(), Some(vec![binding]))
                })
                .collect(),
        );
    }

    Config {
        image: Some(spec.image.clone()),
        labels: Some(label_map(&spec.labels)),
        env: Some(spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
        entrypoint: spec.entrypoint.clone(),
        cmd: spec.cmd.clone(),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        networking_config,
        ..Config::default()
    }
}

/// Parses a port key such as `8080/tcp`.
fn parse_port_key(key: &str) -> Option<PortSpec> {
    let (number, protocol) = key.split_once('/')?;
    let protocol = match protocol {
        "tcp" => TransportProtocol::Tcp,
        "udp" => TransportProtocol::Udp,
        "sctp" => TransportProtocol::Sctp,
        _ => return None,
    };
    Some(PortSpec {
        number: number.parse().ok()?,
        protocol,
    })
}

/// Reads host bindings from an inspected container's port map.
fn parse_port_bindings(
    ports: &HashMap<String, Option<Vec<PortBinding>>>,
) -> BTreeMap<PortSpec, HostPortBinding> {
    let mut bindings = BTreeMap::new();
    for (key, published) in ports {
        let Some(port) = parse_port_key(key) else {
            continue;
        };
        // IPv6 bindings repeat IPv4 ones; prefer the IPv4 one.
        let Some(binding) = published.iter().flatten().find(|b| {
            b.host_ip
                .as_deref()
                .is_none_or(|ip| ip.parse::<std::net::Ipv4Addr>().is_ok())
        }) else {
            continue;
        };
        let Some(host_port) = binding.host_port.as_deref().and_then(|p| p.parse().ok()) else {
            continue;
        };
        bindings.insert(
            port,
            HostPortBinding {
                host_ip: binding.host_ip.clone().unwrap_or_else(|| PUBLISH_HOST_IP.to_string()),
                host_port,
            },
        );
    }
    bindings
}

fn network_info(network: Network) -> NetworkInfo {
    let subnets = network
        .ipam
        .and_then(|ipam| ipam.config)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|c| c.subnet)
        // IPv6 subnets do not parse as Ipv4Network and are skipped.
        .filter_map(|s| s.parse::<Ipv4Network>().ok())
        .collect();
    NetworkInfo {
        id: network.id.unwrap_or_default(),
        name: network.name.unwrap_or_default(),
        subnets,
        labels: network.labels.unwrap_or_default().into_iter().collect(),
    }
}

fn container_status(state: &str) -> ContainerStatus {
    match state {
        "running" | "restarting" => ContainerStatus::Running,
        "paused" => ContainerStatus::Paused,
        "created" => ContainerStatus::Created,
        _ => ContainerStatus::Exited,
    }
}

fn container_info(summary: ContainerSummary) -> ContainerInfo {
    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name: summary
            .names
            .and_then(|names| names.into_iter().next())
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        labels: summary.labels.unwrap_or_default().into_iter().collect(),
        status: container_status(summary.state.as_deref().unwrap_or_default()),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String> {
        let subnet = spec.subnet.to_string();
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            check_duplicate: true,
            driver: "bridge".to_string(),
            ipam: Ipam {
                config: Some(vec![IpamConfig {
                    subnet: Some(subnet.clone()),
                    gateway: Some(spec.gateway.to_string()),
                    ..IpamConfig::default()
                }]),
                ..Ipam::default()
            },
            labels: label_map(&spec.labels),
            ..CreateNetworkOptions::default()
        };
        let created = self
            .docker
            .create_network(options)
            .await
            .map_err(|e| self.error("create_network", &subnet, e))?;
        created
            .id
            .ok_or_else(|| Error::runtime("create_network", &spec.name, "no network ID returned"))
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        self.docker
            .remove_network(network_id)
            .await
            .map_err(|e| self.error("remove_network", network_id, e))
    }

    async fn list_networks(&self, labels: &Labels) -> Result<Vec<NetworkInfo>> {
        let options = ListNetworksOptions {
            filters: label_filters(labels),
        };
        let networks = self
            .docker
            .list_networks(Some(options))
            .await
            .map_err(|e| self.error("list_networks", "*", e))?;
        Ok(networks.into_iter().map(network_info).collect())
    }

    async fn create_volume(&self, name: &str, labels: &Labels) -> Result<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            labels: label_map(labels),
            ..CreateVolumeOptions::default()
        };
        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(|e| self.error("create_volume", name, e))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, None)
            .await
            .map_err(|e| self.error("remove_volume", name, e))
    }

    async fn list_volumes(&self, labels: &Labels) -> Result<Vec<String>> {
        let options = ListVolumesOptions {
            filters: label_filters(labels),
        };
        let response = self
            .docker
            .list_volumes(Some(options))
            .await
            .map_err(|e| self.error("list_volumes", "*", e))?;
        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| v.name)
            .collect())
    }

    async fn create_and_start_container(&self, spec: &ContainerSpec) -> Result<StartedContainer> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let id = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| self.error("create_container", &spec.name, e))?
            .id;
        debug!(container = %spec.name, id = %id, "created container");

        self.docker
            .start_container(&id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| self.error("start_container", &spec.name, e))?;

        let host_port_bindings = if spec.publish_ports && !spec.ports.is_empty() {
            let inspected = self
                .docker
                .inspect_container(&id, None)
                .await
                .map_err(|e| self.error("inspect_container", &spec.name, e))?;
            inspected
                .network_settings
                .and_then(|settings| settings.ports)
                .map(|ports| parse_port_bindings(&ports))
                .unwrap_or_default()
        } else {
            BTreeMap::new()
        };
        Ok(StartedContainer {
            id,
            host_port_bindings,
        })
    }

    async fn kill_container(&self, container_id: &str) -> Result<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            // 409: the container is not running.
            Err(DockerError::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
            Err(e) => Err(self.error("kill_container", container_id, e)),
        }
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..RemoveContainerOptions::default()
        };
        self.docker
            .remove_container(container_id, Some(options))
            .await
            .map_err(|e| self.error("remove_container", container_id, e))
    }

    async fn pause_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .pause_container(container_id)
            .await
            .map_err(|e| self.error("pause_container", container_id, e))
    }

    async fn unpause_container(&self, container_id: &str) -> Result<()> {
        self.docker
            .unpause_container(container_id)
            .await
            .map_err(|e| self.error("unpause_container", container_id, e))
    }

    async fn wait_for_exit(&self, container_id: &str) -> Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = std::pin::pin!(self.docker.wait_container(container_id, Some(options)));
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exits arrive as errors carrying the code.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(self.error("wait_for_exit", container_id, e)),
            None => Err(Error::runtime("wait_for_exit", container_id, "wait ended without a status")),
        }
    }

    async fn exec(&self, container_id: &str, command: &[String]) -> Result<ExecResult> {
        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..CreateExecOptions::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, options)
            .await
            .map_err(|e| self.error("exec", container_id, e))?;

        let mut output = Vec::new();
        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| self.error("exec", container_id, e))?
        {
            StartExecResults::Attached { output: mut stream, .. } => {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| self.error("exec", container_id, e))?;
                    append_capped(&mut output, &chunk.into_bytes(), "exec output");
                }
            }
            StartExecResults::Detached => {}
        }

        let inspected = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| self.error("exec", container_id, e))?;
        Ok(ExecResult {
            exit_code: inspected.exit_code.unwrap_or(-1),
            output: String::from_utf8_lossy(&output).to_string(),
        })
    }

    async fn copy_from_container(&self, container_id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions { path };
        let mut stream = std::pin::pin!(self.docker.download_from_container(container_id, Some(options)));
        let mut tar = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.error("copy_from_container", container_id, e))?;
            tar.extend_from_slice(&chunk);
        }
        debug!(container = %container_id, path, bytes = tar.len(), "copied files out of container");
        Ok(tar)
    }

    async fn list_containers(&self, labels: &Labels) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions {
            all: true,
            filters: label_filters(labels),
            ..ListContainersOptions::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| self.error("list_containers", "*", e))?;
        Ok(containers.into_iter().map(container_info).collect())
    }

    async fn container_logs(&self, container_id: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_string(),
            ..LogsOptions::default()
        };
        let mut stream = std::pin::pin!(self.docker.logs(container_id, Some(options)));
        let mut logs = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.error("container_logs", container_id, e))?;
            append_capped(&mut logs, &chunk.into_bytes(), "container logs");
        }
        Ok(String::from_utf8_lossy(&logs).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Mount;

    #[test]
    fn test_config_for_sidecar() {
        let mut spec = ContainerSpec::new(
            "sidecar--e1--web",
            "netshoot",
            NetworkAttachment::Container("abc".to_string()),
        );
        spec.capabilities.push("NET_ADMIN".to_string());
        spec.cmd = Some(vec!["sleep".to_string(), "infinity".to_string()]);
        let config = container_config(&spec);
        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("container:abc"));
        assert_eq!(host.cap_add, Some(vec!["NET_ADMIN".to_string()]));
        assert!(config.networking_config.is_none());
        assert_eq!(config.cmd, spec.cmd);
    }

    #[test]
    fn test_config_mounts_ports_and_address() {
        let mut spec = ContainerSpec::new(
            "svc",
            "nginx",
            NetworkAttachment::Network {
                network_id: "n1".to_string(),
                ip: "10.0.0.3".parse().unwrap(),
            },
        );
        spec.ports.push(PortSpec::tcp(80));
        spec.publish_ports = true;
        spec.mounts.push(Mount {
            source: MountSource::Volume("vol".to_string()),
            target: "/data".to_string(),
            read_only: true,
        });
        spec.env.insert("MODE".to_string(), "test".to_string());
        let config = container_config(&spec);

        let endpoint = &config.networking_config.as_ref().unwrap().endpoints_config["n1"];
        let ipv4 = endpoint.ipam_config.as_ref().unwrap().ipv4_address.as_deref();
        assert_eq!(ipv4, Some("10.0.0.3"));
        assert!(config.exposed_ports.unwrap().contains_key("80/tcp"));
        assert_eq!(config.env, Some(vec!["MODE=test".to_string()]));

        let host = config.host_config.unwrap();
        assert_eq!(host.network_mode.as_deref(), Some("n1"));
        let mount = &host.mounts.unwrap()[0];
        assert_eq!(mount.typ, Some(MountTypeEnum::VOLUME));
        assert_eq!(mount.read_only, Some(true));
        let bindings = host.port_bindings.unwrap();
        let binding = &bindings["80/tcp"].as_ref().unwrap()[0];
        assert_eq!(binding.host_ip.as_deref(), Some(PUBLISH_HOST_IP));
    }

    #[test]
    fn test_parse_port_bindings_prefers_ipv4() {
        let ports = HashMap::from([
            (
                "80/tcp".to_string(),
                Some(vec![
                    PortBinding {
                        host_ip: Some("::".to_string()),
                        host_port: Some("49153".to_string()),
                    },
                    PortBinding {
                        host_ip: Some("127.0.0.1".to_string()),
                        host_port: Some("49153".to_string()),
                    },
                ]),
            ),
            ("53/udp".to_string(), None),
        ]);
        let bindings = parse_port_bindings(&ports);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[&PortSpec::tcp(80)].host_port, 49153);
        assert_eq!(bindings[&PortSpec::tcp(80)].host_ip, "127.0.0.1");
    }

    #[test]
    fn test_network_info_skips_ipv6() {
        let network = Network {
            id: Some("abc".to_string()),
            name: Some("bridge".to_string()),
            ipam: Some(Ipam {
                config: Some(vec![
                    IpamConfig {
                        subnet: Some("172.17.0.0/16".to_string()),
                        ..IpamConfig::default()
                    },
                    IpamConfig {
                        subnet: Some("fd00::/64".to_string()),
                        ..IpamConfig::default()
                    },
                ]),
                ..Ipam::default()
            }),
            ..Network::default()
        };
        let info = network_info(network);
        assert_eq!(info.subnets, vec!["172.17.0.0/16".parse().unwrap()]);
        assert!(info.labels.is_empty());
    }

    #[test]
    fn test_container_info_and_status() {
        let summary = ContainerSummary {
            id: Some("c1".to_string()),
            names: Some(vec!["/svc".to_string()]),
            labels: Some(HashMap::from([("a".to_string(), "b".to_string())])),
            state: Some("paused".to_string()),
            ..ContainerSummary::default()
        };
        let info = container_info(summary);
        assert_eq!(info.name, "svc");
        assert_eq!(info.status, ContainerStatus::Paused);
        assert_eq!(info.labels.get("a").map(String::as_str), Some("b"));
        assert_eq!(container_status("exited"), ContainerStatus::Exited);
    }

    #[test]
    fn test_overlap_error_maps_to_subnet_overlap() {
        let err = map_error(
            "create_network",
            "10.0.0.0/20",
            DockerError::DockerResponseServerError {
                status_code: 403,
                message: SUBNET_OVERLAP_MARKER.to_string(),
            },
            Duration::from_secs(1),
        );
        assert!(matches!(err, Error::SubnetOverlap { subnet } if subnet == "10.0.0.0/20"));

        let err = map_error(
            "remove_network",
            "n1",
            DockerError::DockerResponseServerError {
                status_code: 404,
                message: "no such network".to_string(),
            },
            Duration::from_secs(1),
        );
        assert!(matches!(err, Error::Runtime { .. }));
    }

    #[test]
    fn test_label_filters() {
        let mut labels = Labels::new();
        assert!(label_filters(&labels).is_empty());
        labels.insert("io.enclavenet.enclave-id".to_string(), "e1".to_string());
        assert_eq!(
            label_filters(&labels)["label"],
            vec!["io.enclavenet.enclave-id=e1".to_string()]
        );
    }

    #[test]
    fn test_append_capped() {
        let mut buffer = vec![0u8; MAX_OUTPUT_SIZE - 2];
        append_capped(&mut buffer, b"abcd", "test");
        assert_eq!(buffer.len(), MAX_OUTPUT_SIZE);
        append_capped(&mut buffer, b"ef", "test");
        assert_eq!(buffer.len(), MAX_OUTPUT_SIZE);
    }
}
