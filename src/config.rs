//! Engine configuration.
//!
//! Configuration is loaded from a YAML file; every field is optional and
//! falls back to its default. The data directory may additionally be
//! overridden with the `ENCLAVENET_DATA_DIR` environment variable.
//!
//! ## Example Configuration File
//!
//! ```yaml
//! data_dir: /var/lib/enclavenet
//! address_space: 10.128.0.0/9
//! subnet_prefix_len: 20
//! partitioning_enabled: true
//! sidecar_image: nicolaka/netshoot:v0.11
//! expander_image: busybox:1.36
//! extension_availability_timeout: 30
//! worker_pool_size: 4
//! runtime_socket: /var/run/docker.sock
//! ```
//!
//! Durations are written as whole seconds.

use crate::constants::{
    DEFAULT_ADDRESS_SPACE, DEFAULT_EXPANDER_IMAGE, DEFAULT_EXPANSION_TIMEOUT,
    DEFAULT_EXTENSION_AVAILABILITY_TIMEOUT, DEFAULT_EXTENSION_PORT, DEFAULT_MAX_NETWORK_ATTEMPTS,
    DEFAULT_NETWORK_RETRY_INTERVAL, DEFAULT_RUNTIME_CALL_TIMEOUT, DEFAULT_SIDECAR_IMAGE,
    DEFAULT_SIDECAR_INTERFACE, DEFAULT_SUBNET_PREFIX_LEN, DEFAULT_WORKER_POOL_SIZE,
};
use crate::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding [`EngineConfig::data_dir`].
pub const DATA_DIR_ENV: &str = "ENCLAVENET_DATA_DIR";

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding persisted enclave state and artifact caches.
    pub data_dir: PathBuf,
    /// Address space enclave subnets are carved from.
    pub address_space: Ipv4Network,
    /// Prefix length of each enclave subnet.
    pub subnet_prefix_len: u8,
    /// Attempts made to create a network when subnets collide.
    pub max_network_attempts: usize,
    /// Pause between network creation attempts.
    #[serde(with = "duration_secs")]
    pub network_retry_interval: Duration,
    /// Whether services get networking sidecars and partitions are enforced.
    pub partitioning_enabled: bool,
    /// Image of the networking sidecar.
    pub sidecar_image: String,
    /// Interface inside the service namespace that sidecars shape.
    pub sidecar_interface: String,
    /// Image of the files-artifact expander.
    pub expander_image: String,
    /// Optional control-plane container started with every enclave.
    pub control_image: Option<String>,
    /// Port extensions serve their RPC surface on.
    pub extension_port: u16,
    /// Bound on waiting for a freshly started extension to answer.
    #[serde(with = "duration_secs")]
    pub extension_availability_timeout: Duration,
    /// Bound on waiting for an expander container to exit.
    #[serde(with = "duration_secs")]
    pub expansion_timeout: Duration,
    /// Number of concurrent artifact expansions.
    pub worker_pool_size: usize,
    /// Publish declared service ports to ephemeral host ports.
    pub publish_ports: bool,
    /// Docker Engine socket; `DOCKER_HOST` or the platform default when unset.
    pub runtime_socket: Option<PathBuf>,
    /// Timeout applied to each container runtime call.
    #[serde(with = "duration_secs")]
    pub runtime_call_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            address_space: DEFAULT_ADDRESS_SPACE
                .parse()
                .unwrap_or_else(|_| Ipv4Network::from(std::net::Ipv4Addr::new(10, 128, 0, 0))),
            subnet_prefix_len: DEFAULT_SUBNET_PREFIX_LEN,
            max_network_attempts: DEFAULT_MAX_NETWORK_ATTEMPTS,
            network_retry_interval: DEFAULT_NETWORK_RETRY_INTERVAL,
            partitioning_enabled: true,
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            sidecar_interface: DEFAULT_SIDECAR_INTERFACE.to_string(),
            expander_image: DEFAULT_EXPANDER_IMAGE.to_string(),
            control_image: None,
            extension_port: DEFAULT_EXTENSION_PORT,
            extension_availability_timeout: DEFAULT_EXTENSION_AVAILABILITY_TIMEOUT,
            expansion_timeout: DEFAULT_EXPANSION_TIMEOUT,
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            publish_ports: false,
            runtime_socket: None,
            runtime_call_timeout: DEFAULT_RUNTIME_CALL_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Parses and validates a YAML configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serialization`] on malformed YAML or
    /// [`Error::InvalidInput`] if validation fails.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let mut config: Self = serde_yaml::from_str(yaml)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&yaml)
    }

    /// Defaults plus environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] describing the first violated rule.
    pub fn validate(&self) -> Result<()> {
        if !(8..=29).contains(&self.subnet_prefix_len) {
            return Err(Error::InvalidInput(format!(
                "subnet_prefix_len must be within 8..=29, got {}",
                self.subnet_prefix_len
            )));
        }
        if self.address_space.prefix() > self.subnet_prefix_len {
            return Err(Error::InvalidInput(format!(
                "address_space {} is smaller than one /{} subnet",
                self.address_space, self.subnet_prefix_len
            )));
        }
        if self.worker_pool_size == 0 {
            return Err(Error::InvalidInput(
                "worker_pool_size must be at least 1".to_string(),
            ));
        }
        if self.max_network_attempts == 0 {
            return Err(Error::InvalidInput(
                "max_network_attempts must be at least 1".to_string(),
            ));
        }
        if self.partitioning_enabled && self.sidecar_interface.is_empty() {
            return Err(Error::InvalidInput(
                "sidecar_interface cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory holding all state of one enclave.
    #[must_use]
    pub fn enclave_dir(&self, enclave: &str) -> PathBuf {
        self.data_dir
            .join(crate::constants::ENCLAVES_DIR)
            .join(enclave)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("enclavenet")
}

/// Serializes a [`Duration`] as whole seconds.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.subnet_prefix_len, 20);
        assert_eq!(config.extension_port, 1111);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config =
            EngineConfig::from_yaml_str("worker_pool_size: 8\nexpansion_timeout: 5\n").unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.expansion_timeout, Duration::from_secs(5));
        assert_eq!(config.sidecar_image, DEFAULT_SIDECAR_IMAGE);
    }

    #[test]
    fn test_rejects_bad_prefix() {
        let err = EngineConfig::from_yaml_str("subnet_prefix_len: 31\n").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_rejects_zero_workers() {
        assert!(EngineConfig::from_yaml_str("worker_pool_size: 0\n").is_err());
    }
}
