//! # Engine Constants
//!
//! Defines the fixed limits, wire sizes, label keys, and naming rules used
//! across the orchestration engine. These constants are the **single source
//! of truth** for values that must agree between components: the chunked
//! transfer protocol, the object labels used for reconciliation, and the
//! bounds applied to caller-supplied input.
//!
//! Tunable values (timeouts, images, address space) live in
//! [`crate::config::EngineConfig`]; only values that must never vary
//! between a writer and a reader are fixed here.
//!
//! ## Cross-References
//!
//! - [`crate::artifact::stream`]: Uses chunk size and artifact size limits
//! - [`crate::naming`]: Uses label keys, separators, and ID validation
//! - [`crate::network`]: Uses subnet defaults and retry bounds
//! - [`crate::runtimes`]: Uses the subnet-overlap marker and output caps
//! - [`crate::service::availability`]: Uses HTTP retry bounds

use std::time::Duration;

// =============================================================================
// Streaming Transfer
// =============================================================================

/// Size of one chunk in the files-artifact streaming protocol (2 MiB).
///
/// Senders split content into chunks of exactly this size (the final chunk
/// may be shorter). Receivers reject any chunk larger than this.
pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Maximum total size of a single files artifact (1 GiB).
///
/// **Security**: Bounds memory held by an in-flight upload. A client that
/// keeps streaming past this limit has its transfer rejected.
pub const MAX_ARTIFACT_SIZE: u64 = 1024 * 1024 * 1024;

/// Maximum number of entries listed when inspecting an artifact archive.
///
/// **Security**: A crafted archive with millions of empty entries would
/// otherwise produce an unbounded response.
pub const MAX_ARTIFACT_ENTRIES: usize = 100_000;

/// Maximum length of an artifact name in bytes.
pub const MAX_ARTIFACT_NAME_LEN: usize = 256;

/// Minimum number of hex characters accepted as a shortened artifact UUID.
pub const MIN_SHORT_UUID_LEN: usize = 4;

/// Attempts made to generate an unused random artifact name.
pub const MAX_UNIQUE_NAME_ATTEMPTS: usize = 5;

// =============================================================================
// Network Allocation
// =============================================================================

/// Default address space that enclave subnets are carved out of.
pub const DEFAULT_ADDRESS_SPACE: &str = "10.128.0.0/9";

/// Default enclave subnet prefix length (12 host bits, 4094 usable addresses).
pub const DEFAULT_SUBNET_PREFIX_LEN: u8 = 20;

/// Default bound on network creation attempts when subnets collide.
pub const DEFAULT_MAX_NETWORK_ATTEMPTS: usize = 10;

/// Default pause between network creation attempts.
pub const DEFAULT_NETWORK_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Substring the runtime reports when a requested subnet is already in use.
pub const SUBNET_OVERLAP_MARKER: &str = "Pool overlaps with other one on this address space";

// =============================================================================
// Timeouts
// =============================================================================

/// Default time an extension has to answer its availability check.
pub const DEFAULT_EXTENSION_AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between availability checks while an extension starts.
pub const EXTENSION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Timeout for a single request/response exchange with an extension.
pub const EXTENSION_CALL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default time an artifact expander container has to exit.
pub const DEFAULT_EXPANSION_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout applied to every container runtime call.
pub const DEFAULT_RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout of a single HTTP availability request.
pub const HTTP_CHECK_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of HTTP availability attempts.
pub const DEFAULT_HTTP_RETRIES: u32 = 10;

/// Upper bound on HTTP availability attempts a caller may request.
pub const MAX_HTTP_RETRIES: u32 = 1000;

/// Default pause between HTTP availability attempts, in milliseconds.
pub const DEFAULT_HTTP_RETRY_DELAY_MS: u64 = 500;

// =============================================================================
// Resource Limits
// =============================================================================

/// Default size of the worker pool used for concurrent artifact expansion.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Maximum number of extensions loaded in one enclave.
///
/// **Security**: Each extension is a container plus an open connection.
pub const MAX_EXTENSIONS: usize = 64;

/// Maximum captured size of runtime command output (1 MiB).
///
/// **Security**: Prevents a chatty container from exhausting engine memory
/// through `exec` or log retrieval.
pub const MAX_OUTPUT_SIZE: usize = 1024 * 1024;

/// Maximum size of one JSON line exchanged with an extension (16 MiB).
pub const MAX_EXTENSION_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Maximum number of arguments in an exec command.
pub const MAX_COMMAND_ARGS: usize = 1024;

// =============================================================================
// Object Naming and Labels
// =============================================================================
//
// Every runtime object created by the engine carries these labels so that a
// restarted engine can find and reconcile what it owns.
// =============================================================================

/// Separator between components of generated object names.
pub const NAME_SEPARATOR: &str = "--";

/// Prefix of every network, container, and volume name.
pub const NAME_PREFIX: &str = "enclavenet";

/// Maximum length of any user-supplied identifier.
pub const MAX_ID_LEN: usize = 63;

/// Value of [`LABEL_APP_ID`] on every engine-owned object.
pub const APP_ID: &str = "enclavenet";

/// Label marking objects owned by this engine.
pub const LABEL_APP_ID: &str = "io.enclavenet.app-id";

/// Label carrying the owning enclave ID.
pub const LABEL_ENCLAVE_ID: &str = "io.enclavenet.enclave-id";

/// Label carrying the object kind (service, sidecar, expander, ...).
pub const LABEL_OBJECT_KIND: &str = "io.enclavenet.object-kind";

/// Label carrying the system-generated GUID.
pub const LABEL_GUID: &str = "io.enclavenet.guid";

/// Label carrying the user-facing ID.
pub const LABEL_ID: &str = "io.enclavenet.id";

/// Label carrying the container's private IP on the enclave network.
pub const LABEL_PRIVATE_IP: &str = "io.enclavenet.private-ip";

/// Label linking a helper object (sidecar, expander, volume) to its service.
pub const LABEL_OWNER_GUID: &str = "io.enclavenet.owner-guid";

// =============================================================================
// Extensions and Sidecars
// =============================================================================

/// Environment variable carrying an extension's serialized load parameters.
pub const EXTENSION_PARAMS_ENV: &str = "SERIALIZED_ARGS";

/// Default port extensions listen on for their RPC surface.
pub const DEFAULT_EXTENSION_PORT: u16 = 1111;

/// Default interface sidecars shape traffic on.
pub const DEFAULT_SIDECAR_INTERFACE: &str = "eth0";

/// Default sidecar image (must ship `tc` from iproute2).
pub const DEFAULT_SIDECAR_IMAGE: &str = "nicolaka/netshoot:v0.11";

/// Default expander image (must ship `tar` with gzip support).
pub const DEFAULT_EXPANDER_IMAGE: &str = "busybox:1.36";

/// Mount point of the artifact cache inside expander containers.
pub const EXPANDER_CACHE_MOUNT: &str = "/files-artifacts";

/// Mount point of the destination volume inside expander containers.
pub const EXPANDER_DEST_MOUNT: &str = "/dest";

// =============================================================================
// Storage Paths
// =============================================================================

/// Directory (under the data dir) holding per-enclave state.
pub const ENCLAVES_DIR: &str = "enclaves";

/// File name of a persisted enclave record.
pub const ENCLAVE_RECORD_FILE: &str = "enclave.json";

/// Directory (under an enclave dir) holding the artifact cache.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// File name of the artifact cache index.
pub const ARTIFACT_INDEX_FILE: &str = "index.json";

// =============================================================================
// Validation
// =============================================================================

/// Validates an identifier used in object names.
///
/// Accepted: 1..=[`MAX_ID_LEN`] characters of `[a-z0-9-]`, not starting or
/// ending with a hyphen, and not containing [`NAME_SEPARATOR`] (which would
/// make generated names ambiguous).
///
/// # Errors
///
/// Returns a description of the first rule the identifier breaks.
pub fn validate_identifier(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("identifier cannot be empty".to_string());
    }
    if id.len() > MAX_ID_LEN {
        return Err(format!(
            "identifier too long: {} > {MAX_ID_LEN} bytes",
            id.len()
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(format!(
            "identifier '{id}' contains invalid characters (allowed: a-z, 0-9, -)"
        ));
    }
    if id.starts_with('-') || id.ends_with('-') {
        return Err(format!("identifier '{id}' cannot start or end with a hyphen"));
    }
    if id.contains(NAME_SEPARATOR) {
        return Err(format!("identifier '{id}' cannot contain '{NAME_SEPARATOR}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_accepts_simple_ids() {
        assert!(validate_identifier("s1").is_ok());
        assert!(validate_identifier("my-service-2").is_ok());
    }

    #[test]
    fn test_validate_identifier_rejects_bad_ids() {
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("Upper").is_err());
        assert!(validate_identifier("-lead").is_err());
        assert!(validate_identifier("trail-").is_err());
        assert!(validate_identifier("a--b").is_err());
        assert!(validate_identifier("a/b").is_err());
        assert!(validate_identifier(&"a".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_chunk_size_is_two_mib() {
        assert_eq!(CHUNK_SIZE, 2_097_152);
    }
}
