//! Error types for the orchestration engine.

use std::fmt;
use std::time::Duration;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Resource Exhaustion Errors
    // =========================================================================
    /// No free address remains in an enclave's pool.
    #[error("no free IP address left in {cidr}")]
    AddressPoolExhausted { cidr: String },

    /// No candidate subnet could be turned into a network.
    #[error("no free subnet found after {attempts} attempt(s): {reason}")]
    NoFreeSubnet { attempts: usize, reason: String },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    /// Caller-supplied input is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A repartition or connection request does not describe a valid topology.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A service with this ID is already registered.
    #[error("service already exists: {0}")]
    ServiceAlreadyExists(String),

    /// Service not found.
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    /// Partition not found.
    #[error("partition not found: {0}")]
    PartitionNotFound(String),

    /// An extension with this ID is already loaded.
    #[error("extension already loaded: {0}")]
    ExtensionAlreadyLoaded(String),

    /// Extension not found.
    #[error("extension not found: {0}")]
    ExtensionNotFound(String),

    /// No artifact matches the identifier.
    #[error("files artifact not found: {0}")]
    ArtifactNotFound(String),

    /// A shortened artifact UUID matches more than one artifact.
    #[error("files artifact identifier '{identifier}' is ambiguous ({matches} matches)")]
    AmbiguousArtifactId { identifier: String, matches: usize },

    /// Enclave already exists.
    #[error("enclave already exists: {0}")]
    EnclaveAlreadyExists(String),

    /// Enclave not found.
    #[error("enclave not found: {0}")]
    EnclaveNotFound(String),

    /// Object is in the wrong lifecycle state for the operation.
    #[error("{object} is in state '{state}', expected '{expected}'")]
    InvalidState {
        object: String,
        state: String,
        expected: String,
    },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// A container runtime call failed.
    #[error("runtime call '{operation}' failed for '{object}': {reason}")]
    Runtime {
        operation: String,
        object: String,
        reason: String,
    },

    /// The runtime refused a subnet because it overlaps an existing network.
    #[error("subnet {subnet} overlaps an existing network")]
    SubnetOverlap { subnet: String },

    /// An expander container exited with a non-zero status.
    #[error("expanding files artifact '{artifact}' failed with exit code {exit_code}; logs:\n{logs}")]
    ExpansionFailed {
        artifact: String,
        exit_code: i64,
        logs: String,
    },

    /// A command run inside a container exited with a non-zero status.
    #[error("command exited with code {exit_code}: {output}")]
    CommandFailed { exit_code: i64, output: String },

    /// An extension call failed.
    #[error("extension '{id}' failed: {reason}")]
    Extension { id: String, reason: String },

    /// An HTTP endpoint of a service never answered as expected.
    #[error("endpoint {url} unavailable after {attempts} attempt(s): {reason}")]
    EndpointUnavailable {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// A command in a bulk sequence failed; later commands were not run.
    #[error("command {index} ({command}) failed: {source}")]
    CommandAborted {
        index: usize,
        command: String,
        source: Box<Error>,
    },

    /// Operation not supported in the current configuration.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Integrity Errors
    // =========================================================================
    /// A chunk's declared previous hash does not match the received chunk.
    #[error("chunk {index}: declared previous-chunk hash {declared} does not match {actual}")]
    ChunkHashMismatch {
        index: usize,
        declared: String,
        actual: String,
    },

    /// A chunk arrived out of sequence (e.g. a first chunk with a hash).
    #[error("chunk {index} is out of order: {reason}")]
    ChunkOutOfOrder { index: usize, reason: String },

    /// A chunk or the total transfer exceeds its size limit.
    #[error("transfer exceeds size limit: {size} > {limit} bytes")]
    ChunkTooLarge { size: u64, limit: u64 },

    /// The artifact name changed in the middle of an upload.
    #[error("artifact name changed mid-upload from '{expected}' to '{got}'")]
    ArtifactNameChanged { expected: String, got: String },

    /// An archive entry escapes its extraction root.
    #[error("path traversal detected in archive: {path}")]
    PathTraversal { path: String },

    // =========================================================================
    // Teardown Errors
    // =========================================================================
    /// One or more steps of a best-effort teardown failed.
    #[error("{0}")]
    Teardown(TeardownReport),

    // =========================================================================
    // Timeout Errors
    // =========================================================================
    /// Operation timed out.
    #[error("operation timed out after {duration:?}: {operation}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Builds a [`Error::Runtime`] from its parts.
    pub fn runtime(
        operation: impl Into<String>,
        object: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::Runtime {
            operation: operation.into(),
            object: object.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the caller may retry after releasing resources or waiting.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AddressPoolExhausted { .. }
                | Self::NoFreeSubnet { .. }
                | Self::EndpointUnavailable { .. }
                | Self::Timeout { .. }
        )
    }

    /// Whether the error was raised before any state was mutated because
    /// the request itself was invalid.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::InvalidTopology(_)
                | Self::ServiceAlreadyExists(_)
                | Self::ServiceNotFound(_)
                | Self::PartitionNotFound(_)
                | Self::ExtensionAlreadyLoaded(_)
                | Self::ExtensionNotFound(_)
                | Self::ArtifactNotFound(_)
                | Self::AmbiguousArtifactId { .. }
                | Self::EnclaveAlreadyExists(_)
                | Self::EnclaveNotFound(_)
                | Self::InvalidState { .. }
        )
    }

    /// Whether the error is a transfer integrity failure.
    #[must_use]
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::ChunkHashMismatch { .. }
                | Self::ChunkOutOfOrder { .. }
                | Self::ChunkTooLarge { .. }
                | Self::ArtifactNameChanged { .. }
                | Self::PathTraversal { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// =============================================================================
// Teardown Report
// =============================================================================

/// A single failed teardown step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    /// The object that could not be cleaned up (container, volume, network).
    pub object: String,
    /// Why the step failed.
    pub reason: String,
}

/// Failures collected while tearing down several objects.
///
/// Teardown never stops at the first failure; each step is attempted and
/// failures are accumulated here. Every entry names an object that now
/// requires manual cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Creates an empty report.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failed step and logs it as requiring manual action.
    pub fn record(&mut self, object: impl Into<String>, reason: impl fmt::Display) {
        let object = object.into();
        let reason = reason.to_string();
        tracing::warn!(
            object = %object,
            reason = %reason,
            "ACTION REQUIRED: teardown step failed, remove this object manually"
        );
        self.failures.push(TeardownFailure { object, reason });
    }

    /// Moves every failure of `other` into this report.
    pub fn merge(&mut self, other: TeardownReport) {
        self.failures.extend(other.failures);
    }

    /// Whether every step succeeded.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// The collected failures.
    #[must_use]
    pub fn failures(&self) -> &[TeardownFailure] {
        &self.failures
    }

    /// `Ok(())` if clean, otherwise [`Error::Teardown`] carrying this report.
    pub fn into_result(self) -> Result<()> {
        if self.is_clean() {
            Ok(())
        } else {
            Err(Error::Teardown(self))
        }
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} teardown step(s) failed; manual cleanup required",
            self.failures.len()
        )?;
        for failure in &self.failures {
            write!(f, "\n  - {}: {}", failure.object, failure.reason)?;
        }
        Ok(())
    }
}
