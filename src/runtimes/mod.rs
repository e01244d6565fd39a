//! Container runtime adapters.
//!
//! - [`DockerRuntime`]: the real adapter, speaking the Docker Engine API
//! - [`InMemoryRuntime`]: an in-process fake for tests and dry runs

pub mod docker;
pub mod memory;

pub use self::docker::DockerRuntime;
pub use self::memory::{ExecRecord, InMemoryRuntime};
