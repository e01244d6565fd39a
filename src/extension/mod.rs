//! # Extensions
//!
//! Extensions (modules) are containers loaded into an enclave at runtime
//! that expose a small request/response RPC surface. The [`ExtensionStore`]
//! owns every loaded instance; callers address them by [`ExtensionId`] and
//! never hold on to the instance itself.
//!
//! [`ExtensionId`]: crate::ids::ExtensionId

pub mod client;
pub mod store;

pub use self::client::{
    ExtensionClient, ExtensionConnector, InMemoryConnector, TcpConnector, TcpExtensionClient,
};
pub use self::store::{ExtensionStore, LoadedExtension};
