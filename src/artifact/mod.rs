//! # Files Artifacts
//!
//! Compressed file bundles moved into and out of an enclave:
//!
//! - [`archive`]: packing, listing, and safe unpacking of `.tgz` content
//! - [`stream`]: hash-chained chunked transfer
//! - [`store`]: per-enclave content-addressed cache
//! - [`expander`]: expansion into volumes for service mounts

pub mod archive;
pub mod expander;
pub mod store;
pub mod stream;

pub use self::archive::ArtifactEntry;
pub use self::expander::{ArtifactExpander, ExpandedArtifact};
pub use self::store::{FilesArtifact, FilesArtifactStore, UploadResponse};
pub use self::stream::{ChunkMetadata, ChunkReceiver, ChunkStream, StreamedDataChunk};
