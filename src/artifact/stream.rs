//! Chunked, hash-chained transfer of artifact content.
//!
//! Content moves as a sequence of [`StreamedDataChunk`]s of at most
//! [`CHUNK_SIZE`] bytes. Every chunk carries the SHA-256 (hex) of the chunk
//! before it; the first chunk carries an empty hash:
//!
//! ```text
//! chunk 0: { data: d0, previous_chunk_hash: ""         }
//! chunk 1: { data: d1, previous_chunk_hash: sha256(d0) }
//! chunk 2: { data: d2, previous_chunk_hash: sha256(d1) }
//! ```
//!
//! The receiver hashes each chunk it accepts and checks it against the
//! hash declared by the next one. Any mismatch, a first chunk that declares
//! a predecessor, or a later chunk that declares none aborts the transfer.
//! Nothing is handed to the cache until the whole stream validated.
//!
//! Uploads and downloads use the same framing, so clients verify downloads
//! with [`ChunkReceiver`] as well.

use crate::constants::{CHUNK_SIZE, MAX_ARTIFACT_NAME_LEN, MAX_ARTIFACT_SIZE};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

/// Per-chunk metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Name of the artifact being transferred; constant across a stream.
    pub name: String,
}

/// One message of the streaming transfer protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamedDataChunk {
    /// Raw bytes.
    pub data: Vec<u8>,
    /// Hex SHA-256 of the previous chunk's data; empty for the first chunk.
    pub previous_chunk_hash: String,
    /// Metadata.
    pub metadata: ChunkMetadata,
}

/// Hex SHA-256 of `data`.
#[must_use]
pub fn chunk_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// =============================================================================
// Sending
// =============================================================================

/// Iterator splitting content into hash-chained chunks.
///
/// Empty content still yields exactly one (empty) chunk so the receiver
/// learns the artifact name.
pub struct ChunkStream {
    data: Vec<u8>,
    name: String,
    offset: usize,
    previous_hash: String,
    done: bool,
}

impl ChunkStream {
    /// Prepares `data` for sending under `name`.
    #[must_use]
    pub fn new(data: Vec<u8>, name: impl Into<String>) -> Self {
        Self {
            data,
            name: name.into(),
            offset: 0,
            previous_hash: String::new(),
            done: false,
        }
    }
}

impl Iterator for ChunkStream {
    type Item = StreamedDataChunk;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let end = (self.offset + CHUNK_SIZE).min(self.data.len());
        let data = self.data[self.offset..end].to_vec();
        self.offset = end;
        self.done = self.offset >= self.data.len();

        let hash = chunk_hash(&data);
        let previous_chunk_hash = std::mem::replace(&mut self.previous_hash, hash);
        Some(StreamedDataChunk {
            data,
            previous_chunk_hash,
            metadata: ChunkMetadata {
                name: self.name.clone(),
            },
        })
    }
}

// =============================================================================
// Receiving
// =============================================================================

/// Content that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedContent {
    /// Artifact name from the chunk metadata.
    pub name: String,
    /// Reassembled bytes.
    pub data: Vec<u8>,
    /// Hex SHA-256 of the whole content.
    pub content_hash: String,
    /// Number of chunks received.
    pub chunks: usize,
}

/// Validating receiver for a chunk stream.
#[derive(Debug, Default)]
pub struct ChunkReceiver {
    name: Option<String>,
    buffer: Vec<u8>,
    last_hash: Option<String>,
    count: usize,
}

impl ChunkReceiver {
    /// Creates a receiver expecting the first chunk.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and buffers one chunk.
    ///
    /// # Errors
    ///
    /// - [`Error::ChunkOutOfOrder`] if the chunk's position is inconsistent
    ///   with its declared predecessor
    /// - [`Error::ChunkHashMismatch`] if the declared hash is wrong
    /// - [`Error::ChunkTooLarge`] if a size limit is exceeded
    /// - [`Error::ArtifactNameChanged`] if the name differs from earlier chunks
    pub fn accept(&mut self, chunk: StreamedDataChunk) -> Result<()> {
        let index = self.count;

        match (&self.last_hash, chunk.previous_chunk_hash.is_empty()) {
            (None, false) => {
                return Err(Error::ChunkOutOfOrder {
                    index,
                    reason: "first chunk declares a previous chunk".to_string(),
                });
            }
            (Some(_), true) => {
                return Err(Error::ChunkOutOfOrder {
                    index,
                    reason: "chunk declares no previous chunk".to_string(),
                });
            }
            (Some(expected), false) if *expected != chunk.previous_chunk_hash => {
                return Err(Error::ChunkHashMismatch {
                    index,
                    declared: chunk.previous_chunk_hash,
                    actual: expected.clone(),
                });
            }
            _ => {}
        }

        if chunk.data.len() > CHUNK_SIZE {
            return Err(Error::ChunkTooLarge {
                size: chunk.data.len() as u64,
                limit: CHUNK_SIZE as u64,
            });
        }
        let total = (self.buffer.len() + chunk.data.len()) as u64;
        if total > MAX_ARTIFACT_SIZE {
            return Err(Error::ChunkTooLarge {
                size: total,
                limit: MAX_ARTIFACT_SIZE,
            });
        }

        match &self.name {
            None => {
                if chunk.metadata.name.len() > MAX_ARTIFACT_NAME_LEN {
                    return Err(Error::InvalidInput(format!(
                        "artifact name exceeds {MAX_ARTIFACT_NAME_LEN} bytes"
                    )));
                }
                self.name = Some(chunk.metadata.name);
            }
            Some(name) if *name != chunk.metadata.name => {
                return Err(Error::ArtifactNameChanged {
                    expected: name.clone(),
                    got: chunk.metadata.name,
                });
            }
            Some(_) => {}
        }

        self.last_hash = Some(chunk_hash(&chunk.data));
        self.buffer.extend_from_slice(&chunk.data);
        self.count += 1;
        Ok(())
    }

    /// Completes the transfer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if no chunk was received.
    pub fn finish(self) -> Result<ReceivedContent> {
        let name = self
            .name
            .ok_or_else(|| Error::InvalidInput("stream ended before the first chunk".to_string()))?;
        let content_hash = chunk_hash(&self.buffer);
        Ok(ReceivedContent {
            name,
            data: self.buffer,
            content_hash,
            chunks: self.count,
        })
    }

    /// Validates every chunk of an in-memory stream.
    ///
    /// # Errors
    ///
    /// See [`ChunkReceiver::accept`] and [`ChunkReceiver::finish`].
    pub fn receive_all(chunks: impl IntoIterator<Item = StreamedDataChunk>) -> Result<ReceivedContent> {
        let mut receiver = Self::new();
        for chunk in chunks {
            receiver.accept(chunk)?;
        }
        receiver.finish()
    }

    /// Validates every chunk arriving on a channel until the sender closes it.
    ///
    /// # Errors
    ///
    /// See [`ChunkReceiver::accept`] and [`ChunkReceiver::finish`].
    pub async fn receive_channel(
        rx: &mut mpsc::Receiver<StreamedDataChunk>,
    ) -> Result<ReceivedContent> {
        let mut receiver = Self::new();
        while let Some(chunk) = rx.recv().await {
            receiver.accept(chunk)?;
        }
        receiver.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_content_is_one_chunk() {
        let chunks: Vec<_> = ChunkStream::new(Vec::new(), "empty").collect();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].previous_chunk_hash.is_empty());
        let received = ChunkReceiver::receive_all(chunks).unwrap();
        assert!(received.data.is_empty());
        assert_eq!(received.name, "empty");
    }

    #[test]
    fn test_exact_multiple_of_chunk_size() {
        let data = vec![7u8; CHUNK_SIZE * 2];
        let chunks: Vec<_> = ChunkStream::new(data.clone(), "x").collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].previous_chunk_hash, chunk_hash(&chunks[0].data));
        assert_eq!(ChunkReceiver::receive_all(chunks).unwrap().data, data);
    }

    #[test]
    fn test_first_chunk_with_hash_is_out_of_order() {
        let mut chunks: Vec<_> = ChunkStream::new(vec![1, 2, 3], "x").collect();
        chunks[0].previous_chunk_hash = chunk_hash(b"nope");
        let err = ChunkReceiver::receive_all(chunks).unwrap_err();
        assert!(matches!(err, Error::ChunkOutOfOrder { index: 0, .. }));
    }

    #[test]
    fn test_dropped_chunk_is_detected() {
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3)).map(|i| (i % 251) as u8).collect();
        let mut chunks: Vec<_> = ChunkStream::new(data, "x").collect();
        chunks.remove(1);
        let err = ChunkReceiver::receive_all(chunks).unwrap_err();
        assert!(matches!(err, Error::ChunkHashMismatch { index: 1, .. }));
        assert!(err.is_integrity());
    }

    #[test]
    fn test_name_change_rejected() {
        let data = vec![0u8; CHUNK_SIZE + 1];
        let mut chunks: Vec<_> = ChunkStream::new(data, "a").collect();
        chunks[1].metadata.name = "b".to_string();
        let err = ChunkReceiver::receive_all(chunks).unwrap_err();
        assert!(matches!(err, Error::ArtifactNameChanged { .. }));
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let chunk = StreamedDataChunk {
            data: vec![0u8; CHUNK_SIZE + 1],
            previous_chunk_hash: String::new(),
            metadata: ChunkMetadata::default(),
        };
        let err = ChunkReceiver::receive_all([chunk]).unwrap_err();
        assert!(matches!(err, Error::ChunkTooLarge { .. }));
    }

    #[test]
    fn test_no_chunks_is_invalid() {
        let err = ChunkReceiver::receive_all(Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_receive_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let data = vec![9u8; CHUNK_SIZE + 10];
        let sender = {
            let data = data.clone();
            tokio::spawn(async move {
                for chunk in ChunkStream::new(data, "chan") {
                    tx.send(chunk).await.unwrap();
                }
            })
        };
        let received = ChunkReceiver::receive_channel(&mut rx).await.unwrap();
        sender.await.unwrap();
        assert_eq!(received.data, data);
        assert_eq!(received.chunks, 2);
    }
}
