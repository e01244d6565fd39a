//! Tests for the files-artifact cache and chunked transfers.
//!
//! Validates multi-chunk transfers, integrity failures, identifier lookup,
//! and directory packing.

use enclavenet::Error;
use enclavenet::artifact::{FilesArtifactStore, StreamedDataChunk};
use enclavenet::artifact::stream::ChunkStream;
use enclavenet::constants::CHUNK_SIZE;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn store(dir: &TempDir) -> FilesArtifactStore {
    FilesArtifactStore::open(dir.path().join("artifacts")).unwrap()
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

// =============================================================================
// Transfer Tests
// =============================================================================

#[test]
fn test_multi_chunk_upload_and_download() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let data = payload(2 * CHUNK_SIZE + 17);

    let chunks: Vec<StreamedDataChunk> = ChunkStream::new(data.clone(), "big").collect();
    assert_eq!(chunks.len(), 3);
    let response = store.upload(chunks).unwrap();
    assert_eq!(response.name, "big");
    assert_eq!(response.size, data.len() as u64);

    let downloaded: Vec<u8> = store
        .download("big")
        .unwrap()
        .flat_map(|chunk| chunk.data)
        .collect();
    assert_eq!(downloaded, data);
}

#[test]
fn test_empty_upload_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let response = store.upload(ChunkStream::new(Vec::new(), "empty")).unwrap();
    assert_eq!(response.size, 0);
    assert_eq!(store.read("empty").unwrap(), Vec::<u8>::new());
}

#[test]
fn test_corrupted_chain_creates_no_entry() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let mut chunks: Vec<StreamedDataChunk> = ChunkStream::new(payload(CHUNK_SIZE + 1), "bad").collect();
    chunks[1].previous_chunk_hash = "00".repeat(32);

    let err = store.upload(chunks).unwrap_err();
    assert!(err.is_integrity(), "unexpected error: {err}");
    assert!(matches!(err, Error::ChunkHashMismatch { index: 1, .. }));
    assert!(store.list().is_empty());
}

#[test]
fn test_name_change_mid_stream_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let mut chunks: Vec<StreamedDataChunk> = ChunkStream::new(payload(CHUNK_SIZE + 1), "one").collect();
    chunks[1].metadata.name = "two".to_string();
    assert!(matches!(
        store.upload(chunks).unwrap_err(),
        Error::ArtifactNameChanged { .. }
    ));
    assert!(store.list().is_empty());
}

#[tokio::test]
async fn test_channel_upload() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let data = payload(CHUNK_SIZE + 5);
    let (tx, mut rx) = mpsc::channel(4);
    let sender = {
        let data = data.clone();
        tokio::spawn(async move {
            for chunk in ChunkStream::new(data, "streamed") {
                tx.send(chunk).await.unwrap();
            }
        })
    };
    let response = store.upload_channel(&mut rx).await.unwrap();
    sender.await.unwrap();
    assert_eq!(store.read(&response.uuid.to_string()).unwrap(), data);
}

// =============================================================================
// Lookup Tests
// =============================================================================

#[test]
fn test_lookup_by_uuid_prefix_and_name() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let artifact = store.store(Some("conf"), b"not really a tarball").unwrap();

    assert_eq!(store.get("conf").unwrap().uuid, artifact.uuid);
    assert_eq!(store.get(&artifact.uuid.to_string()).unwrap().uuid, artifact.uuid);
    assert_eq!(store.get(&artifact.short_uuid()).unwrap().uuid, artifact.uuid);
    assert!(matches!(
        store.get("missing").unwrap_err(),
        Error::ArtifactNotFound(_)
    ));
}

#[test]
fn test_index_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let uuid = store(&dir).store(Some("kept"), b"content").unwrap().uuid;
    let reopened = store(&dir);
    assert_eq!(reopened.get("kept").unwrap().uuid, uuid);
    assert_eq!(reopened.read("kept").unwrap(), b"content");
}

#[test]
fn test_remove_keeps_shared_blob() {
    let dir = TempDir::new().unwrap();
    let store = store(&dir);
    let a = store.store(Some("a"), b"same").unwrap();
    store.store(Some("b"), b"same").unwrap();

    store.remove(&a.uuid.to_string()).unwrap();
    assert_eq!(store.read("b").unwrap(), b"same");
    assert!(store.get("a").is_err());
}

// =============================================================================
// Directory Tests
// =============================================================================

#[test]
fn test_directory_pack_inspect_extract() {
    let dir = TempDir::new().unwrap();
    let source = TempDir::new().unwrap();
    std::fs::create_dir_all(source.path().join("nested")).unwrap();
    std::fs::write(source.path().join("top.txt"), "top").unwrap();
    std::fs::write(source.path().join("nested/inner.txt"), "inner").unwrap();

    let store = store(&dir);
    store.store_directory(source.path(), Some("tree")).unwrap();

    let entries = store.inspect("tree").unwrap();
    assert!(entries.iter().any(|e| e.path.ends_with("top.txt") && !e.is_dir));
    assert!(entries.iter().any(|e| e.path.ends_with("nested/inner.txt")));

    let dest = TempDir::new().unwrap();
    store.extract_to_directory("tree", dest.path()).unwrap();
    assert_eq!(std::fs::read_to_string(dest.path().join("nested/inner.txt")).unwrap(), "inner");
}
