//! Files-artifact archive handling.
//!
//! Artifacts are gzip-compressed tarballs. This module packs directories
//! into that format and reads archives back, rejecting entries that would
//! escape their extraction root.
//!
//! ## Security
//!
//! - Entry paths containing `..` components or starting at `/` are
//!   rejected with [`Error::PathTraversal`]
//! - Total unpacked size is bounded by [`MAX_ARTIFACT_SIZE`]
//! - Entry count is bounded by [`MAX_ARTIFACT_ENTRIES`]

use crate::constants::{MAX_ARTIFACT_ENTRIES, MAX_ARTIFACT_SIZE};
use crate::error::{Error, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use tar::{Archive, Builder};
use tracing::debug;

/// One entry of an artifact archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Relative path inside the archive.
    pub path: String,
    /// Uncompressed size in bytes (zero for directories).
    pub size: u64,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Packs the contents of `dir` into a gzip-compressed tarball.
///
/// Paths inside the archive are relative to `dir`.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if `dir` is not a directory, or an I/O
/// error if reading fails.
pub fn pack_directory(dir: &Path) -> Result<Vec<u8>> {
    if !dir.is_dir() {
        return Err(Error::InvalidInput(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    let data = encoder.finish()?;
    debug!(dir = %dir.display(), bytes = data.len(), "packed directory");
    Ok(data)
}

/// Compresses an uncompressed tarball (as copied out of a container) into
/// artifact format, checking its entries on the way.
///
/// # Errors
///
/// As [`list_entries`] for the compressed result.
pub fn compress_tar(tar: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    std::io::Write::write_all(&mut encoder, tar)?;
    let data = encoder.finish()?;
    let entries = list_entries(&data)?;
    debug!(entries = entries.len(), bytes = data.len(), "compressed tarball");
    Ok(data)
}

fn check_path(path: &Path) -> Result<()> {
    let escapes = path
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
    if escapes {
        return Err(Error::PathTraversal {
            path: path.to_string_lossy().to_string(),
        });
    }
    Ok(())
}

fn archive_error(e: std::io::Error) -> Error {
    Error::InvalidInput(format!("malformed artifact archive: {e}"))
}

/// Lists the entries of an artifact archive.
///
/// # Errors
///
/// Returns [`Error::PathTraversal`] for escaping entries,
/// [`Error::ChunkTooLarge`] when size limits are exceeded, and
/// [`Error::InvalidInput`] for a malformed archive.
pub fn list_entries(data: &[u8]) -> Result<Vec<ArtifactEntry>> {
    let mut archive = Archive::new(GzDecoder::new(data));
    let mut entries = Vec::new();
    let mut total_size = 0u64;

    for entry in archive.entries().map_err(archive_error)? {
        let entry = entry.map_err(archive_error)?;
        let path = entry.path().map_err(archive_error)?.into_owned();
        check_path(&path)?;

        total_size += entry.size();
        if total_size > MAX_ARTIFACT_SIZE {
            return Err(Error::ChunkTooLarge {
                size: total_size,
                limit: MAX_ARTIFACT_SIZE,
            });
        }
        if entries.len() >= MAX_ARTIFACT_ENTRIES {
            return Err(Error::InvalidInput(format!(
                "artifact has more than {MAX_ARTIFACT_ENTRIES} entries"
            )));
        }

        let normalized = path
            .components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect::<std::path::PathBuf>();
        if normalized.as_os_str().is_empty() {
            continue;
        }
        entries.push(ArtifactEntry {
            path: normalized.to_string_lossy().to_string(),
            size: entry.size(),
            is_dir: entry.header().entry_type().is_dir(),
        });
    }
    Ok(entries)
}

/// Unpacks an artifact archive into `dest`.
///
/// # Errors
///
/// Same as [`list_entries`], plus I/O errors while writing.
pub fn unpack(data: &[u8], dest: &Path) -> Result<()> {
    // Validate everything before writing anything.
    list_entries(data)?;
    std::fs::create_dir_all(dest)?;
    let mut archive = Archive::new(GzDecoder::new(data));
    for entry in archive.entries().map_err(archive_error)? {
        let mut entry = entry.map_err(archive_error)?;
        entry.unpack_in(dest).map_err(archive_error)?;
    }
    Ok(())
}
