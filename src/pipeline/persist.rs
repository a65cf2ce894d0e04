//! Original-document persistence: owner-scoped, atomic.
//!
//! Uploaded bytes are the source of truth for every later stage, so the
//! write is atomic (temp file + rename) — a crash mid-write leaves either
//! the previous state or the complete file, never a truncated original.

use crate::error::LedgerLensError;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Reject names that could escape the owner's directory.
pub fn validate_file_name(name: &str) -> Result<(), LedgerLensError> {
    let unsafe_name = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\');
    if unsafe_name {
        return Err(LedgerLensError::UnsafeFileName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Write an uploaded original into `documents_dir`, returning its path.
pub async fn persist_original(
    documents_dir: &Path,
    file_name: &str,
    bytes: &[u8],
) -> Result<PathBuf, LedgerLensError> {
    validate_file_name(file_name)?;

    tokio::fs::create_dir_all(documents_dir)
        .await
        .map_err(|e| LedgerLensError::PersistFailed {
            path: documents_dir.to_path_buf(),
            source: e,
        })?;

    let path = documents_dir.join(file_name);
    let tmp_path = documents_dir.join(format!("{file_name}.part"));

    tokio::fs::write(&tmp_path, bytes)
        .await
        .map_err(|e| LedgerLensError::PersistFailed {
            path: path.clone(),
            source: e,
        })?;
    tokio::fs::rename(&tmp_path, &path)
        .await
        .map_err(|e| LedgerLensError::PersistFailed {
            path: path.clone(),
            source: e,
        })?;

    debug!("Persisted original: {}", path.display());
    Ok(path)
}
