//! Managed-directory marker.
//!
//! Every directory this crate may recursively delete carries a zero-byte
//! marker file. [`is_managed`] is the only check teardown trusts before a
//! recursive delete; a missing marker is fail-closed.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{EnvError, Result};

/// Name of the ownership marker file.
pub const MARKER_FILE: &str = ".e2e-testenv-managed";

/// Creates `path` (idempotently) and stamps it with the marker.
///
/// # Errors
///
/// Returns an error if the directory or the marker cannot be created, or if
/// `path` exists but is not a directory.
pub fn create(path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    fs::create_dir_all(path)?;
    // An existing marker is left as is; contents are never read.
    fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path.join(MARKER_FILE))?;
    debug!(path = %path.display(), "managed directory created");
    Ok(path.to_path_buf())
}

/// Returns true only if `path` is a real directory containing the marker.
///
/// Missing paths, plain files, symlinks and unmarked directories are all
/// reported as unmanaged. Never errors.
#[must_use]
pub fn is_managed(path: impl AsRef<Path>) -> bool {
    let path = path.as_ref();
    let Ok(meta) = fs::symlink_metadata(path) else {
        return false;
    };
    if !meta.is_dir() {
        return false;
    }
    fs::symlink_metadata(path.join(MARKER_FILE))
        .map(|m| m.is_file())
        .unwrap_or(false)
}

/// Recursively deletes a managed directory.
///
/// # Errors
///
/// Returns [`EnvError::UnsafeDeletion`] without touching the filesystem if
/// `path` is not managed, or an I/O error if removal fails.
pub fn remove(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if !is_managed(path) {
        return Err(EnvError::UnsafeDeletion(path.to_path_buf()));
    }
    fs::remove_dir_all(path)?;
    debug!(path = %path.display(), "managed directory removed");
    Ok(())
}
