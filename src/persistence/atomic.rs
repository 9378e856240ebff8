//! Whole-file replacement writes.
//!
//! Bytes go to a temporary file in the destination directory, are synced,
//! then renamed over the target. Readers see either the previous file or
//! the complete new one, never a partial write.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::{AppError, Result};

/// Atomically replace `path` with `bytes`, creating parent directories.
///
/// # Errors
///
/// Returns `AppError::Io` if the temporary file cannot be written or renamed.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .map_err(|err| AppError::Io(format!("cannot create {}: {err}", dir.display())))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .map_err(|err| AppError::Io(format!("cannot create temp file in {}: {err}", dir.display())))?;
    tmp.write_all(bytes)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|err| AppError::Io(format!("cannot write {}: {err}", path.display())))?;
    tmp.persist(path)
        .map_err(|err| AppError::Io(format!("cannot replace {}: {}", path.display(), err.error)))?;
    Ok(())
}

/// Remove `path`, treating an already-missing file as success.
///
/// Returns whether a file was actually removed.
///
/// # Errors
///
/// Returns `AppError::Io` for failures other than "not found".
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(AppError::Io(format!(
            "cannot remove {}: {err}",
            path.display()
        ))),
    }
}
