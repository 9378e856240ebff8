//! File-backed checkpoint store.
//!
//! One file per task, `checkpoint-<task_id>.json` or `.json.gz`. Writes
//! replace the whole file. Reads re-verify the checksum and treat any
//! undecodable or tampered file as absent.

use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, info_span, warn};

use super::atomic::{remove_if_exists, write_atomic};
use super::validate_key;
use crate::hardware::HardwareProfile;
use crate::models::checkpoint::TaskCheckpoint;
use crate::{AppError, Result};

const FILE_PREFIX: &str = "checkpoint-";
const PLAIN_SUFFIX: &str = ".json";
const GZIP_SUFFIX: &str = ".json.gz";

/// Durable store for [`TaskCheckpoint`] files.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    compress: bool,
}

impl CheckpointStore {
    /// Open (creating if needed) a store whose encoding follows `profile`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>, profile: HardwareProfile) -> Result<Self> {
        Self::with_compression(dir, profile.compress_checkpoints())
    }

    /// Open a store with an explicit compression choice.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn with_compression(dir: impl Into<PathBuf>, compress: bool) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create checkpoint directory {}: {err}",
                dir.display()
            ))
        })?;
        Ok(Self { dir, compress })
    }

    /// Directory the store writes to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether new checkpoints are gzip-compressed.
    #[must_use]
    pub fn compresses(&self) -> bool {
        self.compress
    }

    /// Seal and persist a checkpoint, returning the written path.
    ///
    /// The checksum is computed into `checkpoint` before writing. A stored
    /// valid checkpoint is only superseded by one with a strictly later
    /// `checkpoint_time`; re-saving an identical checkpoint is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::StaleCheckpoint` if the stored checkpoint is not
    /// older, or `AppError::Io`/`AppError::Serialization` if the write fails.
    pub fn save(&self, checkpoint: &mut TaskCheckpoint) -> Result<PathBuf> {
        let span = info_span!("checkpoint_save", task_id = %checkpoint.task_id);
        let _guard = span.enter();

        validate_key("task", &checkpoint.task_id)?;
        checkpoint.seal()?;

        if let Some(existing) = self.load(&checkpoint.task_id) {
            if existing.checksum == checkpoint.checksum {
                debug!("identical checkpoint already stored");
                return Ok(self.existing_path(&checkpoint.task_id));
            }
            if existing.checkpoint_time >= checkpoint.checkpoint_time {
                return Err(AppError::StaleCheckpoint(format!(
                    "task {} already has a checkpoint at {}",
                    checkpoint.task_id, existing.checkpoint_time
                )));
            }
        }

        let json = serde_json::to_vec_pretty(&*checkpoint)?;
        let (path, stale) = if self.compress {
            (
                self.path_for(&checkpoint.task_id, true),
                self.path_for(&checkpoint.task_id, false),
            )
        } else {
            (
                self.path_for(&checkpoint.task_id, false),
                self.path_for(&checkpoint.task_id, true),
            )
        };

        let bytes = if self.compress { gzip(&json)? } else { json };
        write_atomic(&path, &bytes)?;
        if let Err(err) = remove_if_exists(&stale) {
            warn!(%err, "failed to remove checkpoint in previous encoding");
        }

        info!(
            progress = checkpoint.progress,
            state = %checkpoint.state,
            compressed = self.compress,
            "checkpoint saved"
        );
        Ok(path)
    }

    /// Load the checkpoint for `task_id`.
    ///
    /// Tries the compressed file first, then the plain one. Returns `None`
    /// if no file exists, the file cannot be decoded, or the checksum does
    /// not verify.
    #[must_use]
    pub fn load(&self, task_id: &str) -> Option<TaskCheckpoint> {
        let checkpoint = self.load_unverified(task_id)?;
        match checkpoint.verify() {
            Ok(()) => Some(checkpoint),
            Err(err) => {
                warn!(task_id, %err, "discarding checkpoint that failed verification");
                None
            }
        }
    }

    /// Decode the stored checkpoint without checking its checksum.
    pub(crate) fn load_unverified(&self, task_id: &str) -> Option<TaskCheckpoint> {
        if let Err(err) = validate_key("task", task_id) {
            warn!(task_id, %err, "refusing to load checkpoint");
            return None;
        }

        for compressed in [true, false] {
            let path = self.path_for(task_id, compressed);
            match read_checkpoint(&path, compressed) {
                Ok(Some(checkpoint)) => return Some(checkpoint),
                Ok(None) => {}
                Err(err) => {
                    warn!(task_id, path = %path.display(), %err, "failed to read checkpoint");
                }
            }
        }
        None
    }

    /// Task ids that have a checkpoint file, sorted.
    #[must_use]
    pub fn list(&self) -> BTreeSet<String> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), %err, "failed to list checkpoints");
                return BTreeSet::new();
            }
        };

        entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                let rest = name.strip_prefix(FILE_PREFIX)?;
                rest.strip_suffix(GZIP_SUFFIX)
                    .or_else(|| rest.strip_suffix(PLAIN_SUFFIX))
                    .map(ToOwned::to_owned)
            })
            .collect()
    }

    /// Every checkpoint that loads and verifies.
    #[must_use]
    pub fn load_all(&self) -> Vec<TaskCheckpoint> {
        self.list()
            .iter()
            .filter_map(|task_id| self.load(task_id))
            .collect()
    }

    /// Delete both encodings for `task_id`. Returns whether anything was removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if an existing file cannot be removed.
    pub fn delete(&self, task_id: &str) -> Result<bool> {
        validate_key("task", task_id)?;
        let removed_gz = remove_if_exists(&self.path_for(task_id, true))?;
        let removed_plain = remove_if_exists(&self.path_for(task_id, false))?;
        if removed_gz || removed_plain {
            info!(task_id, "checkpoint deleted");
        }
        Ok(removed_gz || removed_plain)
    }

    /// Delete checkpoints whose `checkpoint_time` predates `max_age_hours`.
    ///
    /// Files that cannot be decoded are left in place.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a stale file cannot be removed.
    pub fn cleanup(&self, max_age_hours: u64) -> Result<usize> {
        let hours = i64::try_from(max_age_hours).unwrap_or(i64::MAX);
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let mut removed = 0;
        for task_id in self.list() {
            let Some(checkpoint) = self.load_unverified(&task_id) else {
                continue;
            };
            if checkpoint.checkpoint_time < cutoff && self.delete(&task_id)? {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, max_age_hours, "old checkpoints purged");
        }
        Ok(removed)
    }

    fn path_for(&self, task_id: &str, compressed: bool) -> PathBuf {
        let suffix = if compressed { GZIP_SUFFIX } else { PLAIN_SUFFIX };
        self.dir.join(format!("{FILE_PREFIX}{task_id}{suffix}"))
    }

    fn existing_path(&self, task_id: &str) -> PathBuf {
        let gz = self.path_for(task_id, true);
        if gz.exists() {
            gz
        } else {
            self.path_for(task_id, false)
        }
    }
}

fn read_checkpoint(path: &Path, compressed: bool) -> Result<Option<TaskCheckpoint>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let json = if compressed { gunzip(&bytes)? } else { bytes };
    Ok(Some(serde_json::from_slice(&json)?))
}

fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}
