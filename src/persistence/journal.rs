//! Append-only JSONL journal.
//!
//! Appends one JSON object per line. A crash mid-append can leave a torn
//! final line; [`JsonlJournal::read_all`] skips any line that does not decode.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::atomic::write_atomic;
use crate::{AppError, Result};

/// Line-oriented journal of `T` records.
pub struct JsonlJournal<T> {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    _record: PhantomData<fn() -> T>,
}

impl<T> JsonlJournal<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Journal backed by `path`; the file is opened on first append.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
            _record: PhantomData,
        }
    }

    /// File backing the journal.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush it to the OS.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file cannot be opened or written.
    pub fn append(&self, record: &T) -> Result<()> {
        let line = serde_json::to_string(record)?;

        let mut guard = self
            .writer
            .lock()
            .map_err(|_| AppError::InvalidState("journal writer mutex poisoned".into()))?;

        if guard.is_none() {
            *guard = Some(Self::open(&self.path)?);
        }

        if let Some(writer) = guard.as_mut() {
            writeln!(writer, "{line}")
                .and_then(|()| writer.flush())
                .map_err(|err| {
                    AppError::Io(format!("journal write {} failed: {err}", self.path.display()))
                })?;
        }
        Ok(())
    }

    /// Replace the journal contents with `records` in one atomic write.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the replacement cannot be written.
    pub fn replace_all(&self, records: &[T]) -> Result<()> {
        let mut body = String::new();
        for record in records {
            body.push_str(&serde_json::to_string(record)?);
            body.push('\n');
        }

        let mut guard = self
            .writer
            .lock()
            .map_err(|_| AppError::InvalidState("journal writer mutex poisoned".into()))?;
        // The open append handle would point at the replaced inode.
        *guard = None;
        write_atomic(&self.path, body.as_bytes())
    }

    /// Every record that decodes, in file order.
    ///
    /// A missing file yields an empty list.
    #[must_use]
    pub fn read_all(&self) -> Vec<T> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(path = %self.path.display(), %err, "failed to open journal");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let Ok(line) = line else {
                warn!(path = %self.path.display(), line = index + 1, "unreadable journal line");
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(path = %self.path.display(), line = index + 1, %err, "skipping malformed journal line");
                }
            }
        }
        records
    }

    fn open(path: &Path) -> Result<BufWriter<File>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                AppError::Io(format!("cannot create {}: {err}", parent.display()))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| AppError::Io(format!("cannot open {}: {err}", path.display())))?;
        Ok(BufWriter::new(file))
    }
}
