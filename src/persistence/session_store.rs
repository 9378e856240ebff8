//! File-backed session store: one `<session_id>.json` per session.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::atomic::{remove_if_exists, write_atomic};
use super::validate_key;
use crate::models::session::AgentSession;
use crate::{AppError, Result};

/// Repository wrapper around the session directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the session directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Io(format!(
                "failed to create session directory {}: {err}",
                dir.display()
            ))
        })?;
        Ok(Self { dir })
    }

    /// Directory the store writes to.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist a session, replacing any previous file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` or `AppError::Serialization` on write failure.
    pub fn save(&self, session: &AgentSession) -> Result<PathBuf> {
        validate_key("session", &session.session_id)?;
        let path = self.path_for(&session.session_id);
        let json = serde_json::to_vec_pretty(session)?;
        write_atomic(&path, &json)?;
        debug!(session_id = %session.session_id, "session persisted");
        Ok(path)
    }

    /// Load a session; I/O and decode failures are logged and yield `None`.
    #[must_use]
    pub fn load(&self, session_id: &str) -> Option<AgentSession> {
        if validate_key("session", session_id).is_err() {
            return None;
        }
        read_session(&self.path_for(session_id))
    }

    /// Every session file that decodes.
    #[must_use]
    pub fn list(&self) -> Vec<AgentSession> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %self.dir.display(), %err, "failed to list sessions");
                return Vec::new();
            }
        };

        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|path| read_session(&path))
            .collect()
    }

    /// Delete a session file. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the file exists but cannot be removed.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        validate_key("session", session_id)?;
        remove_if_exists(&self.path_for(session_id))
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }
}

fn read_session(path: &Path) -> Option<AgentSession> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to read session");
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(session) => Some(session),
        Err(err) => {
            warn!(path = %path.display(), %err, "failed to decode session");
            None
        }
    }
}
