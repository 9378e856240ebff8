//! Persistence layer modules.
//!
//! The filesystem is the durable source of truth. Checkpoints and sessions
//! are whole-file replacements; progress and failure journals are JSONL.

pub mod atomic;
pub mod checkpoint_store;
pub mod journal;
pub mod retention;
pub mod session_store;

use crate::{AppError, Result};

/// Reject identifiers that would escape a store directory.
pub(crate) fn validate_key(kind: &str, key: &str) -> Result<()> {
    if key.is_empty() || key == "." || key == ".." || key.contains(['/', '\\', '\0']) {
        return Err(AppError::InvalidState(format!("invalid {kind} id '{key}'")));
    }
    Ok(())
}
