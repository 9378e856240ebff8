//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::models::task_state::TaskState;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// JSON encoding or decoding failure.
    Serialization(String),
    /// Resource sampling failure.
    Monitor(String),
    /// Task state machine contract violation.
    InvalidTransition {
        /// State the machine was in.
        from: TaskState,
        /// Rejected target state.
        to: TaskState,
    },
    /// Stored checksum does not match the recomputed one.
    ChecksumMismatch(String),
    /// Execution refused because resource pressure paused the executor.
    ResourceExhaustedPause(String),
    /// Checkpoint references artifacts that no longer exist on disk.
    ArtifactMissing(Vec<String>),
    /// No valid checkpoint is available to recover from.
    RecoveryUnavailable(String),
    /// Requested entity does not exist.
    NotFound(String),
    /// Operation is not legal in the entity's current state.
    InvalidState(String),
    /// Checkpoint is not strictly newer than the one already stored.
    StaleCheckpoint(String),
    /// The supervised task returned an error.
    TaskFailed(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Serialization(msg) => write!(f, "serialization: {msg}"),
            Self::Monitor(msg) => write!(f, "monitor: {msg}"),
            Self::InvalidTransition { from, to } => {
                write!(f, "invalid transition: {from} -> {to}")
            }
            Self::ChecksumMismatch(msg) => write!(f, "checksum mismatch: {msg}"),
            Self::ResourceExhaustedPause(msg) => write!(f, "paused: {msg}"),
            Self::ArtifactMissing(paths) => {
                write!(f, "artifact missing: {}", paths.join(", "))
            }
            Self::RecoveryUnavailable(msg) => write!(f, "recovery unavailable: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            Self::StaleCheckpoint(msg) => write!(f, "stale checkpoint: {msg}"),
            Self::TaskFailed(msg) => write!(f, "task failed: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}
