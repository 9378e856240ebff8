//! Durable task snapshot with a canonical SHA-256 checksum.
//!
//! The checksum covers every field except itself, serialized as compact
//! JSON with object keys sorted at every depth. Two checkpoints with the
//! same field values always produce the same digest, whatever order the
//! caller inserted context entries in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::task_state::TaskState;
use crate::{AppError, Result};

/// Key under which resume metadata is injected into a restored context.
pub const RESERVED_CONTEXT_KEY: &str = "_checkpoint";

/// A durable, checksum-verified snapshot of one task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct TaskCheckpoint {
    /// Task this snapshot belongs to.
    pub task_id: String,
    /// Agent running the task.
    pub agent_id: String,
    /// Command the task executes.
    pub command: String,
    /// Task state at snapshot time.
    pub state: TaskState,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// When the snapshot was taken.
    pub checkpoint_time: DateTime<Utc>,
    /// Task-owned key/value state (partial results and the like).
    #[serde(default)]
    pub context: Map<String, Value>,
    /// Files produced so far, relative to the project root.
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Free-form annotations.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Hex SHA-256 over the canonical form of every other field.
    #[serde(default)]
    pub checksum: String,
}

/// Borrowed view of a checkpoint without its checksum.
#[derive(Serialize)]
struct ChecksumInput<'a> {
    task_id: &'a str,
    agent_id: &'a str,
    command: &'a str,
    state: TaskState,
    progress: f64,
    checkpoint_time: &'a DateTime<Utc>,
    context: &'a Map<String, Value>,
    artifacts: &'a [String],
    metadata: &'a Map<String, Value>,
}

impl TaskCheckpoint {
    /// Construct an unsealed snapshot taken now.
    ///
    /// Progress is clamped to `[0, 1]`; a NaN progress is stored as zero.
    #[must_use]
    pub fn new(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        command: impl Into<String>,
        state: TaskState,
        progress: f64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            command: command.into(),
            state,
            progress: clamp_progress(progress),
            checkpoint_time: Utc::now(),
            context: Map::new(),
            artifacts: Vec::new(),
            metadata: Map::new(),
            checksum: String::new(),
        }
    }

    /// Replace the task context.
    #[must_use]
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }

    /// Replace the artifact list.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Replace the metadata map.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Override the snapshot timestamp.
    #[must_use]
    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.checkpoint_time = time;
        self
    }

    /// Canonical JSON of every field except the checksum.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if a context value cannot be encoded.
    pub fn canonical_json(&self) -> Result<String> {
        let input = ChecksumInput {
            task_id: &self.task_id,
            agent_id: &self.agent_id,
            command: &self.command,
            state: self.state,
            progress: self.progress,
            checkpoint_time: &self.checkpoint_time,
            context: &self.context,
            artifacts: &self.artifacts,
            metadata: &self.metadata,
        };
        let value = sort_keys(serde_json::to_value(&input)?);
        Ok(serde_json::to_string(&value)?)
    }

    /// Recompute the checksum from the current field values.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if canonicalization fails.
    pub fn compute_checksum(&self) -> Result<String> {
        let canonical = self.canonical_json()?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Store the freshly computed checksum.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Serialization` if canonicalization fails.
    pub fn seal(&mut self) -> Result<()> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }

    /// Whether the stored checksum matches the field values.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.checksum.is_empty()
            && self
                .compute_checksum()
                .is_ok_and(|computed| computed == self.checksum)
    }

    /// Like [`is_valid`](Self::is_valid) but reports the mismatch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ChecksumMismatch` when the digests differ.
    pub fn verify(&self) -> Result<()> {
        let computed = self.compute_checksum()?;
        if computed == self.checksum {
            Ok(())
        } else {
            Err(AppError::ChecksumMismatch(format!(
                "checkpoint for task {} (stored {}, computed {computed})",
                self.task_id,
                if self.checksum.is_empty() {
                    "<none>"
                } else {
                    &self.checksum
                }
            )))
        }
    }
}

/// Clamp a progress value into `[0, 1]`.
#[must_use]
pub fn clamp_progress(progress: f64) -> f64 {
    if progress.is_nan() {
        0.0
    } else {
        progress.clamp(0.0, 1.0)
    }
}

/// Rebuild a JSON value with object keys in sorted order at every depth.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, inner)| (key, sort_keys(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}
