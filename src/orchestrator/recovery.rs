//! Failure recording and checkpoint-based recovery.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use tracing::{info, info_span, warn};

use super::session_manager::SessionManager;
use crate::models::checkpoint::TaskCheckpoint;
use crate::models::failure::{FailureRecord, FailureType};
use crate::persistence::checkpoint_store::CheckpointStore;
use crate::persistence::journal::JsonlJournal;
use crate::{AppError, Result};

/// Records failures and selects the checkpoint to recover from.
pub struct FailureRecovery {
    store: CheckpointStore,
    sessions: Arc<SessionManager>,
    journal: JsonlJournal<FailureRecord>,
    records: Mutex<Vec<FailureRecord>>,
}

impl FailureRecovery {
    /// Recovery policy journaling to `<dir>/failures.jsonl`.
    ///
    /// Previously journaled failures are reloaded.
    #[must_use]
    pub fn new(store: CheckpointStore, sessions: Arc<SessionManager>, dir: &Path) -> Self {
        let journal = JsonlJournal::new(dir.join("failures.jsonl"));
        let records = journal.read_all();
        Self {
            store,
            sessions,
            journal,
            records: Mutex::new(records),
        }
    }

    /// Record a failure and persist it.
    ///
    /// `checkpoint_available` reflects whether a valid stored checkpoint
    /// exists for `task_id` right now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the failure journal cannot be written.
    pub fn record_failure(
        &self,
        failure_type: FailureType,
        message: &str,
        stack_trace: Option<&str>,
        task_id: Option<&str>,
    ) -> Result<FailureRecord> {
        let checkpoint_available = task_id.is_some_and(|id| self.store.load(id).is_some());
        let record = FailureRecord {
            timestamp: Utc::now(),
            task_id: task_id.map(ToOwned::to_owned),
            failure_type,
            error_message: message.to_owned(),
            stack_trace: stack_trace.map(ToOwned::to_owned),
            recovery_attempted: false,
            recovery_successful: false,
            checkpoint_available,
        };

        let mut records = self.lock()?;
        self.journal.append(&record)?;
        records.push(record.clone());
        drop(records);

        warn!(
            task_id = task_id.unwrap_or(""),
            failure_type = %failure_type,
            checkpoint_available,
            error = message,
            "failure recorded"
        );
        Ok(record)
    }

    /// Newest valid checkpoint for `task_id`, optionally for one agent.
    ///
    /// Candidates are the stored checkpoint plus every checkpoint attached
    /// to a session. Invalid candidates count as absent. The most recent
    /// failure for the task is marked as attempted, and as successful when
    /// a checkpoint is returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the updated failure journal cannot be written.
    pub fn recover(&self, task_id: &str, agent_id: Option<&str>) -> Result<Option<TaskCheckpoint>> {
        let span = info_span!("recover", task_id, agent_id = agent_id.unwrap_or(""));
        let _guard = span.enter();

        let stored = self
            .store
            .load(task_id)
            .filter(|cp| agent_id.is_none_or(|agent| cp.agent_id == agent));
        let candidates = stored
            .into_iter()
            .chain(self.sessions.checkpoints_for_task(task_id, agent_id));

        let mut best: Option<TaskCheckpoint> = None;
        for candidate in candidates {
            if !candidate.is_valid() {
                warn!(checkpoint_time = %candidate.checkpoint_time, "skipping invalid checkpoint");
                continue;
            }
            if best
                .as_ref()
                .is_none_or(|current| candidate.checkpoint_time > current.checkpoint_time)
            {
                best = Some(candidate);
            }
        }

        self.mark_latest(task_id, best.is_some())?;

        match &best {
            Some(checkpoint) => info!(
                progress = checkpoint.progress,
                checkpoint_time = %checkpoint.checkpoint_time,
                "recovery checkpoint selected"
            ),
            None => warn!("no valid checkpoint to recover from"),
        }
        Ok(best)
    }

    /// Like [`recover`](Self::recover) but absence is an error.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RecoveryUnavailable` if no valid checkpoint exists.
    pub fn require_recovery(&self, task_id: &str, agent_id: Option<&str>) -> Result<TaskCheckpoint> {
        self.recover(task_id, agent_id)?
            .ok_or_else(|| AppError::RecoveryUnavailable(format!("no valid checkpoint for {task_id}")))
    }

    /// Recorded failures, optionally for one task, oldest first.
    #[must_use]
    pub fn failures(&self, task_id: Option<&str>) -> Vec<FailureRecord> {
        let Ok(records) = self.lock() else {
            return Vec::new();
        };
        records
            .iter()
            .filter(|record| task_id.is_none_or(|id| record.task_id.as_deref() == Some(id)))
            .cloned()
            .collect()
    }

    fn mark_latest(&self, task_id: &str, successful: bool) -> Result<()> {
        let mut records = self.lock()?;
        let Some(index) = records
            .iter()
            .rposition(|record| record.task_id.as_deref() == Some(task_id))
        else {
            return Ok(());
        };
        // Memory only changes once the journal holds the new flags.
        let mut updated = records.clone();
        updated[index].recovery_attempted = true;
        updated[index].recovery_successful = successful;
        self.journal.replace_all(&updated)?;
        *records = updated;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<FailureRecord>>> {
        self.records
            .lock()
            .map_err(|_| AppError::InvalidState("failure log mutex poisoned".into()))
    }
}

/// Human-readable recovery plan for a failure type.
#[must_use]
pub fn recovery_strategy(failure_type: FailureType) -> &'static str {
    match failure_type {
        FailureType::Crash => "restore latest checkpoint and resume",
        FailureType::Timeout => "restore and retry with extended timeout",
        FailureType::ResourceExhaustion => "restore and resume under tighter resource limits",
        FailureType::Error => "restore latest valid checkpoint and resume",
    }
}
