//! Resumption from a stored checkpoint.
//!
//! A checkpoint is resumable when it verifies, its state is one of
//! `Paused`, `Checkpointed` or `Failed`, and every artifact it lists still
//! exists under the project root.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{info, info_span, warn};

use crate::models::checkpoint::{TaskCheckpoint, RESERVED_CONTEXT_KEY};
use crate::models::task_state::{TaskState, TaskStateMachine};
use crate::persistence::checkpoint_store::CheckpointStore;
use crate::{AppError, Result};

/// Presence of one artifact listed by a checkpoint.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArtifactCheck {
    /// Path as recorded in the checkpoint.
    pub path: String,
    /// Path resolved against the project root.
    pub resolved: PathBuf,
    /// Whether the file exists.
    pub present: bool,
}

/// Everything needed to hand a task back to its runner.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    /// The verified checkpoint.
    pub checkpoint: TaskCheckpoint,
    /// Task context with checkpoint details under the reserved key.
    pub restored_context: Map<String, Value>,
    /// Per-artifact presence.
    pub artifact_validation: Vec<ArtifactCheck>,
    /// Progress at the checkpoint.
    pub progress: f64,
    /// Owning agent.
    pub agent_id: String,
    /// Command the task runs.
    pub command: String,
    /// State machine advanced to `Running`.
    pub state_machine: TaskStateMachine,
}

/// Summary of a task that can be resumed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResumableTaskSummary {
    /// Task id.
    pub task_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Command the task runs.
    pub command: String,
    /// Stored state.
    pub state: TaskState,
    /// Stored progress.
    pub progress: f64,
    /// When the checkpoint was taken.
    pub checkpoint_time: DateTime<Utc>,
}

/// A task runner that accepts restored context.
pub trait ResumableTask {
    /// Load the restored context before execution continues.
    ///
    /// # Errors
    ///
    /// Implementations return an error if the context is unusable.
    fn restore(&mut self, context: &Map<String, Value>) -> Result<()>;
}

/// Validates checkpoints and rebuilds execution context.
#[derive(Debug, Clone)]
pub struct ResumeHandler {
    store: CheckpointStore,
    project_root: PathBuf,
}

impl ResumeHandler {
    /// Handler reading `store` and resolving artifacts under `project_root`.
    #[must_use]
    pub fn new(store: CheckpointStore, project_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            project_root: project_root.into(),
        }
    }

    /// Whether `task_id` can be resumed, with the reason when it cannot.
    #[must_use]
    pub fn can_resume(&self, task_id: &str) -> (bool, Option<String>) {
        match self.assess(task_id) {
            Ok(_) => (true, None),
            Err(err) => (false, Some(err.to_string())),
        }
    }

    /// Build a resume plan for `task_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RecoveryUnavailable` without a checkpoint,
    /// `AppError::ChecksumMismatch` for a tampered one,
    /// `AppError::InvalidState` for a non-resumable state, or
    /// `AppError::ArtifactMissing` naming every absent artifact.
    pub fn prepare(&self, task_id: &str) -> Result<ResumePlan> {
        let span = info_span!("resume_prepare", task_id);
        let _guard = span.enter();

        let (checkpoint, artifact_validation) = self.assess(task_id)?;

        let mut state_machine = TaskStateMachine::restore(task_id, checkpoint.state);
        let path = checkpoint.state.resume_path().ok_or_else(|| {
            AppError::InvalidState(format!("state {} is not resumable", checkpoint.state))
        })?;
        for next in path {
            state_machine.transition(*next, Some("resume from checkpoint"), None)?;
        }

        let mut restored_context = checkpoint.context.clone();
        restored_context.insert(
            RESERVED_CONTEXT_KEY.to_owned(),
            json!({
                "task_id": checkpoint.task_id,
                "agent_id": checkpoint.agent_id,
                "command": checkpoint.command,
                "checkpoint_time": checkpoint.checkpoint_time.to_rfc3339(),
                "progress": checkpoint.progress,
            }),
        );

        info!(
            progress = checkpoint.progress,
            from = %checkpoint.state,
            "resume plan prepared"
        );
        Ok(ResumePlan {
            progress: checkpoint.progress,
            agent_id: checkpoint.agent_id.clone(),
            command: checkpoint.command.clone(),
            checkpoint,
            restored_context,
            artifact_validation,
            state_machine,
        })
    }

    /// Prepare a plan, build the task with `factory`, and inject the context.
    ///
    /// # Errors
    ///
    /// Returns any error from [`prepare`](Self::prepare), the factory, or
    /// the task's `restore`.
    pub fn resume<T, F>(&self, task_id: &str, factory: F) -> Result<(T, ResumePlan)>
    where
        T: ResumableTask,
        F: FnOnce(&ResumePlan) -> Result<T>,
    {
        let plan = self.prepare(task_id)?;
        let mut task = factory(&plan)?;
        task.restore(&plan.restored_context)?;
        info!(task_id, "task resumed from checkpoint");
        Ok((task, plan))
    }

    /// Every stored task that passes [`can_resume`](Self::can_resume).
    #[must_use]
    pub fn list_resumable(&self) -> Vec<ResumableTaskSummary> {
        self.store
            .list()
            .into_iter()
            .filter_map(|task_id| match self.assess(&task_id) {
                Ok((checkpoint, _)) => Some(ResumableTaskSummary {
                    task_id,
                    agent_id: checkpoint.agent_id,
                    command: checkpoint.command,
                    state: checkpoint.state,
                    progress: checkpoint.progress,
                    checkpoint_time: checkpoint.checkpoint_time,
                }),
                Err(_) => None,
            })
            .collect()
    }

    fn assess(&self, task_id: &str) -> Result<(TaskCheckpoint, Vec<ArtifactCheck>)> {
        let checkpoint = self.store.load_unverified(task_id).ok_or_else(|| {
            AppError::RecoveryUnavailable(format!("no checkpoint for task {task_id}"))
        })?;
        checkpoint.verify()?;

        if !checkpoint.state.is_resumable() {
            return Err(AppError::InvalidState(format!(
                "checkpoint state {} is not resumable",
                checkpoint.state
            )));
        }

        let checks = check_artifacts(&self.project_root, &checkpoint.artifacts);
        let missing: Vec<String> = checks
            .iter()
            .filter(|check| !check.present)
            .map(|check| check.path.clone())
            .collect();
        if !missing.is_empty() {
            warn!(task_id, missing = missing.len(), "checkpoint artifacts missing");
            return Err(AppError::ArtifactMissing(missing));
        }
        Ok((checkpoint, checks))
    }
}

fn check_artifacts(root: &Path, artifacts: &[String]) -> Vec<ArtifactCheck> {
    artifacts
        .iter()
        .map(|path| {
            let resolved = root.join(path);
            ArtifactCheck {
                present: resolved.exists(),
                path: path.clone(),
                resolved,
            }
        })
        .collect()
}
