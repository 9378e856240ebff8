//! Task lifecycle states and the append-only state machine.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{AppError, Result};

/// Lifecycle state of a supervised task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created but not yet started.
    Initialized,
    /// Actively executing.
    Running,
    /// Execution suspended; resumable.
    Paused,
    /// A durable snapshot was just written.
    Checkpointed,
    /// Finished successfully. Terminal.
    Completed,
    /// Execution failed; may be retried.
    Failed,
    /// Restored from a checkpoint, about to run again.
    Resumed,
    /// Scheduled for another attempt after a failure.
    Retry,
}

impl TaskState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Initialized,
        Self::Running,
        Self::Paused,
        Self::Checkpointed,
        Self::Completed,
        Self::Failed,
        Self::Resumed,
        Self::Retry,
    ];

    /// Legal successors of this state.
    #[must_use]
    pub fn targets(self) -> &'static [Self] {
        match self {
            Self::Initialized => &[Self::Running],
            Self::Running => &[
                Self::Checkpointed,
                Self::Paused,
                Self::Completed,
                Self::Failed,
            ],
            Self::Checkpointed => &[Self::Running, Self::Paused],
            Self::Paused => &[Self::Resumed, Self::Running],
            Self::Resumed | Self::Retry => &[Self::Running],
            Self::Failed => &[Self::Retry, Self::Running],
            Self::Completed => &[],
        }
    }

    /// Whether `next` is a legal successor of this state.
    #[must_use]
    pub fn allows(self, next: Self) -> bool {
        self.targets().contains(&next)
    }

    /// Whether a task stored in this state may be resumed.
    #[must_use]
    pub fn is_resumable(self) -> bool {
        matches!(self, Self::Paused | Self::Checkpointed | Self::Failed)
    }

    /// Stable lowercase name used in files and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Checkpointed => "checkpointed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Resumed => "resumed",
            Self::Retry => "retry",
        }
    }

    /// Legal route from a stored resumable state back to `Running`.
    ///
    /// Returns `None` for states that cannot be resumed.
    #[must_use]
    pub fn resume_path(self) -> Option<&'static [Self]> {
        match self {
            Self::Paused => Some(&[Self::Resumed, Self::Running]),
            Self::Checkpointed => Some(&[Self::Paused, Self::Resumed, Self::Running]),
            Self::Failed => Some(&[Self::Retry, Self::Running]),
            _ => None,
        }
    }
}

impl Display for TaskState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| AppError::InvalidState(format!("unknown task state '{s}'")))
    }
}

/// Immutable record of one state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateTransition {
    /// State before the change.
    pub from: TaskState,
    /// State after the change.
    pub to: TaskState,
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
    /// Optional human-readable cause.
    pub reason: Option<String>,
    /// Caller-supplied metadata.
    pub metadata: Map<String, Value>,
}

/// Finite automaton over [`TaskState`] with an append-only transition log.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    task_id: String,
    state: TaskState,
    history: Vec<StateTransition>,
}

impl TaskStateMachine {
    /// New machine in `Initialized`.
    #[must_use]
    pub fn new(task_id: impl Into<String>) -> Self {
        Self::restore(task_id, TaskState::Initialized)
    }

    /// Machine positioned at a previously stored state, with an empty log.
    #[must_use]
    pub fn restore(task_id: impl Into<String>, state: TaskState) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            history: Vec::new(),
        }
    }

    /// Task this machine belongs to.
    #[must_use]
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Transitions recorded so far, oldest first.
    #[must_use]
    pub fn history(&self) -> &[StateTransition] {
        &self.history
    }

    /// Move to `next`, appending a transition record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if `next` is not a legal
    /// successor; the state and log are left untouched.
    pub fn transition(
        &mut self,
        next: TaskState,
        reason: Option<&str>,
        metadata: Option<Map<String, Value>>,
    ) -> Result<&StateTransition> {
        if !self.can_transition(next) {
            return Err(AppError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }

        debug!(task_id = %self.task_id, from = %self.state, to = %next, "task transition");
        let record = StateTransition {
            from: self.state,
            to: next,
            timestamp: Utc::now(),
            reason: reason.map(ToOwned::to_owned),
            metadata: metadata.unwrap_or_default(),
        };
        self.state = next;
        self.history.push(record);
        Ok(&self.history[self.history.len() - 1])
    }

    /// Whether `next` is reachable in one step.
    #[must_use]
    pub fn can_transition(&self, next: TaskState) -> bool {
        self.state.allows(next)
    }

    /// True only in `Completed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state == TaskState::Completed
    }

    /// True in `Paused`, `Checkpointed` and `Failed`.
    #[must_use]
    pub fn can_resume(&self) -> bool {
        self.state.is_resumable()
    }
}
