//! Agent session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::checkpoint::TaskCheckpoint;
use super::metrics::ResourceMetrics;

/// Lifecycle state for a supervised session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session running.
    Active,
    /// Session paused by an operator or by resource pressure.
    Paused,
    /// Session parked for a long period; must pass through `Paused` to resume.
    Suspended,
    /// Session finished successfully.
    Completed,
    /// Session ended in failure.
    Failed,
}

impl SessionState {
    /// Whether the session has ended.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Coarse health assessment of a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Nothing to report.
    Healthy,
    /// Soft limits exceeded.
    Warning,
    /// Hard limits exceeded or the session went silent.
    Critical,
    /// Not evaluated yet.
    #[default]
    Unknown,
}

/// Lifecycle record of one supervised run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct AgentSession {
    /// Globally unique identifier.
    pub session_id: String,
    /// Agent owning the session.
    pub agent_id: String,
    /// Creation timestamp.
    pub start_time: DateTime<Utc>,
    /// Most recent activity; never moves backwards.
    pub last_activity: DateTime<Utc>,
    /// Hours elapsed between `start_time` and the last update.
    pub duration_hours: f64,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Checkpoints taken during the session, oldest first.
    #[serde(default)]
    pub checkpoints: Vec<TaskCheckpoint>,
    /// Last observed resource sample.
    #[serde(default)]
    pub resource_metrics: Option<ResourceMetrics>,
    /// Result of the last health check.
    #[serde(default)]
    pub health_status: HealthStatus,
    /// Free-form annotations.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentSession {
    /// Construct an active session with a generated identifier.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, metadata: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            start_time: now,
            last_activity: now,
            duration_hours: 0.0,
            state: SessionState::Active,
            checkpoints: Vec::new(),
            resource_metrics: None,
            health_status: HealthStatus::Unknown,
            metadata,
        }
    }

    /// Determine whether a lifecycle transition is permitted.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        matches!(
            (self.state, next),
            (
                SessionState::Active,
                SessionState::Paused
                    | SessionState::Suspended
                    | SessionState::Completed
                    | SessionState::Failed
            ) | (
                SessionState::Paused,
                SessionState::Active
                    | SessionState::Suspended
                    | SessionState::Completed
                    | SessionState::Failed
            ) | (
                SessionState::Suspended,
                SessionState::Paused | SessionState::Completed | SessionState::Failed
            )
        )
    }

    /// Advance `last_activity` to `at` unless it is already later.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// Recompute `duration_hours` relative to `now`.
    #[allow(clippy::cast_precision_loss)]
    pub fn refresh_duration(&mut self, now: DateTime<Utc>) {
        let millis = (now - self.start_time).num_milliseconds().max(0);
        self.duration_hours = millis as f64 / 3_600_000.0;
    }

    /// Most recent checkpoint by `checkpoint_time`.
    #[must_use]
    pub fn latest_checkpoint(&self) -> Option<&TaskCheckpoint> {
        self.checkpoints.iter().max_by_key(|cp| cp.checkpoint_time)
    }
}
