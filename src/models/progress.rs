//! Progress snapshot model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One progress report for a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ProgressSnapshot {
    /// When the report was recorded.
    pub timestamp: DateTime<Utc>,
    /// Completion fraction in `[0, 1]`.
    pub progress: f64,
    /// Label of the step currently executing.
    pub current_step: String,
    /// Steps finished so far.
    pub steps_completed: u64,
    /// Total steps, if known up front.
    pub total_steps: u64,
    /// Estimated hours until completion.
    #[serde(default)]
    pub estimated_remaining_hours: Option<f64>,
}
