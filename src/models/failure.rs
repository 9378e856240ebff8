//! Failure classification and records.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Broad cause of a task failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    /// The process died unexpectedly.
    Crash,
    /// The task exceeded its time allowance.
    Timeout,
    /// The host ran out of CPU, memory or disk headroom.
    ResourceExhaustion,
    /// Any other error raised by the task.
    Error,
}

impl FailureType {
    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crash => "crash",
            Self::Timeout => "timeout",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Error => "error",
        }
    }
}

impl Display for FailureType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "crash" => Ok(Self::Crash),
            "timeout" => Ok(Self::Timeout),
            "resource_exhaustion" => Ok(Self::ResourceExhaustion),
            "error" => Ok(Self::Error),
            other => Err(AppError::InvalidState(format!(
                "unknown failure type '{other}'"
            ))),
        }
    }
}

/// One observed failure and what recovery made of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct FailureRecord {
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
    /// Task that failed, if known.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Cause classification.
    pub failure_type: FailureType,
    /// Error text.
    pub error_message: String,
    /// Backtrace or stack text, if captured.
    #[serde(default)]
    pub stack_trace: Option<String>,
    /// Whether recovery was tried.
    pub recovery_attempted: bool,
    /// Whether recovery produced a valid checkpoint.
    pub recovery_successful: bool,
    /// Whether a checkpoint existed when the failure was recorded.
    pub checkpoint_available: bool,
}
