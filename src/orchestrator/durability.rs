//! Checkpoint cadence policy and artifact backup.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::hardware::HardwareProfile;
use crate::{AppError, Result};

/// How aggressively a task is checkpointed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    /// Every ten minutes.
    Basic,
    /// Every five minutes.
    #[default]
    Standard,
    /// Every two minutes, with artifact backups.
    High,
}

impl DurabilityLevel {
    /// Base interval before hardware scaling.
    #[must_use]
    pub fn base_interval(self) -> Duration {
        match self {
            Self::Basic => Duration::from_secs(600),
            Self::Standard => Duration::from_secs(300),
            Self::High => Duration::from_secs(120),
        }
    }

    /// Whether artifacts are copied aside on every checkpoint.
    #[must_use]
    pub fn backs_up_artifacts(self) -> bool {
        self == Self::High
    }
}

/// Decides when a task is due for its next checkpoint.
#[derive(Debug, Clone)]
pub struct DurabilityGuarantee {
    level: DurabilityLevel,
    interval: Duration,
    last_checkpoint: Option<Instant>,
}

impl DurabilityGuarantee {
    /// Cadence for `level`, scaled by the hardware profile.
    #[must_use]
    pub fn new(level: DurabilityLevel, profile: HardwareProfile) -> Self {
        let interval = level
            .base_interval()
            .mul_f64(profile.checkpoint_interval_scale());
        Self {
            level,
            interval,
            last_checkpoint: None,
        }
    }

    /// Override the computed interval.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Configured level.
    #[must_use]
    pub fn level(&self) -> DurabilityLevel {
        self.level
    }

    /// Effective checkpoint interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a checkpoint is due, claiming the slot if so.
    ///
    /// True when no checkpoint has been taken yet or the interval has
    /// elapsed since the last one. A `true` answer records the current
    /// instant as the last checkpoint, so an immediate second call within
    /// the interval returns `false`.
    pub fn should_checkpoint(&mut self) -> bool {
        let due = self
            .last_checkpoint
            .is_none_or(|last| last.elapsed() >= self.interval);
        if due {
            self.last_checkpoint = Some(Instant::now());
        }
        due
    }

    /// Record a checkpoint taken outside the cadence (forced or explicit).
    pub fn mark_checkpointed(&mut self) {
        self.last_checkpoint = Some(Instant::now());
    }

    /// Time since the last checkpoint, if any.
    #[must_use]
    pub fn since_last(&self) -> Option<Duration> {
        self.last_checkpoint.map(|last| last.elapsed())
    }
}

/// Copy every existing artifact into `backup_root/<task_id>/<label>/`.
///
/// Artifact paths are resolved against `project_root`. Missing artifacts
/// are logged and skipped. Returns the paths written.
///
/// # Errors
///
/// Returns `AppError::Io` if the backup directory cannot be created or a
/// copy fails.
pub fn backup_artifacts(
    task_id: &str,
    label: &str,
    artifacts: &[String],
    project_root: &Path,
    backup_root: &Path,
) -> Result<Vec<PathBuf>> {
    let target_dir = backup_root.join(task_id).join(label);
    fs::create_dir_all(&target_dir).map_err(|err| {
        AppError::Io(format!(
            "cannot create backup directory {}: {err}",
            target_dir.display()
        ))
    })?;

    let mut written = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let source = project_root.join(artifact);
        if !source.is_file() {
            warn!(task_id, artifact, "artifact missing, skipping backup");
            continue;
        }
        // Flatten the relative path so nested artifacts cannot collide.
        let flat_name = artifact.replace(['/', '\\'], "__");
        let dest = target_dir.join(flat_name);
        fs::copy(&source, &dest).map_err(|err| {
            AppError::Io(format!(
                "cannot back up {} to {}: {err}",
                source.display(),
                dest.display()
            ))
        })?;
        debug!(task_id, artifact, "artifact backed up");
        written.push(dest);
    }

    info!(task_id, label, copied = written.len(), "artifact backup complete");
    Ok(written)
}
