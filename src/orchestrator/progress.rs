//! Per-task progress tracking with a JSONL journal.

use std::collections::VecDeque;
use std::path::Path;

use chrono::Utc;
use tracing::debug;

use crate::models::checkpoint::clamp_progress;
use crate::models::progress::ProgressSnapshot;
use crate::persistence::journal::JsonlJournal;
use crate::Result;

/// Records progress snapshots, persisting each and keeping a bounded tail in memory.
pub struct ProgressTracker {
    task_id: String,
    journal: JsonlJournal<ProgressSnapshot>,
    snapshots: VecDeque<ProgressSnapshot>,
    capacity: usize,
}

impl ProgressTracker {
    /// Tracker journaling to `<dir>/progress-<task_id>.jsonl`.
    ///
    /// Previously journaled snapshots are reloaded so velocity survives restarts.
    #[must_use]
    pub fn new(task_id: impl Into<String>, dir: &Path, capacity: usize) -> Self {
        let task_id = task_id.into();
        let journal = JsonlJournal::new(dir.join(format!("progress-{task_id}.jsonl")));
        let capacity = capacity.max(2);
        let mut snapshots: VecDeque<ProgressSnapshot> = journal.read_all().into();
        while snapshots.len() > capacity {
            snapshots.pop_front();
        }
        Self {
            task_id,
            journal,
            snapshots,
            capacity,
        }
    }

    /// Tracker for a new run: any journal left by an earlier run is emptied.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the journal cannot be truncated.
    pub fn fresh(task_id: impl Into<String>, dir: &Path, capacity: usize) -> Result<Self> {
        let task_id = task_id.into();
        let journal = JsonlJournal::new(dir.join(format!("progress-{task_id}.jsonl")));
        journal.replace_all(&[])?;
        Ok(Self {
            task_id,
            journal,
            snapshots: VecDeque::new(),
            capacity: capacity.max(2),
        })
    }

    /// Append a snapshot and persist it.
    ///
    /// When `eta_hours` is `None` an estimate is derived from the current
    /// velocity, if one can be computed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the journal write fails; the snapshot is
    /// not retained in that case.
    pub fn record(
        &mut self,
        progress: f64,
        step: &str,
        completed: u64,
        total: u64,
        eta_hours: Option<f64>,
    ) -> Result<ProgressSnapshot> {
        let progress = clamp_progress(progress);
        let mut snapshot = ProgressSnapshot {
            timestamp: Utc::now(),
            progress,
            current_step: step.to_owned(),
            steps_completed: completed,
            total_steps: total,
            estimated_remaining_hours: eta_hours,
        };

        if snapshot.estimated_remaining_hours.is_none() {
            snapshot.estimated_remaining_hours = self.estimate_remaining(&snapshot);
        }

        self.journal.append(&snapshot)?;
        self.snapshots.push_back(snapshot.clone());
        while self.snapshots.len() > self.capacity {
            self.snapshots.pop_front();
        }

        debug!(
            task_id = %self.task_id,
            progress,
            step,
            completed,
            total,
            "progress recorded"
        );
        Ok(snapshot)
    }

    /// Progress per hour between the oldest and newest retained snapshots.
    ///
    /// Requires at least two snapshots and a positive time span.
    #[must_use]
    pub fn velocity(&self) -> Option<f64> {
        let first = self.snapshots.front()?;
        let last = self.snapshots.back()?;
        velocity_between(first, last)
    }

    /// Newest snapshot.
    #[must_use]
    pub fn latest(&self) -> Option<&ProgressSnapshot> {
        self.snapshots.back()
    }

    /// Retained snapshots, oldest first.
    #[must_use]
    pub fn snapshots(&self) -> &VecDeque<ProgressSnapshot> {
        &self.snapshots
    }

    fn estimate_remaining(&self, next: &ProgressSnapshot) -> Option<f64> {
        let first = self.snapshots.front()?;
        let rate = velocity_between(first, next)?;
        (rate > 0.0).then(|| (1.0 - next.progress).max(0.0) / rate)
    }
}

#[allow(clippy::cast_precision_loss)]
fn velocity_between(first: &ProgressSnapshot, last: &ProgressSnapshot) -> Option<f64> {
    let millis = (last.timestamp - first.timestamp).num_milliseconds();
    if millis <= 0 {
        return None;
    }
    let hours = millis as f64 / 3_600_000.0;
    Some((last.progress - first.progress) / hours)
}
