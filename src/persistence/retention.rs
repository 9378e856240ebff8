//! Retention service for time-based data purge.
//!
//! Runs as a background task deleting terminal sessions whose last activity
//! predates the session window, then checkpoints older than the checkpoint
//! window.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};

use super::checkpoint_store::CheckpointStore;
use crate::config::RetentionConfig;
use crate::orchestrator::session_manager::SessionManager;
use crate::Result;

/// Counts from one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Sessions deleted.
    pub sessions: usize,
    /// Checkpoints deleted.
    pub checkpoints: usize,
}

/// Spawn the retention purge background task.
///
/// The first purge runs immediately, then once per
/// `purge_interval_seconds` until `cancel` fires.
#[must_use]
pub fn spawn_retention_task(
    sessions: Arc<SessionManager>,
    store: CheckpointStore,
    config: RetentionConfig,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = Duration::from_secs(config.purge_interval_seconds.max(1));
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("retention task shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        if let Err(err) = purge(&sessions, &store, &config) {
                            error!(%err, "retention purge failed");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("retention")),
    )
}

/// Run one purge pass.
///
/// # Errors
///
/// Returns `AppError::Io` if an expired file cannot be removed.
pub fn purge(
    sessions: &SessionManager,
    store: &CheckpointStore,
    config: &RetentionConfig,
) -> Result<PurgeReport> {
    let report = PurgeReport {
        sessions: sessions.cleanup(config.session_max_age_hours)?,
        checkpoints: store.cleanup(config.checkpoint_max_age_hours)?,
    };
    info!(
        sessions = report.sessions,
        checkpoints = report.checkpoints,
        "retention purge completed"
    );
    Ok(report)
}
