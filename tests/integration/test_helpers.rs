//! Shared test helpers for orchestration-level integration tests.
//!
//! Every harness lives in its own temporary directory so tests can run in
//! parallel without sharing checkpoint or session files.

use std::path::PathBuf;
use std::sync::Arc;

use longhaul::config::GlobalConfig;
use longhaul::hardware::HardwareProfile;
use longhaul::models::checkpoint::TaskCheckpoint;
use longhaul::models::task_state::TaskState;
use longhaul::orchestrator::long_duration::LongDurationOrchestrator;
use longhaul::orchestrator::session_manager::{SessionManager, SessionMonitor};
use longhaul::persistence::checkpoint_store::CheckpointStore;
use longhaul::persistence::session_store::SessionStore;
use tempfile::TempDir;

/// Isolated data directory plus the stores built on it.
pub struct Harness {
    /// Keeps the directory alive for the test's duration.
    pub dir: TempDir,
    /// Configuration pointing at `dir`.
    pub config: GlobalConfig,
    /// Checkpoint store under `dir`.
    pub store: CheckpointStore,
    /// Session manager without a resource monitor.
    pub sessions: Arc<SessionManager>,
}

impl Harness {
    /// Directory artifact paths resolve against.
    pub fn project_root(&self) -> PathBuf {
        self.config.project_root.clone()
    }

    /// Fresh session manager over the same session directory.
    pub fn reopen_sessions(&self) -> Arc<SessionManager> {
        Arc::new(session_manager(&self.config))
    }
}

/// Build a harness with default settings.
pub fn harness() -> Harness {
    harness_with(|_| {})
}

/// Build a harness, letting the caller adjust the configuration first.
pub fn harness_with(adjust: impl FnOnce(&mut GlobalConfig)) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = GlobalConfig {
        data_dir: dir.path().join("data"),
        project_root: dir.path().join("project"),
        ..GlobalConfig::default()
    };
    adjust(&mut config);
    std::fs::create_dir_all(&config.project_root).expect("project root");

    let store = CheckpointStore::new(config.checkpoint_dir(), HardwareProfile::Standard)
        .expect("checkpoint store");
    let sessions = Arc::new(session_manager(&config));
    Harness {
        dir,
        config,
        store,
        sessions,
    }
}

/// Orchestrator over the harness stores.
///
/// Plain `#[test]` functions have no tokio runtime, so no background
/// checkpoint loop is started and cadence is driven by the test alone.
pub fn orchestrator(harness: &Harness) -> Arc<LongDurationOrchestrator> {
    Arc::new(LongDurationOrchestrator::new(
        &harness.config,
        HardwareProfile::Standard,
        harness.store.clone(),
        Arc::clone(&harness.sessions),
    ))
}

/// Sealed checkpoint for `task_id` owned by `agent`.
pub fn sealed(
    task_id: &str,
    agent: &str,
    state: TaskState,
    progress: f64,
    at: chrono::DateTime<chrono::Utc>,
) -> TaskCheckpoint {
    let mut checkpoint = TaskCheckpoint::new(task_id, agent, "train --epochs 40", state, progress)
        .at(at);
    checkpoint.seal().expect("seal");
    checkpoint
}

fn session_manager(config: &GlobalConfig) -> SessionManager {
    let store = SessionStore::new(config.session_dir()).expect("session store");
    SessionManager::new(store, SessionMonitor::new(None))
        .with_checkpoint_limit(config.durability.session_checkpoint_limit)
}
