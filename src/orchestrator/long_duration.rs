//! Top-level supervisor for long-running tasks.
//!
//! [`LongDurationOrchestrator`] owns one map of in-flight tasks behind a
//! single mutex. The foreground API and the background checkpoint loop both
//! go through that map. Checkpoint writes happen while the lock is held so
//! per-task checkpoint times reach the store in increasing order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::durability::{backup_artifacts, DurabilityGuarantee, DurabilityLevel};
use super::progress::ProgressTracker;
use super::recovery::{recovery_strategy, FailureRecovery};
use super::resume::ResumePlan;
use super::session_manager::SessionManager;
use crate::config::GlobalConfig;
use crate::hardware::HardwareProfile;
use crate::models::checkpoint::{clamp_progress, TaskCheckpoint, RESERVED_CONTEXT_KEY};
use crate::models::failure::{FailureRecord, FailureType};
use crate::models::progress::ProgressSnapshot;
use crate::models::session::SessionState;
use crate::models::task_state::{TaskState, TaskStateMachine};
use crate::persistence::checkpoint_store::CheckpointStore;
use crate::persistence::validate_key;
use crate::{AppError, Result};

/// A progress report from the task runner.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    /// Fraction complete; clamped to `[0, 1]`.
    pub progress: f64,
    /// Human-readable name of the current step.
    pub current_step: String,
    /// Steps finished so far.
    pub steps_completed: u64,
    /// Total planned steps.
    pub total_steps: u64,
    /// Caller's own ETA; derived from velocity when absent.
    pub estimated_remaining_hours: Option<f64>,
    /// Context entries merged into the task's context.
    pub context: Option<Map<String, Value>>,
    /// Artifacts produced since the last update.
    pub artifacts: Vec<String>,
    /// Write a checkpoint regardless of cadence.
    pub force_checkpoint: bool,
}

impl ProgressUpdate {
    /// Update carrying only a progress fraction.
    #[must_use]
    pub fn new(progress: f64) -> Self {
        Self {
            progress,
            ..Self::default()
        }
    }

    /// Set the current step and step counters.
    #[must_use]
    pub fn step(mut self, name: impl Into<String>, completed: u64, total: u64) -> Self {
        self.current_step = name.into();
        self.steps_completed = completed;
        self.total_steps = total;
        self
    }

    /// Merge these entries into the task context.
    #[must_use]
    pub fn with_context(mut self, context: Map<String, Value>) -> Self {
        self.context = Some(context);
        self
    }

    /// Record produced artifacts.
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }

    /// Force a checkpoint for this update.
    #[must_use]
    pub fn forced(mut self) -> Self {
        self.force_checkpoint = true;
        self
    }
}

/// What an accepted progress update produced.
#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    /// The journaled snapshot.
    pub snapshot: ProgressSnapshot,
    /// Checkpoint written for this update, if one was due or forced.
    pub checkpoint: Option<TaskCheckpoint>,
}

/// Result of handling a failure.
#[derive(Debug, Clone)]
pub struct RecoveryOutcome {
    /// The failure as recorded, with recovery flags set.
    pub failure: FailureRecord,
    /// Checkpoint to resume from, if any.
    pub checkpoint: Option<TaskCheckpoint>,
    /// Recovery plan for the failure type.
    pub strategy: &'static str,
}

/// Point-in-time view of a supervised task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatus {
    /// Task id.
    pub task_id: String,
    /// Owning agent.
    pub agent_id: String,
    /// Session tracking this run.
    pub session_id: String,
    /// Current state-machine state.
    pub state: TaskState,
    /// Last reported progress.
    pub progress: f64,
    /// Last reported step.
    pub current_step: String,
    /// Progress per hour, when computable.
    pub velocity: Option<f64>,
    /// Newest ETA.
    pub estimated_remaining_hours: Option<f64>,
    /// Time of the last checkpoint written.
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    /// Cadence level.
    pub durability_level: DurabilityLevel,
}

struct ActiveTask {
    machine: TaskStateMachine,
    session_id: String,
    agent_id: String,
    command: String,
    context: Map<String, Value>,
    artifacts: Vec<String>,
    progress: f64,
    current_step: String,
    durability: DurabilityGuarantee,
    tracker: ProgressTracker,
    last_checkpoint_time: Option<DateTime<Utc>>,
}

/// Initial state for a task entering supervision.
struct Launch<'a> {
    task_id: &'a str,
    agent_id: &'a str,
    command: &'a str,
    machine: TaskStateMachine,
    context: Map<String, Value>,
    artifacts: Vec<String>,
    progress: f64,
    resumed: bool,
}

struct CheckpointLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Supervises tasks with cadence checkpoints, progress tracking, and recovery.
pub struct LongDurationOrchestrator {
    store: CheckpointStore,
    sessions: Arc<SessionManager>,
    recovery: FailureRecovery,
    profile: HardwareProfile,
    level: DurabilityLevel,
    checkpoint_interval: Option<Duration>,
    loop_interval: Duration,
    stop_timeout: Duration,
    project_root: PathBuf,
    backup_dir: PathBuf,
    progress_dir: PathBuf,
    progress_history: usize,
    tasks: Mutex<HashMap<String, ActiveTask>>,
    checkpoint_loop: Mutex<Option<CheckpointLoop>>,
}

impl LongDurationOrchestrator {
    /// Orchestrator persisting under the directories named by `config`.
    #[must_use]
    pub fn new(
        config: &GlobalConfig,
        profile: HardwareProfile,
        store: CheckpointStore,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let recovery = FailureRecovery::new(store.clone(), Arc::clone(&sessions), &config.failure_dir());
        Self {
            store,
            sessions,
            recovery,
            profile,
            level: config.durability.level,
            checkpoint_interval: None,
            loop_interval: Duration::from_secs(config.durability.loop_interval_seconds.max(1)),
            stop_timeout: Duration::from_secs(config.durability.stop_timeout_seconds),
            project_root: config.project_root.clone(),
            backup_dir: config.backup_dir(),
            progress_dir: config.progress_dir(),
            progress_history: config.durability.progress_history,
            tasks: Mutex::new(HashMap::new()),
            checkpoint_loop: Mutex::new(None),
        }
    }

    /// Override the cadence interval for every task started afterwards.
    #[must_use]
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = Some(interval);
        self
    }

    /// Override the background loop tick.
    #[must_use]
    pub fn with_loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    /// Failure recovery policy in use.
    #[must_use]
    pub fn recovery(&self) -> &FailureRecovery {
        &self.recovery
    }

    /// Session manager in use.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Begin supervising a task.
    ///
    /// Creates a session, moves the task to `Running`, writes an initial
    /// zero-progress checkpoint, and starts the background checkpoint loop
    /// if a tokio runtime is available.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the task is already supervised,
    /// or any persistence error from the session or checkpoint write.
    pub fn start(
        self: &Arc<Self>,
        task_id: &str,
        agent_id: &str,
        command: &str,
        context: Option<Map<String, Value>>,
    ) -> Result<TaskCheckpoint> {
        let span = info_span!("task_start", task_id, agent_id);
        let _guard = span.enter();

        let mut machine = TaskStateMachine::new(task_id);
        machine.transition(TaskState::Running, Some("task started"), None)?;
        self.begin(Launch {
            task_id,
            agent_id,
            command,
            machine,
            context: context.unwrap_or_default(),
            artifacts: Vec::new(),
            progress: 0.0,
            resumed: false,
        })
    }

    /// Continue supervising a task from a prepared resume plan.
    ///
    /// The task keeps the plan's progress, context, artifacts, and state
    /// history. The reserved checkpoint key is not carried into the context.
    ///
    /// # Errors
    ///
    /// Same as [`start`](Self::start).
    pub fn resume_from(self: &Arc<Self>, plan: &ResumePlan) -> Result<TaskCheckpoint> {
        let task_id = plan.checkpoint.task_id.as_str();
        let span = info_span!("task_resume", task_id, agent_id = %plan.agent_id);
        let _guard = span.enter();

        let mut context = plan.restored_context.clone();
        context.remove(RESERVED_CONTEXT_KEY);
        self.begin(Launch {
            task_id,
            agent_id: &plan.agent_id,
            command: &plan.command,
            machine: plan.state_machine.clone(),
            context,
            artifacts: plan.checkpoint.artifacts.clone(),
            progress: plan.progress,
            resumed: true,
        })
    }

    /// Record progress and checkpoint if forced or due.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for an unknown task,
    /// `AppError::InvalidState` unless the task is `Running`, or any
    /// persistence error.
    pub fn update_progress(&self, task_id: &str, update: ProgressUpdate) -> Result<ProgressOutcome> {
        let span = info_span!("progress_update", task_id, progress = update.progress);
        let _guard = span.enter();

        let mut tasks = self.lock()?;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        if task.machine.state() != TaskState::Running {
            return Err(AppError::InvalidState(format!(
                "task {task_id} is {}, progress requires running",
                task.machine.state()
            )));
        }

        let snapshot = task.tracker.record(
            update.progress,
            &update.current_step,
            update.steps_completed,
            update.total_steps,
            update.estimated_remaining_hours,
        )?;
        task.progress = snapshot.progress;
        task.current_step = update.current_step;
        if let Some(context) = update.context {
            task.context.extend(context);
        }
        for artifact in update.artifacts {
            if !task.artifacts.contains(&artifact) {
                task.artifacts.push(artifact);
            }
        }

        let due = if update.force_checkpoint {
            task.durability.mark_checkpointed();
            true
        } else {
            task.durability.should_checkpoint()
        };
        let checkpoint = if due {
            Some(self.cadence_checkpoint(task_id, task)?)
        } else {
            None
        };
        let session_id = task.session_id.clone();
        drop(tasks);

        if checkpoint.is_none() {
            self.sessions.record_activity(&session_id)?;
        }
        Ok(ProgressOutcome {
            snapshot,
            checkpoint,
        })
    }

    /// Record a failure and look for a checkpoint to recover from.
    ///
    /// A supervised `Running` task moves to `Failed`. When recovery finds a
    /// checkpoint the owning session gains it, if it does not hold it already.
    ///
    /// # Errors
    ///
    /// Returns persistence errors from the failure journal or session store.
    pub fn handle_failure(
        &self,
        task_id: &str,
        failure_type: FailureType,
        message: &str,
        stack_trace: Option<&str>,
    ) -> Result<RecoveryOutcome> {
        let span = info_span!("handle_failure", task_id, failure_type = %failure_type);
        let _guard = span.enter();

        let (agent_id, session_id) = {
            let mut tasks = self.lock()?;
            match tasks.get_mut(task_id) {
                Some(task) => {
                    if task.machine.can_transition(TaskState::Failed) {
                        task.machine
                            .transition(TaskState::Failed, Some(message), None)?;
                    }
                    (Some(task.agent_id.clone()), Some(task.session_id.clone()))
                }
                None => (None, None),
            }
        };

        self.recovery
            .record_failure(failure_type, message, stack_trace, Some(task_id))?;
        let checkpoint = self.recovery.recover(task_id, agent_id.as_deref())?;

        if let (Some(checkpoint), Some(session_id)) = (&checkpoint, &session_id) {
            let held = self
                .sessions
                .get(session_id)
                .is_some_and(|session| {
                    session
                        .checkpoints
                        .iter()
                        .any(|cp| cp.checksum == checkpoint.checksum)
                });
            if held {
                self.sessions.record_activity(session_id)?;
            } else {
                self.sessions.add_checkpoint(session_id, checkpoint.clone())?;
            }
        }

        let failure = self
            .recovery
            .failures(Some(task_id))
            .pop()
            .ok_or_else(|| AppError::InvalidState(format!("failure for {task_id} not retained")))?;
        Ok(RecoveryOutcome {
            failure,
            checkpoint,
            strategy: recovery_strategy(failure_type),
        })
    }

    /// Pause a task, writing a `Paused` checkpoint and pausing its session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` if the task cannot pause from
    /// its current state.
    pub fn pause_task(&self, task_id: &str, reason: &str) -> Result<TaskCheckpoint> {
        let span = info_span!("task_pause", task_id);
        let _guard = span.enter();

        let mut tasks = self.lock()?;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        task.machine.transition(TaskState::Paused, Some(reason), None)?;
        let checkpoint = self.write_checkpoint(task_id, task)?;
        task.durability.mark_checkpointed();
        let session_id = task.session_id.clone();
        drop(tasks);

        // The executor or the session monitor may have paused it already.
        let pausable = self.sessions.get(&session_id).is_some_and(|session| {
            matches!(session.state, SessionState::Active | SessionState::Suspended)
        });
        if pausable {
            self.sessions.pause(&session_id, Some(reason))?;
        } else {
            self.sessions.record_activity(&session_id)?;
        }
        Ok(checkpoint)
    }

    /// Return a paused or failed task to `Running`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the task is not resumable.
    pub fn resume_task(&self, task_id: &str) -> Result<TaskState> {
        let mut tasks = self.lock()?;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        let path = task.machine.state().resume_path().ok_or_else(|| {
            AppError::InvalidState(format!(
                "task {task_id} cannot resume from {}",
                task.machine.state()
            ))
        })?;
        for next in path {
            task.machine.transition(*next, Some("task resumed"), None)?;
        }
        let session_id = task.session_id.clone();
        drop(tasks);

        if let Some(session) = self.sessions.get(&session_id) {
            if session.state == SessionState::Paused {
                self.sessions.resume(&session_id, Some("task resumed"))?;
            }
        }
        info!(task_id, "task resumed");
        Ok(TaskState::Running)
    }

    /// Finish a task: final checkpoint at full progress, session completed.
    ///
    /// The task is no longer supervised afterwards.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` unless the task is `Running`.
    pub fn complete(&self, task_id: &str) -> Result<TaskCheckpoint> {
        let span = info_span!("task_complete", task_id);
        let _guard = span.enter();

        let mut tasks = self.lock()?;
        let task = tasks
            .get_mut(task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        task.machine
            .transition(TaskState::Completed, Some("task completed"), None)?;
        task.progress = 1.0;
        let checkpoint = self.write_checkpoint(task_id, task)?;
        let session_id = task.session_id.clone();
        tasks.remove(task_id);
        drop(tasks);

        self.sessions.complete(&session_id)?;
        info!("task completed");
        Ok(checkpoint)
    }

    /// Current view of a supervised task.
    #[must_use]
    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        let tasks = self.lock().ok()?;
        let task = tasks.get(task_id)?;
        Some(TaskStatus {
            task_id: task_id.to_owned(),
            agent_id: task.agent_id.clone(),
            session_id: task.session_id.clone(),
            state: task.machine.state(),
            progress: task.progress,
            current_step: task.current_step.clone(),
            velocity: task.tracker.velocity(),
            estimated_remaining_hours: task
                .tracker
                .latest()
                .and_then(|snapshot| snapshot.estimated_remaining_hours),
            last_checkpoint_time: task.last_checkpoint_time,
            durability_level: task.durability.level(),
        })
    }

    /// Ids of supervised tasks, sorted.
    #[must_use]
    pub fn active_tasks(&self) -> Vec<String> {
        let Ok(tasks) = self.lock() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Checkpoint every running task whose cadence interval has elapsed.
    ///
    /// Returns how many checkpoints were written. Per-task failures are
    /// logged and skipped.
    pub fn checkpoint_due(&self) -> usize {
        let Ok(mut tasks) = self.lock() else {
            warn!("task map unavailable, skipping checkpoint pass");
            return 0;
        };
        let mut written = 0;
        for (task_id, task) in tasks.iter_mut() {
            if task.machine.state() != TaskState::Running || !task.durability.should_checkpoint() {
                continue;
            }
            match self.cadence_checkpoint(task_id, task) {
                Ok(_) => written += 1,
                Err(err) => warn!(%task_id, %err, "background checkpoint failed"),
            }
        }
        written
    }

    /// Stop the background loop, waiting at most the configured timeout.
    ///
    /// Returns `false` when the stop was requested but not confirmed in time.
    pub async fn stop(&self) -> bool {
        let running = match self.checkpoint_loop.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(running) = running else {
            return true;
        };

        running.cancel.cancel();
        if tokio::time::timeout(self.stop_timeout, running.handle).await.is_ok() {
            info!("checkpoint loop stopped");
            true
        } else {
            warn!("checkpoint loop stop requested, completion unconfirmed");
            false
        }
    }

    /// Register a running task, write its first checkpoint, and start the loop.
    ///
    /// A fresh start empties the task's progress journal; a resume reloads it.
    /// The session is marked failed if the first checkpoint cannot be written.
    fn begin(self: &Arc<Self>, launch: Launch<'_>) -> Result<TaskCheckpoint> {
        let task_id = launch.task_id;
        validate_key("task", task_id)?;
        let mut tasks = self.lock()?;
        if tasks.contains_key(task_id) {
            return Err(AppError::InvalidState(format!(
                "task {task_id} is already supervised"
            )));
        }

        let tracker = if launch.resumed {
            ProgressTracker::new(task_id, &self.progress_dir, self.progress_history)
        } else {
            ProgressTracker::fresh(task_id, &self.progress_dir, self.progress_history)?
        };

        let mut durability = DurabilityGuarantee::new(self.level, self.profile);
        if let Some(interval) = self.checkpoint_interval {
            durability = durability.with_interval(interval);
        }

        let mut metadata = Map::new();
        metadata.insert("task_id".into(), Value::String(task_id.to_owned()));
        metadata.insert("command".into(), Value::String(launch.command.to_owned()));
        let session_id = self.sessions.create(launch.agent_id, metadata)?.session_id;

        let mut task = ActiveTask {
            machine: launch.machine,
            session_id: session_id.clone(),
            agent_id: launch.agent_id.to_owned(),
            command: launch.command.to_owned(),
            context: launch.context,
            artifacts: launch.artifacts,
            progress: clamp_progress(launch.progress),
            current_step: String::new(),
            durability,
            tracker,
            last_checkpoint_time: self.store.load(task_id).map(|cp| cp.checkpoint_time),
        };

        let checkpoint = match self.cadence_checkpoint(task_id, &mut task) {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                drop(tasks);
                if let Err(fail_err) = self.sessions.fail(&session_id, "initial checkpoint failed") {
                    warn!(%session_id, %fail_err, "could not mark session failed");
                }
                return Err(err);
            }
        };
        task.durability.mark_checkpointed();
        tasks.insert(task_id.to_owned(), task);
        drop(tasks);

        self.ensure_loop()?;
        info!(%session_id, progress = checkpoint.progress, "task supervised");
        Ok(checkpoint)
    }

    fn ensure_loop(self: &Arc<Self>) -> Result<()> {
        let mut slot = self
            .checkpoint_loop
            .lock()
            .map_err(|_| AppError::InvalidState("checkpoint loop mutex poisoned".into()))?;
        if slot.is_some() {
            return Ok(());
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("no async runtime, background checkpoints disabled");
            return Ok(());
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let orchestrator = Arc::clone(self);
        let interval = self.loop_interval;
        let handle = runtime.spawn(
            async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!("checkpoint loop cancelled");
                            break;
                        }
                        () = tokio::time::sleep(interval) => {}
                    }
                    let written = orchestrator.checkpoint_due();
                    if written > 0 {
                        debug!(written, "cadence checkpoints written");
                    }
                }
            }
            .instrument(info_span!("checkpoint_loop")),
        );

        *slot = Some(CheckpointLoop { cancel, handle });
        info!(interval_secs = interval.as_secs(), "checkpoint loop started");
        Ok(())
    }

    /// Cycle `Running -> Checkpointed -> Running` around a checkpoint write.
    fn cadence_checkpoint(&self, task_id: &str, task: &mut ActiveTask) -> Result<TaskCheckpoint> {
        task.machine
            .transition(TaskState::Checkpointed, Some("checkpoint"), None)?;
        let written = self.write_checkpoint(task_id, task);
        task.machine
            .transition(TaskState::Running, Some("checkpoint written"), None)?;
        written
    }

    /// Persist the task's current state and attach it to the session.
    fn write_checkpoint(&self, task_id: &str, task: &mut ActiveTask) -> Result<TaskCheckpoint> {
        let now = Utc::now();
        let time = match task.last_checkpoint_time {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };

        let mut metadata = Map::new();
        metadata.insert("session_id".into(), Value::String(task.session_id.clone()));
        metadata.insert("current_step".into(), Value::String(task.current_step.clone()));
        metadata.insert(
            "durability_level".into(),
            serde_json::to_value(task.durability.level())?,
        );

        let mut checkpoint = TaskCheckpoint::new(
            task_id,
            task.agent_id.clone(),
            task.command.clone(),
            task.machine.state(),
            clamp_progress(task.progress),
        )
        .with_context(task.context.clone())
        .with_artifacts(task.artifacts.clone())
        .with_metadata(metadata)
        .at(time);

        self.store.save(&mut checkpoint)?;
        task.last_checkpoint_time = Some(checkpoint.checkpoint_time);

        if task.durability.level().backs_up_artifacts() && !task.artifacts.is_empty() {
            let label = checkpoint.checkpoint_time.format("%Y%m%dT%H%M%S%6fZ").to_string();
            if let Err(err) = backup_artifacts(
                task_id,
                &label,
                &task.artifacts,
                &self.project_root,
                &self.backup_dir,
            ) {
                warn!(task_id, %err, "artifact backup failed");
            }
        }

        self.sessions
            .add_checkpoint(&task.session_id, checkpoint.clone())?;
        Ok(checkpoint)
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, ActiveTask>>> {
        self.tasks
            .lock()
            .map_err(|_| AppError::InvalidState("task map mutex poisoned".into()))
    }
}
