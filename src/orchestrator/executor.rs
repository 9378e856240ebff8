//! Resource-aware task execution with auto-pause and degradation.
//!
//! [`ResourceAwareExecutor::execute`] samples the host before running a
//! task and refuses to start it while resources are exhausted. A background
//! loop (started with [`ResourceAwareExecutor::start_monitoring`]) keeps
//! sampling so a paused executor can resume once pressure falls below the
//! recovery thresholds. Running tasks are never preempted.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ExecutorConfig;
use crate::hardware::HardwareProfile;
use crate::models::metrics::ResourceMetrics;
use crate::monitor::ResourceMonitor;
use crate::{AppError, Result};

/// Operating mode of the executor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Tasks run normally.
    Normal,
    /// Tasks run, but callers should reduce their footprint.
    Degraded,
    /// New tasks are rejected until resources recover.
    Paused,
    /// New tasks are rejected until an operator resumes the executor.
    Suspended,
}

/// Hard-threshold pause policy with hysteresis on resume.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoPausePolicy {
    cpu_threshold: f64,
    memory_threshold: f64,
    disk_threshold: f64,
    cpu_resume: f64,
    memory_resume: f64,
    paused: bool,
}

impl AutoPausePolicy {
    /// Policy pausing above the given thresholds and resuming below the recovery ones.
    #[must_use]
    pub fn new(
        cpu_threshold: f64,
        memory_threshold: f64,
        disk_threshold: f64,
        cpu_resume: f64,
        memory_resume: f64,
    ) -> Self {
        Self {
            cpu_threshold,
            memory_threshold,
            disk_threshold,
            cpu_resume,
            memory_resume,
            paused: false,
        }
    }

    /// Policy from executor configuration.
    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(
            config.pause_cpu,
            config.pause_memory,
            config.pause_disk,
            config.resume_cpu,
            config.resume_memory,
        )
    }

    /// Whether any resource exceeds its pause threshold.
    ///
    /// A positive answer latches the policy into the paused state.
    pub fn should_pause(&mut self, metrics: &ResourceMetrics) -> (bool, Option<String>) {
        let reason = if metrics.cpu_percent > self.cpu_threshold {
            Some(format!(
                "cpu {:.1}% above pause threshold {:.1}%",
                metrics.cpu_percent, self.cpu_threshold
            ))
        } else if metrics.memory_percent > self.memory_threshold {
            Some(format!(
                "memory {:.1}% above pause threshold {:.1}%",
                metrics.memory_percent, self.memory_threshold
            ))
        } else if metrics.disk_percent > self.disk_threshold {
            Some(format!(
                "disk {:.1}% above pause threshold {:.1}%",
                metrics.disk_percent, self.disk_threshold
            ))
        } else {
            None
        };

        if reason.is_some() {
            self.paused = true;
        }
        (reason.is_some(), reason)
    }

    /// True only while paused and both CPU and memory are below recovery thresholds.
    #[must_use]
    pub fn should_resume(&self, metrics: &ResourceMetrics) -> bool {
        self.paused
            && metrics.cpu_percent < self.cpu_resume
            && metrics.memory_percent < self.memory_resume
    }

    /// Whether the policy is latched paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Release the pause latch.
    pub fn clear(&mut self) {
        self.paused = false;
    }
}

/// Soft-threshold degradation policy, independent of pausing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DegradationPolicy {
    cpu_threshold: f64,
    memory_threshold: f64,
}

impl DegradationPolicy {
    /// Policy degrading above the given CPU and memory percentages.
    #[must_use]
    pub fn new(cpu_threshold: f64, memory_threshold: f64) -> Self {
        Self {
            cpu_threshold,
            memory_threshold,
        }
    }

    /// Policy from executor configuration.
    #[must_use]
    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.degrade_cpu, config.degrade_memory)
    }

    /// Whether CPU or memory exceeds its degradation threshold.
    #[must_use]
    pub fn should_degrade(&self, metrics: &ResourceMetrics) -> (bool, Option<String>) {
        if metrics.cpu_percent > self.cpu_threshold {
            (
                true,
                Some(format!(
                    "cpu {:.1}% above degrade threshold {:.1}%",
                    metrics.cpu_percent, self.cpu_threshold
                )),
            )
        } else if metrics.memory_percent > self.memory_threshold {
            (
                true,
                Some(format!(
                    "memory {:.1}% above degrade threshold {:.1}%",
                    metrics.memory_percent, self.memory_threshold
                )),
            )
        } else {
            (false, None)
        }
    }
}

/// Thresholds adjusted for the host's hardware profile.
///
/// Constrained hosts degrade and pause earlier; high-capacity hosts relax
/// both. Recovery thresholds are kept below the adjusted pause thresholds.
#[must_use]
pub fn tuned_for_profile(config: &ExecutorConfig, profile: HardwareProfile) -> ExecutorConfig {
    let mut tuned = config.clone();
    match profile {
        HardwareProfile::Constrained => {
            tuned.degrade_cpu = 60.0;
            tuned.degrade_memory = 70.0;
            tuned.pause_cpu = 80.0;
            tuned.pause_memory = 85.0;
        }
        HardwareProfile::HighCapacity => {
            tuned.degrade_cpu = 85.0;
            tuned.degrade_memory = 88.0;
            tuned.pause_cpu = 95.0;
            tuned.pause_memory = 95.0;
        }
        HardwareProfile::Development | HardwareProfile::Standard => {}
    }
    tuned.resume_cpu = tuned.resume_cpu.min(tuned.pause_cpu - 5.0);
    tuned.resume_memory = tuned.resume_memory.min(tuned.pause_memory - 5.0);
    tuned
}

/// Collaborator able to pause the sessions the executor is serving.
///
/// Pausing is best-effort; failures are logged by the executor.
pub trait SessionPauser: Send + Sync {
    /// Ids of sessions currently active.
    fn list_active_sessions(&self) -> Pin<Box<dyn Future<Output = Vec<String>> + Send + '_>>;

    /// Pause one session.
    ///
    /// # Errors
    ///
    /// Implementations return an error if the session cannot be paused.
    fn pause_session<'a>(
        &'a self,
        session_id: &'a str,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Kind of mode change recorded in the executor's alert log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorEvent {
    /// Execution paused by resource pressure.
    Paused,
    /// Execution resumed after recovery.
    Resumed,
    /// Execution entered degraded mode.
    Degraded,
    /// Execution left degraded mode.
    Restored,
    /// Operator suspended execution.
    Suspended,
}

/// Entry in the executor's bounded alert log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorAlert {
    /// When the change happened.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub event: ExecutorEvent,
    /// Why.
    pub reason: String,
}

/// Point-in-time executor summary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorStatus {
    /// Current mode.
    pub mode: ExecutionMode,
    /// Hardware profile thresholds were tuned for.
    pub profile: HardwareProfile,
    /// Times the executor entered `Paused`.
    pub pause_count: u64,
    /// Times the executor entered `Degraded`.
    pub degrade_count: u64,
    /// Newest sample evaluated.
    pub last_metrics: Option<ResourceMetrics>,
    /// Recent mode changes, oldest first.
    pub recent_alerts: Vec<ExecutorAlert>,
}

/// Outcome of evaluating one sample.
#[derive(Debug, Clone, PartialEq)]
enum ModeChange {
    None,
    Paused(String),
    Resumed,
    Degraded(String),
    Restored,
}

struct ExecutorState {
    mode: ExecutionMode,
    pause: AutoPausePolicy,
    degrade: DegradationPolicy,
    pause_count: u64,
    degrade_count: u64,
    alerts: VecDeque<ExecutorAlert>,
    last_metrics: Option<ResourceMetrics>,
}

struct MonitorLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Wraps task invocation with resource-driven pause and degrade decisions.
pub struct ResourceAwareExecutor {
    monitor: Arc<ResourceMonitor>,
    sessions: Option<Arc<dyn SessionPauser>>,
    profile: HardwareProfile,
    sample_interval: Duration,
    alert_capacity: usize,
    state: Mutex<ExecutorState>,
    monitor_loop: Mutex<Option<MonitorLoop>>,
}

impl ResourceAwareExecutor {
    /// Executor with thresholds from `config` tuned for `profile`.
    #[must_use]
    pub fn new(
        monitor: Arc<ResourceMonitor>,
        config: &ExecutorConfig,
        profile: HardwareProfile,
        sessions: Option<Arc<dyn SessionPauser>>,
    ) -> Self {
        let tuned = tuned_for_profile(config, profile);
        let sample_interval = Duration::from_secs(tuned.sample_interval_seconds.max(1))
            .mul_f64(profile.sample_interval_scale());
        info!(
            %profile,
            pause_cpu = tuned.pause_cpu,
            pause_memory = tuned.pause_memory,
            degrade_cpu = tuned.degrade_cpu,
            degrade_memory = tuned.degrade_memory,
            sample_secs = sample_interval.as_secs(),
            "executor thresholds configured"
        );
        Self {
            monitor,
            sessions,
            profile,
            sample_interval,
            alert_capacity: tuned.alert_log_capacity.max(1),
            state: Mutex::new(ExecutorState {
                mode: ExecutionMode::Normal,
                pause: AutoPausePolicy::from_config(&tuned),
                degrade: DegradationPolicy::from_config(&tuned),
                pause_count: 0,
                degrade_count: 0,
                alerts: VecDeque::new(),
                last_metrics: None,
            }),
            monitor_loop: Mutex::new(None),
        }
    }

    /// Override the background sampling interval.
    #[must_use]
    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }

    /// Current mode.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.lock().map_or(ExecutionMode::Paused, |state| state.mode)
    }

    /// Snapshot of mode, counters, and recent alerts.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the state mutex is poisoned.
    pub fn status(&self) -> Result<ExecutorStatus> {
        let state = self.lock()?;
        Ok(ExecutorStatus {
            mode: state.mode,
            profile: self.profile,
            pause_count: state.pause_count,
            degrade_count: state.degrade_count,
            last_metrics: state.last_metrics.clone(),
            recent_alerts: state.alerts.iter().cloned().collect(),
        })
    }

    /// Run `task` unless resources are exhausted.
    ///
    /// Rejects immediately when paused or suspended. Otherwise samples the
    /// host; if the pause policy fires, the executor enters `Paused`, active
    /// sessions are paused, and the task is not run. A sampling failure is
    /// logged and does not block the task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ResourceExhaustedPause` when execution is refused,
    /// or `AppError::TaskFailed` carrying the task's own error.
    pub async fn execute<F, Fut, T, E>(&self, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Display,
    {
        if let Some(reason) = self.rejection()? {
            return Err(AppError::ResourceExhaustedPause(reason));
        }

        match self.sample().await {
            Ok(metrics) => {
                let change = self.apply(&metrics, false)?;
                if let ModeChange::Paused(reason) = change {
                    self.pause_sessions(&reason).await;
                    return Err(AppError::ResourceExhaustedPause(reason));
                }
            }
            Err(err) => warn!(%err, "resource sample failed, executing without a check"),
        }

        task().await.map_err(|err| AppError::TaskFailed(err.to_string()))
    }

    /// Suspend execution until [`resume`](Self::resume) is called.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the state mutex is poisoned.
    pub fn suspend(&self, reason: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.mode = ExecutionMode::Suspended;
        self.push_alert(&mut state, ExecutorEvent::Suspended, reason.to_owned());
        info!(reason, "executor suspended");
        Ok(())
    }

    /// Return to `Normal` from any mode, releasing the pause latch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the state mutex is poisoned.
    pub fn resume(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.pause.clear();
        state.mode = ExecutionMode::Normal;
        self.push_alert(&mut state, ExecutorEvent::Resumed, "manual resume".into());
        info!("executor resumed");
        Ok(())
    }

    /// Start the background sampling loop. Calling it twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the loop mutex is poisoned.
    pub fn start_monitoring(self: &Arc<Self>) -> Result<()> {
        let mut slot = self
            .monitor_loop
            .lock()
            .map_err(|_| AppError::InvalidState("executor loop mutex poisoned".into()))?;
        if slot.is_some() {
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let executor = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => {
                            debug!("executor monitoring cancelled");
                            break;
                        }
                        () = tokio::time::sleep(executor.sample_interval) => {}
                    }
                    executor.tick().await;
                }
            }
            .instrument(info_span!("executor_monitor")),
        );

        *slot = Some(MonitorLoop { cancel, handle });
        info!(interval_secs = self.sample_interval.as_secs(), "executor monitoring started");
        Ok(())
    }

    /// Stop the background loop, waiting at most `timeout`.
    ///
    /// Returns `true` if the loop exited in time; `false` means the stop was
    /// requested but completion is unconfirmed.
    pub async fn stop_monitoring(&self, timeout: Duration) -> bool {
        let running = match self.monitor_loop.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let Some(running) = running else {
            return true;
        };

        running.cancel.cancel();
        if tokio::time::timeout(timeout, running.handle).await.is_ok() {
            info!("executor monitoring stopped");
            true
        } else {
            warn!("executor monitoring stop requested, completion unconfirmed");
            false
        }
    }

    /// One background sample-and-act cycle. Errors are logged, never raised.
    async fn tick(&self) {
        let metrics = match self.sample().await {
            Ok(metrics) => metrics,
            Err(err) => {
                warn!(%err, "background resource sample failed");
                return;
            }
        };
        match self.apply(&metrics, true) {
            Ok(ModeChange::Paused(reason)) => self.pause_sessions(&reason).await,
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to apply resource sample"),
        }
    }

    async fn sample(&self) -> Result<ResourceMetrics> {
        let monitor = Arc::clone(&self.monitor);
        tokio::task::spawn_blocking(move || monitor.sample())
            .await
            .map_err(|err| AppError::Monitor(format!("sampling task panicked: {err}")))?
    }

    fn rejection(&self) -> Result<Option<String>> {
        let state = self.lock()?;
        Ok(match state.mode {
            ExecutionMode::Paused => Some("executor paused by resource pressure".into()),
            ExecutionMode::Suspended => Some("executor suspended".into()),
            ExecutionMode::Normal | ExecutionMode::Degraded => None,
        })
    }

    /// Evaluate a sample against the policies and update the mode.
    ///
    /// `allow_resume` is set by the background loop only.
    fn apply(&self, metrics: &ResourceMetrics, allow_resume: bool) -> Result<ModeChange> {
        let mut state = self.lock()?;
        state.last_metrics = Some(metrics.clone());

        let change = match state.mode {
            ExecutionMode::Suspended => ModeChange::None,
            ExecutionMode::Paused => {
                if allow_resume && state.pause.should_resume(metrics) {
                    state.pause.clear();
                    state.mode = ExecutionMode::Normal;
                    ModeChange::Resumed
                } else {
                    ModeChange::None
                }
            }
            ExecutionMode::Normal | ExecutionMode::Degraded => {
                let (pause, pause_reason) = state.pause.should_pause(metrics);
                let (degrade, degrade_reason) = state.degrade.should_degrade(metrics);
                if pause {
                    state.mode = ExecutionMode::Paused;
                    state.pause_count += 1;
                    ModeChange::Paused(pause_reason.unwrap_or_default())
                } else if degrade && state.mode == ExecutionMode::Normal {
                    state.mode = ExecutionMode::Degraded;
                    state.degrade_count += 1;
                    ModeChange::Degraded(degrade_reason.unwrap_or_default())
                } else if !degrade && state.mode == ExecutionMode::Degraded {
                    state.mode = ExecutionMode::Normal;
                    ModeChange::Restored
                } else {
                    ModeChange::None
                }
            }
        };

        match &change {
            ModeChange::Paused(reason) => {
                warn!(%reason, "executor paused");
                self.push_alert(&mut state, ExecutorEvent::Paused, reason.clone());
            }
            ModeChange::Resumed => {
                info!("resources recovered, executor resumed");
                self.push_alert(&mut state, ExecutorEvent::Resumed, "resources recovered".into());
            }
            ModeChange::Degraded(reason) => {
                warn!(%reason, "executor degraded");
                self.push_alert(&mut state, ExecutorEvent::Degraded, reason.clone());
            }
            ModeChange::Restored => {
                info!("executor left degraded mode");
                self.push_alert(&mut state, ExecutorEvent::Restored, "pressure subsided".into());
            }
            ModeChange::None => {}
        }
        Ok(change)
    }

    async fn pause_sessions(&self, reason: &str) {
        let Some(sessions) = &self.sessions else {
            return;
        };
        for session_id in sessions.list_active_sessions().await {
            match sessions.pause_session(&session_id, reason).await {
                Ok(()) => info!(%session_id, "session paused by executor"),
                Err(err) => warn!(%session_id, %err, "failed to pause session"),
            }
        }
    }

    fn push_alert(&self, state: &mut ExecutorState, event: ExecutorEvent, reason: String) {
        state.alerts.push_back(ExecutorAlert {
            timestamp: Utc::now(),
            event,
            reason,
        });
        while state.alerts.len() > self.alert_capacity {
            state.alerts.pop_front();
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ExecutorState>> {
        self.state
            .lock()
            .map_err(|_| AppError::InvalidState("executor state mutex poisoned".into()))
    }
}
