//! Session lifecycle management: create, update, pause, resume, cleanup.
//!
//! [`SessionManager`] is the only writer of persisted sessions. It keeps an
//! in-memory cache behind a single mutex; every mutation updates the cache
//! and rewrites the session file while holding that lock, so the cache and
//! the file never disagree about ordering.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{info, info_span, warn};

use super::executor::SessionPauser;
use crate::models::checkpoint::TaskCheckpoint;
use crate::models::session::{AgentSession, HealthStatus, SessionState};
use crate::monitor::ResourceMonitor;
use crate::persistence::session_store::SessionStore;
use crate::{AppError, Result};

const CRITICAL_MEMORY_PERCENT: f64 = 90.0;
const CRITICAL_CPU_PERCENT: f64 = 85.0;
const WARNING_MEMORY_PERCENT: f64 = 80.0;
const WARNING_CPU_PERCENT: f64 = 70.0;
const LONG_SESSION_HOURS: f64 = 24.0;
const INACTIVITY_LIMIT_MINUTES: i64 = 60;
const DEFAULT_CHECKPOINT_LIMIT: usize = 32;

/// Health scoring for sessions.
#[derive(Clone, Default)]
pub struct SessionMonitor {
    resources: Option<Arc<ResourceMonitor>>,
}

impl SessionMonitor {
    /// Monitor that refreshes session metrics from `resources` when given.
    #[must_use]
    pub fn new(resources: Option<Arc<ResourceMonitor>>) -> Self {
        Self { resources }
    }

    /// Copy the resource monitor's newest sample into the session.
    pub fn refresh_metrics(&self, session: &mut AgentSession) {
        if let Some(latest) = self.resources.as_ref().and_then(|m| m.latest()) {
            session.resource_metrics = Some(latest);
        }
    }

    /// Health as of now.
    #[must_use]
    pub fn check_health(&self, session: &AgentSession) -> HealthStatus {
        self.check_health_at(session, Utc::now())
    }

    /// Health as of `now`.
    ///
    /// Critical after an hour without activity or above the hard memory/CPU
    /// ceilings; Warning above the soft ceilings or past 24 hours of runtime.
    #[must_use]
    pub fn check_health_at(&self, session: &AgentSession, now: DateTime<Utc>) -> HealthStatus {
        if now - session.last_activity > chrono::Duration::minutes(INACTIVITY_LIMIT_MINUTES) {
            return HealthStatus::Critical;
        }
        if let Some(metrics) = &session.resource_metrics {
            if metrics.memory_percent > CRITICAL_MEMORY_PERCENT
                || metrics.cpu_percent > CRITICAL_CPU_PERCENT
            {
                return HealthStatus::Critical;
            }
            if metrics.memory_percent > WARNING_MEMORY_PERCENT
                || metrics.cpu_percent > WARNING_CPU_PERCENT
            {
                return HealthStatus::Warning;
            }
        }
        if session.duration_hours > LONG_SESSION_HOURS {
            return HealthStatus::Warning;
        }
        HealthStatus::Healthy
    }

    /// Whether the session's latest metrics exceed the hard ceilings.
    #[must_use]
    pub fn should_pause(&self, session: &AgentSession) -> bool {
        session.resource_metrics.as_ref().is_some_and(|metrics| {
            metrics.memory_percent > CRITICAL_MEMORY_PERCENT
                || metrics.cpu_percent > CRITICAL_CPU_PERCENT
        })
    }
}

/// Owner of all [`AgentSession`] records.
pub struct SessionManager {
    store: SessionStore,
    monitor: SessionMonitor,
    checkpoint_limit: usize,
    cache: Mutex<HashMap<String, AgentSession>>,
}

impl SessionManager {
    /// Manager persisting through `store` and scoring health with `monitor`.
    #[must_use]
    pub fn new(store: SessionStore, monitor: SessionMonitor) -> Self {
        Self {
            store,
            monitor,
            checkpoint_limit: DEFAULT_CHECKPOINT_LIMIT,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Keep at most `limit` newest checkpoints inline in each session.
    #[must_use]
    pub fn with_checkpoint_limit(mut self, limit: usize) -> Self {
        self.checkpoint_limit = limit.max(1);
        self
    }

    /// Health monitor in use.
    #[must_use]
    pub fn monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    /// Start a new active session for `agent_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the session cannot be persisted.
    pub fn create(&self, agent_id: &str, metadata: Map<String, Value>) -> Result<AgentSession> {
        let span = info_span!("session_create", agent_id);
        let _guard = span.enter();

        let mut session = AgentSession::new(agent_id, metadata);
        self.monitor.refresh_metrics(&mut session);
        session.health_status = self.monitor.check_health(&session);

        let mut cache = self.lock()?;
        self.store.save(&session)?;
        cache.insert(session.session_id.clone(), session.clone());
        drop(cache);

        info!(session_id = %session.session_id, "session created");
        Ok(session)
    }

    /// Look up a session, cache first, then storage.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<AgentSession> {
        let mut cache = self.lock().ok()?;
        if let Some(session) = cache.get(session_id) {
            return Some(session.clone());
        }
        let loaded = self.store.load(session_id)?;
        cache.insert(session_id.to_owned(), loaded.clone());
        Some(loaded)
    }

    /// Refresh derived fields, evaluate health, auto-pause if needed, and persist.
    ///
    /// `last_activity` never moves backwards: an older value in `session`
    /// is replaced by the stored one.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if the session cannot be persisted.
    pub fn update(&self, session: AgentSession) -> Result<AgentSession> {
        let span = info_span!("session_update", session_id = %session.session_id);
        let _guard = span.enter();

        let mut cache = self.lock()?;
        let previous = cache
            .get(&session.session_id)
            .cloned()
            .or_else(|| self.store.load(&session.session_id));
        let updated = self.refresh(session, previous.as_ref());
        self.store.save(&updated)?;
        cache.insert(updated.session_id.clone(), updated.clone());
        Ok(updated)
    }

    /// Append a checkpoint to the session's ordered list.
    ///
    /// Only the newest checkpoints up to the manager's limit are retained.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist, or
    /// `AppError::Io` if it cannot be persisted.
    pub fn add_checkpoint(
        &self,
        session_id: &str,
        checkpoint: TaskCheckpoint,
    ) -> Result<AgentSession> {
        self.mutate(session_id, |session| {
            session.touch(checkpoint.checkpoint_time);
            session.checkpoints.push(checkpoint);
            let excess = session.checkpoints.len().saturating_sub(self.checkpoint_limit);
            session.checkpoints.drain(..excess);
            Ok(())
        })
    }

    /// Record activity now.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the session does not exist.
    pub fn record_activity(&self, session_id: &str) -> Result<AgentSession> {
        self.mutate(session_id, |session| {
            session.touch(Utc::now());
            Ok(())
        })
    }

    /// Pause an active or suspended session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the session cannot be paused.
    pub fn pause(&self, session_id: &str, reason: Option<&str>) -> Result<AgentSession> {
        self.transition(session_id, SessionState::Paused, reason)
    }

    /// Resume a paused session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` unless the session is `Paused`.
    pub fn resume(&self, session_id: &str, reason: Option<&str>) -> Result<AgentSession> {
        self.mutate(session_id, |session| {
            if session.state != SessionState::Paused {
                return Err(AppError::InvalidState(format!(
                    "session {} is {:?}, only paused sessions can resume",
                    session.session_id, session.state
                )));
            }
            apply_state(session, SessionState::Active, reason);
            session.touch(Utc::now());
            Ok(())
        })
    }

    /// Park a session for a long period.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the transition is not allowed.
    pub fn suspend(&self, session_id: &str, reason: Option<&str>) -> Result<AgentSession> {
        self.transition(session_id, SessionState::Suspended, reason)
    }

    /// Mark a session completed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the session already ended.
    pub fn complete(&self, session_id: &str) -> Result<AgentSession> {
        self.transition(session_id, SessionState::Completed, None)
    }

    /// Mark a session failed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidState` if the session already ended.
    pub fn fail(&self, session_id: &str, reason: &str) -> Result<AgentSession> {
        self.transition(session_id, SessionState::Failed, Some(reason))
    }

    /// All known sessions, optionally filtered by state, oldest first.
    #[must_use]
    pub fn list(&self, state: Option<SessionState>) -> Vec<AgentSession> {
        let Ok(cache) = self.lock() else {
            return Vec::new();
        };
        let mut merged: HashMap<String, AgentSession> = self
            .store
            .list()
            .into_iter()
            .map(|session| (session.session_id.clone(), session))
            .collect();
        for (id, session) in cache.iter() {
            merged.insert(id.clone(), session.clone());
        }
        drop(cache);

        let mut sessions: Vec<AgentSession> = merged
            .into_values()
            .filter(|session| state.is_none_or(|wanted| session.state == wanted))
            .collect();
        sessions.sort_by_key(|session| session.start_time);
        sessions
    }

    /// Ids of sessions currently `Active`.
    #[must_use]
    pub fn active_session_ids(&self) -> Vec<String> {
        self.list(Some(SessionState::Active))
            .into_iter()
            .map(|session| session.session_id)
            .collect()
    }

    /// Newest checkpoint attached to a session.
    #[must_use]
    pub fn latest_checkpoint(&self, session_id: &str) -> Option<TaskCheckpoint> {
        self.get(session_id)?.latest_checkpoint().cloned()
    }

    /// Every checkpoint for `task_id` across all sessions, optionally for one agent.
    #[must_use]
    pub fn checkpoints_for_task(&self, task_id: &str, agent_id: Option<&str>) -> Vec<TaskCheckpoint> {
        self.list(None)
            .into_iter()
            .flat_map(|session| session.checkpoints)
            .filter(|cp| cp.task_id == task_id)
            .filter(|cp| agent_id.is_none_or(|agent| cp.agent_id == agent))
            .collect()
    }

    /// Delete terminal sessions whose last activity predates `max_age_hours`.
    ///
    /// Returns the number of sessions removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Io` if a session file cannot be removed.
    pub fn cleanup(&self, max_age_hours: u64) -> Result<usize> {
        let hours = i64::try_from(max_age_hours).unwrap_or(i64::MAX);
        let cutoff = Utc::now() - chrono::Duration::hours(hours);
        let expired: Vec<String> = self
            .list(None)
            .into_iter()
            .filter(|session| session.state.is_terminal() && session.last_activity < cutoff)
            .map(|session| session.session_id)
            .collect();

        let mut cache = self.lock()?;
        let mut removed = 0;
        for session_id in &expired {
            cache.remove(session_id);
            if self.store.delete(session_id)? {
                removed += 1;
            }
        }
        drop(cache);

        if removed > 0 {
            info!(removed, max_age_hours, "expired sessions removed");
        }
        Ok(removed)
    }

    fn transition(
        &self,
        session_id: &str,
        next: SessionState,
        reason: Option<&str>,
    ) -> Result<AgentSession> {
        self.mutate(session_id, |session| {
            if !session.can_transition_to(next) {
                return Err(AppError::InvalidState(format!(
                    "session {} cannot move from {:?} to {next:?}",
                    session.session_id, session.state
                )));
            }
            apply_state(session, next, reason);
            Ok(())
        })
    }

    /// Load, mutate, refresh, and persist a session under the cache lock.
    fn mutate<F>(&self, session_id: &str, change: F) -> Result<AgentSession>
    where
        F: FnOnce(&mut AgentSession) -> Result<()>,
    {
        let mut cache = self.lock()?;
        let mut session = match cache.get(session_id) {
            Some(session) => session.clone(),
            None => self
                .store
                .load(session_id)
                .ok_or_else(|| AppError::NotFound(format!("session {session_id}")))?,
        };
        let previous = session.clone();
        change(&mut session)?;
        let updated = self.refresh(session, Some(&previous));
        self.store.save(&updated)?;
        cache.insert(updated.session_id.clone(), updated.clone());
        Ok(updated)
    }

    fn refresh(&self, mut session: AgentSession, previous: Option<&AgentSession>) -> AgentSession {
        let now = Utc::now();
        if let Some(previous) = previous {
            session.touch(previous.last_activity);
        }
        session.refresh_duration(now);
        self.monitor.refresh_metrics(&mut session);
        session.health_status = self.monitor.check_health_at(&session, now);

        if session.state == SessionState::Active && self.monitor.should_pause(&session) {
            warn!(session_id = %session.session_id, "resource ceilings exceeded, pausing session");
            apply_state(&mut session, SessionState::Paused, Some("resource ceilings exceeded"));
        }
        session
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, AgentSession>>> {
        self.cache
            .lock()
            .map_err(|_| AppError::InvalidState("session cache mutex poisoned".into()))
    }
}

fn apply_state(session: &mut AgentSession, next: SessionState, reason: Option<&str>) {
    info!(
        session_id = %session.session_id,
        from = ?session.state,
        to = ?next,
        reason = reason.unwrap_or(""),
        "session state change"
    );
    session.state = next;
    if let Some(reason) = reason {
        session
            .metadata
            .insert("last_state_reason".into(), Value::String(reason.to_owned()));
    }
}

impl SessionPauser for SessionManager {
    fn list_active_sessions(&self) -> Pin<Box<dyn Future<Output = Vec<String>> + Send + '_>> {
        Box::pin(async move { self.active_session_ids() })
    }

    fn pause_session<'a>(
        &'a self,
        session_id: &'a str,
        reason: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.pause(session_id, Some(reason)).map(|_| ()) })
    }
}
