//! Unit tests for the agent session model.

use chrono::Duration;
use longhaul::models::checkpoint::TaskCheckpoint;
use longhaul::models::session::{AgentSession, SessionState};
use longhaul::models::task_state::TaskState;
use serde_json::Map;

const ALL: [SessionState; 5] = [
    SessionState::Active,
    SessionState::Paused,
    SessionState::Suspended,
    SessionState::Completed,
    SessionState::Failed,
];

fn in_state(state: SessionState) -> AgentSession {
    let mut session = AgentSession::new("agent", Map::new());
    session.state = state;
    session
}

#[test]
fn new_session_is_active_with_unique_id() {
    let a = AgentSession::new("agent", Map::new());
    let b = AgentSession::new("agent", Map::new());
    assert_eq!(a.state, SessionState::Active);
    assert_ne!(a.session_id, b.session_id);
    assert!(a.checkpoints.is_empty());
}

#[test]
fn terminal_states_allow_nothing() {
    for from in [SessionState::Completed, SessionState::Failed] {
        let session = in_state(from);
        assert!(from.is_terminal());
        for to in ALL {
            assert!(!session.can_transition_to(to), "{from:?} -> {to:?}");
        }
    }
}

#[test]
fn suspended_resumes_only_through_paused() {
    let session = in_state(SessionState::Suspended);
    assert!(!session.can_transition_to(SessionState::Active));
    assert!(session.can_transition_to(SessionState::Paused));
    assert!(in_state(SessionState::Paused).can_transition_to(SessionState::Active));
}

#[test]
fn touch_never_moves_backwards() {
    let mut session = AgentSession::new("agent", Map::new());
    let original = session.last_activity;
    session.touch(original - Duration::minutes(5));
    assert_eq!(session.last_activity, original);
    session.touch(original + Duration::minutes(5));
    assert_eq!(session.last_activity, original + Duration::minutes(5));
}

#[test]
fn refresh_duration_counts_hours() {
    let mut session = AgentSession::new("agent", Map::new());
    session.refresh_duration(session.start_time + Duration::minutes(90));
    assert!((session.duration_hours - 1.5).abs() < 1e-9);
}

#[test]
fn latest_checkpoint_is_by_time_not_position() {
    let mut session = AgentSession::new("agent", Map::new());
    let now = chrono::Utc::now();
    let mut newer = TaskCheckpoint::new("t1", "agent", "cmd", TaskState::Running, 0.7)
        .at(now);
    newer.seal().unwrap();
    let mut older = TaskCheckpoint::new("t1", "agent", "cmd", TaskState::Running, 0.3)
        .at(now - Duration::minutes(10));
    older.seal().unwrap();
    session.checkpoints = vec![newer, older];

    let latest = session.latest_checkpoint().unwrap();
    assert!((latest.progress - 0.7).abs() < f64::EPSILON);
}
