//! Unit tests for checkpoint checksums.

use chrono::{TimeZone, Utc};
use longhaul::models::checkpoint::TaskCheckpoint;
use longhaul::models::task_state::TaskState;
use longhaul::AppError;
use serde_json::{json, Map, Value};

fn sample() -> TaskCheckpoint {
    let mut context = Map::new();
    context.insert("zeta".into(), json!(1));
    context.insert("alpha".into(), json!({ "b": 2, "a": [1, 2] }));
    TaskCheckpoint::new("t1", "agent", "make all", TaskState::Checkpointed, 0.5)
        .with_context(context)
        .with_artifacts(vec!["out/a.bin".into()])
        .at(Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap())
}

#[test]
fn sealed_checkpoint_is_valid() {
    let mut cp = sample();
    assert!(!cp.is_valid(), "unsealed checkpoint has no checksum");
    cp.seal().unwrap();
    assert!(cp.is_valid());
    assert_eq!(cp.checksum.len(), 64);
    assert!(cp.checksum.chars().all(|c| c.is_ascii_hexdigit()));
    cp.verify().unwrap();
}

#[test]
fn checksum_ignores_context_insertion_order() {
    let mut reordered = Map::new();
    reordered.insert("alpha".into(), json!({ "a": [1, 2], "b": 2 }));
    reordered.insert("zeta".into(), json!(1));
    let a = sample();
    let b = sample().with_context(reordered);
    assert_eq!(a.compute_checksum().unwrap(), b.compute_checksum().unwrap());
}

#[test]
fn canonical_form_excludes_the_checksum_and_sorts_keys() {
    let mut cp = sample();
    cp.seal().unwrap();
    let canonical = cp.canonical_json().unwrap();
    assert!(!canonical.contains("checksum"));
    let agent = canonical.find("\"agent_id\"").unwrap();
    let task = canonical.find("\"task_id\"").unwrap();
    assert!(agent < task);
    assert!(canonical.contains(r#""state":"checkpointed""#));
}

#[test]
fn any_field_change_invalidates() {
    let mut cp = sample();
    cp.seal().unwrap();

    let mut progress = cp.clone();
    progress.progress = 0.9;
    assert!(!progress.is_valid());

    let mut context = cp.clone();
    context.context.insert("extra".into(), Value::Bool(true));
    assert!(!context.is_valid());

    let mut state = cp.clone();
    state.state = TaskState::Failed;
    assert!(matches!(state.verify(), Err(AppError::ChecksumMismatch(_))));
}

#[test]
fn progress_is_clamped_on_construction() {
    let cp = TaskCheckpoint::new("t", "a", "c", TaskState::Running, 3.0);
    assert!((cp.progress - 1.0).abs() < f64::EPSILON);
}
