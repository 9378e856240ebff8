//! End-to-end supervision scenarios for the long-duration orchestrator.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use longhaul::errors::AppError;
use longhaul::hardware::HardwareProfile;
use longhaul::models::failure::FailureType;
use longhaul::models::session::SessionState;
use longhaul::models::task_state::TaskState;
use longhaul::orchestrator::durability::DurabilityLevel;
use longhaul::orchestrator::long_duration::{LongDurationOrchestrator, ProgressUpdate};
use longhaul::orchestrator::resume::ResumeHandler;
use serde_json::{json, Map};

use super::test_helpers::{harness, harness_with, orchestrator};

#[test]
fn crash_recovers_the_newest_forced_checkpoint() {
    let h = harness();
    let orch = orchestrator(&h);

    let initial = orch.start("t1", "agent-a", "train", None).unwrap();
    assert!(initial.progress.abs() < f64::EPSILON);
    assert!(initial.is_valid());

    for progress in [0.2, 0.4, 0.6] {
        let outcome = orch
            .update_progress("t1", ProgressUpdate::new(progress).forced())
            .unwrap();
        let checkpoint = outcome.checkpoint.expect("forced checkpoint");
        assert!((checkpoint.progress - progress).abs() < 1e-9);
    }

    let outcome = orch
        .handle_failure("t1", FailureType::Crash, "boom", Some("at step 3"))
        .unwrap();
    let checkpoint = outcome.checkpoint.expect("recovery checkpoint");
    assert!((checkpoint.progress - 0.6).abs() < 1e-9);
    assert!(outcome.failure.checkpoint_available);
    assert!(outcome.failure.recovery_attempted);
    assert!(outcome.failure.recovery_successful);
    assert_eq!(outcome.failure.error_message, "boom");
    assert_eq!(outcome.strategy, "restore latest checkpoint and resume");

    assert_eq!(orch.status("t1").unwrap().state, TaskState::Failed);
}

#[test]
fn checkpoint_times_strictly_increase() {
    let h = harness();
    let orch = orchestrator(&h);
    let mut last = orch.start("t1", "agent", "train", None).unwrap().checkpoint_time;
    for step in 1..=5_u32 {
        let checkpoint = orch
            .update_progress("t1", ProgressUpdate::new(f64::from(step) / 10.0).forced())
            .unwrap()
            .checkpoint
            .unwrap();
        assert!(checkpoint.checkpoint_time > last);
        last = checkpoint.checkpoint_time;
    }

    let session_id = orch.status("t1").unwrap().session_id;
    let session = h.sessions.get(&session_id).unwrap();
    assert_eq!(session.checkpoints.len(), 6);
    assert_eq!(session.latest_checkpoint().unwrap().checkpoint_time, last);
}

#[test]
fn unforced_updates_wait_for_the_cadence() {
    let h = harness();
    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();

    let outcome = orch
        .update_progress("t1", ProgressUpdate::new(0.1).step("load", 1, 10))
        .unwrap();
    assert!(outcome.checkpoint.is_none());
    std::thread::sleep(Duration::from_millis(20));
    orch.update_progress("t1", ProgressUpdate::new(0.2).step("load", 2, 10))
        .unwrap();

    let status = orch.status("t1").unwrap();
    assert_eq!(status.current_step, "load");
    assert!((status.progress - 0.2).abs() < 1e-9);
    assert!(status.velocity.unwrap() > 0.0);
    assert_eq!(status.durability_level, DurabilityLevel::Standard);
    assert!(h.store.load("t1").unwrap().progress.abs() < f64::EPSILON);
}

#[test]
fn short_interval_makes_updates_checkpoint() {
    let h = harness();
    let orch = Arc::new(
        LongDurationOrchestrator::new(
            &h.config,
            HardwareProfile::Standard,
            h.store.clone(),
            Arc::clone(&h.sessions),
        )
        .with_checkpoint_interval(Duration::from_millis(10)),
    );
    orch.start("t1", "agent", "train", None).unwrap();
    std::thread::sleep(Duration::from_millis(20));

    let outcome = orch.update_progress("t1", ProgressUpdate::new(0.3)).unwrap();
    assert!(outcome.checkpoint.is_some());
    std::thread::sleep(Duration::from_millis(20));
    orch.update_progress("t1", ProgressUpdate::new(0.35)).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(orch.checkpoint_due(), 1);
    assert!((h.store.load("t1").unwrap().progress - 0.35).abs() < 1e-9);
}

#[test]
fn duplicate_start_is_rejected() {
    let h = harness();
    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();
    let err = orch.start("t1", "agent", "train", None).unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[test]
fn pause_blocks_progress_until_resumed() {
    let h = harness();
    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();
    orch.update_progress("t1", ProgressUpdate::new(0.3)).unwrap();

    let paused = orch.pause_task("t1", "operator request").unwrap();
    assert_eq!(paused.state, TaskState::Paused);
    assert!((paused.progress - 0.3).abs() < 1e-9);
    let session_id = orch.status("t1").unwrap().session_id;
    assert_eq!(h.sessions.get(&session_id).unwrap().state, SessionState::Paused);

    let err = orch.update_progress("t1", ProgressUpdate::new(0.4)).unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    assert_eq!(orch.resume_task("t1").unwrap(), TaskState::Running);
    assert_eq!(h.sessions.get(&session_id).unwrap().state, SessionState::Active);
    orch.update_progress("t1", ProgressUpdate::new(0.4)).unwrap();
}

#[test]
fn failed_task_resumes_through_the_state_machine() {
    let h = harness();
    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();
    orch.handle_failure("t1", FailureType::Timeout, "slow", None).unwrap();

    assert_eq!(orch.resume_task("t1").unwrap(), TaskState::Running);
    assert_eq!(orch.status("t1").unwrap().state, TaskState::Running);
    assert!(matches!(
        orch.resume_task("t1").unwrap_err(),
        AppError::InvalidState(_)
    ));
}

#[test]
fn complete_writes_final_checkpoint_and_releases_task() {
    let h = harness();
    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();
    let session_id = orch.status("t1").unwrap().session_id;
    orch.update_progress("t1", ProgressUpdate::new(0.9)).unwrap();

    let done = orch.complete("t1").unwrap();
    assert_eq!(done.state, TaskState::Completed);
    assert!((done.progress - 1.0).abs() < f64::EPSILON);
    assert!(orch.active_tasks().is_empty());
    assert!(orch.status("t1").is_none());
    assert_eq!(h.sessions.get(&session_id).unwrap().state, SessionState::Completed);
    assert!(matches!(orch.complete("t1").unwrap_err(), AppError::NotFound(_)));
}

#[test]
fn context_merges_and_artifacts_deduplicate() {
    let h = harness();
    let orch = orchestrator(&h);
    let mut initial = Map::new();
    initial.insert("lr".into(), json!(0.01));
    orch.start("t1", "agent", "train", Some(initial)).unwrap();

    let mut update = Map::new();
    update.insert("epoch".into(), json!(3));
    orch.update_progress(
        "t1",
        ProgressUpdate::new(0.3)
            .with_context(update)
            .with_artifacts(vec!["out/a.bin".into(), "out/a.bin".into()]),
    )
    .unwrap();
    let checkpoint = orch
        .update_progress(
            "t1",
            ProgressUpdate::new(0.4)
                .with_artifacts(vec!["out/a.bin".into(), "out/b.bin".into()])
                .forced(),
        )
        .unwrap()
        .checkpoint
        .unwrap();

    assert_eq!(checkpoint.context["lr"], json!(0.01));
    assert_eq!(checkpoint.context["epoch"], json!(3));
    assert_eq!(checkpoint.artifacts, vec!["out/a.bin", "out/b.bin"]);
}

#[test]
fn high_durability_backs_up_artifacts() {
    let h = harness_with(|config| config.durability.level = DurabilityLevel::High);
    fs::create_dir_all(h.project_root().join("out")).unwrap();
    fs::write(h.project_root().join("out/model.bin"), b"weights").unwrap();

    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();
    orch.update_progress(
        "t1",
        ProgressUpdate::new(0.5)
            .with_artifacts(vec!["out/model.bin".into()])
            .forced(),
    )
    .unwrap();

    let task_backups = h.config.backup_dir().join("t1");
    let labels: Vec<_> = fs::read_dir(&task_backups).unwrap().collect();
    assert_eq!(labels.len(), 1);
    let label_dir = labels.into_iter().next().unwrap().unwrap().path();
    assert_eq!(fs::read(label_dir.join("out__model.bin")).unwrap(), b"weights");
}

#[test]
fn restart_resumes_with_saved_progress() {
    let h = harness();
    {
        let orch = orchestrator(&h);
        orch.start("t1", "agent", "train", None).unwrap();
        orch.update_progress("t1", ProgressUpdate::new(0.5).forced())
            .unwrap();
    }

    let handler = ResumeHandler::new(h.store.clone(), h.project_root());
    let plan = handler.prepare("t1").unwrap();
    assert_eq!(plan.state_machine.state(), TaskState::Running);

    let orch = orchestrator(&h);
    let first = orch.resume_from(&plan).unwrap();
    assert!((first.progress - 0.5).abs() < 1e-9);
    assert!(!first.context.contains_key("_checkpoint"));
    assert!(first.checkpoint_time > plan.checkpoint.checkpoint_time);

    let status = orch.status("t1").unwrap();
    assert_eq!(status.state, TaskState::Running);
    assert!((status.progress - 0.5).abs() < 1e-9);
}

#[test]
fn pausing_a_task_whose_session_is_already_paused() {
    let h = harness();
    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();
    orch.update_progress("t1", ProgressUpdate::new(0.3)).unwrap();
    let session_id = orch.status("t1").unwrap().session_id;
    h.sessions.pause(&session_id, Some("resource pressure")).unwrap();

    let paused = orch.pause_task("t1", "resource pressure").unwrap();
    assert_eq!(paused.state, TaskState::Paused);
    assert_eq!(h.store.load("t1").unwrap().state, TaskState::Paused);
    assert_eq!(orch.status("t1").unwrap().state, TaskState::Paused);
    assert_eq!(h.sessions.get(&session_id).unwrap().state, SessionState::Paused);

    assert_eq!(orch.resume_task("t1").unwrap(), TaskState::Running);
    assert_eq!(h.sessions.get(&session_id).unwrap().state, SessionState::Active);
}

#[test]
fn restarting_a_task_id_starts_a_fresh_progress_history() {
    let h = harness();
    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();
    orch.update_progress("t1", ProgressUpdate::new(0.5)).unwrap();
    std::thread::sleep(Duration::from_millis(20));
    orch.update_progress("t1", ProgressUpdate::new(0.9)).unwrap();
    orch.complete("t1").unwrap();

    orch.start("t1", "agent", "train", None).unwrap();
    orch.update_progress("t1", ProgressUpdate::new(0.1)).unwrap();

    let status = orch.status("t1").unwrap();
    assert!(status.velocity.is_none());
    assert!(status.estimated_remaining_hours.is_none());
    let journal = fs::read_to_string(h.config.progress_dir().join("progress-t1.jsonl")).unwrap();
    assert_eq!(journal.lines().count(), 1);
}

#[test]
fn rejected_task_id_leaves_no_session_behind() {
    let h = harness();
    let orch = orchestrator(&h);
    let err = orch.start("bad/id", "agent", "train", None).unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert!(h.sessions.list(None).is_empty());
    assert!(orch.active_tasks().is_empty());
}

#[test]
fn failed_initial_checkpoint_fails_the_session() {
    let h = harness();
    let checkpoint_dir = h.config.checkpoint_dir();
    fs::remove_dir_all(&checkpoint_dir).unwrap();
    fs::write(&checkpoint_dir, b"not a directory").unwrap();

    let orch = orchestrator(&h);
    assert!(orch.start("t1", "agent", "train", None).is_err());
    assert!(orch.active_tasks().is_empty());
    assert!(h.sessions.active_session_ids().is_empty());
    let sessions = h.sessions.list(None);
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].state, SessionState::Failed);
}

#[test]
fn sessions_keep_only_the_newest_checkpoints() {
    let h = harness_with(|config| config.durability.session_checkpoint_limit = 3);
    let orch = orchestrator(&h);
    orch.start("t1", "agent", "train", None).unwrap();
    for step in 1..=5_u32 {
        orch.update_progress("t1", ProgressUpdate::new(f64::from(step) / 10.0).forced())
            .unwrap();
    }

    let session_id = orch.status("t1").unwrap().session_id;
    let session = h.reopen_sessions().get(&session_id).unwrap();
    let kept: Vec<f64> = session.checkpoints.iter().map(|cp| cp.progress).collect();
    assert_eq!(kept.len(), 3);
    assert!((kept[0] - 0.3).abs() < 1e-9);
    assert!((kept[2] - 0.5).abs() < 1e-9);
}

#[tokio::test]
async fn background_loop_checkpoints_on_cadence_and_stops() {
    let h = harness();
    let orch = Arc::new(
        LongDurationOrchestrator::new(
            &h.config,
            HardwareProfile::Standard,
            h.store.clone(),
            Arc::clone(&h.sessions),
        )
        .with_loop_interval(Duration::from_millis(10))
        .with_checkpoint_interval(Duration::from_millis(30)),
    );
    let initial = orch.start("t1", "agent", "train", None).unwrap();

    let mut written = None;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if let Some(stored) = h.store.load("t1") {
            if stored.checkpoint_time > initial.checkpoint_time {
                written = Some(stored);
                break;
            }
        }
    }
    let cadence = written.expect("cadence checkpoint from the background loop");
    assert_eq!(cadence.state, TaskState::Checkpointed);
    assert_eq!(orch.status("t1").unwrap().state, TaskState::Running);

    assert!(orch.stop().await);
    assert!(orch.stop().await);
}
