//! Integration tests for resuming tasks from stored checkpoints.

use std::fs;

use chrono::{Duration, Utc};
use longhaul::errors::AppError;
use longhaul::models::task_state::TaskState;
use longhaul::orchestrator::resume::{ResumableTask, ResumeHandler};
use longhaul::Result;
use serde_json::{json, Map, Value};

use super::test_helpers::{harness, sealed, Harness};

fn handler(h: &Harness) -> ResumeHandler {
    ResumeHandler::new(h.store.clone(), h.project_root())
}

fn store_paused_with_artifact(h: &Harness, artifact: &str) {
    let mut checkpoint = sealed("t1", "agent", TaskState::Paused, 0.6, Utc::now())
        .with_artifacts(vec![artifact.to_owned()]);
    h.store.save(&mut checkpoint).unwrap();
}

#[test]
fn missing_artifact_blocks_resume_and_names_the_path() {
    let h = harness();
    store_paused_with_artifact(&h, "out/model.bin");
    let handler = handler(&h);

    let (ok, reason) = handler.can_resume("t1");
    assert!(!ok);
    assert!(reason.unwrap().contains("out/model.bin"));
    match handler.prepare("t1").unwrap_err() {
        AppError::ArtifactMissing(paths) => assert_eq!(paths, vec!["out/model.bin"]),
        other => panic!("unexpected error: {other}"),
    }

    fs::create_dir_all(h.project_root().join("out")).unwrap();
    fs::write(h.project_root().join("out/model.bin"), b"w").unwrap();
    assert_eq!(handler.can_resume("t1"), (true, None));
}

#[test]
fn prepare_restores_context_and_running_machine() {
    let h = harness();
    let mut context = Map::new();
    context.insert("epoch".into(), json!(12));
    let mut checkpoint = sealed("t1", "agent", TaskState::Checkpointed, 0.45, Utc::now())
        .with_context(context);
    h.store.save(&mut checkpoint).unwrap();

    let plan = handler(&h).prepare("t1").unwrap();
    assert_eq!(plan.state_machine.state(), TaskState::Running);
    let visited: Vec<TaskState> = plan.state_machine.history().iter().map(|t| t.to).collect();
    assert_eq!(
        visited,
        vec![TaskState::Paused, TaskState::Resumed, TaskState::Running]
    );
    assert!((plan.progress - 0.45).abs() < 1e-9);
    assert_eq!(plan.agent_id, "agent");
    assert_eq!(plan.restored_context["epoch"], json!(12));
    let reserved = &plan.restored_context["_checkpoint"];
    assert_eq!(reserved["task_id"], json!("t1"));
    assert_eq!(reserved["progress"], json!(0.45));
    assert!(plan.artifact_validation.is_empty());
}

#[test]
fn running_checkpoint_is_not_resumable() {
    let h = harness();
    let mut checkpoint = sealed("t1", "agent", TaskState::Running, 0.2, Utc::now());
    h.store.save(&mut checkpoint).unwrap();

    let (ok, reason) = handler(&h).can_resume("t1");
    assert!(!ok);
    assert!(reason.unwrap().contains("not resumable"));
}

#[test]
fn tampered_file_is_a_checksum_mismatch() {
    let h = harness();
    let mut checkpoint = sealed("t1", "agent", TaskState::Paused, 0.2, Utc::now());
    let path = h.store.save(&mut checkpoint).unwrap();

    let mut raw: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    raw["progress"] = json!(0.99);
    fs::write(&path, serde_json::to_vec(&raw).unwrap()).unwrap();

    let err = handler(&h).prepare("t1").unwrap_err();
    assert!(matches!(err, AppError::ChecksumMismatch(_)));
}

#[test]
fn unknown_task_is_recovery_unavailable() {
    let h = harness();
    let err = handler(&h).prepare("ghost").unwrap_err();
    assert!(matches!(err, AppError::RecoveryUnavailable(_)));
}

#[test]
fn list_resumable_filters_blocked_tasks() {
    let h = harness();
    let now = Utc::now();
    for (task, state) in [
        ("a-paused", TaskState::Paused),
        ("b-running", TaskState::Running),
        ("c-failed", TaskState::Failed),
    ] {
        let mut checkpoint = sealed(task, "agent", state, 0.5, now - Duration::minutes(1));
        h.store.save(&mut checkpoint).unwrap();
    }
    let mut blocked = sealed("d-blocked", "agent", TaskState::Paused, 0.5, now)
        .with_artifacts(vec!["gone.txt".into()]);
    h.store.save(&mut blocked).unwrap();

    let ids: Vec<String> = handler(&h)
        .list_resumable()
        .into_iter()
        .map(|summary| summary.task_id)
        .collect();
    assert_eq!(ids, vec!["a-paused", "c-failed"]);
}

struct Trainer {
    epoch: u64,
    restored_from: Option<String>,
}

impl ResumableTask for Trainer {
    fn restore(&mut self, context: &Map<String, Value>) -> Result<()> {
        self.epoch = context
            .get("epoch")
            .and_then(Value::as_u64)
            .ok_or_else(|| AppError::InvalidState("epoch missing".into()))?;
        self.restored_from = context["_checkpoint"]["task_id"].as_str().map(ToOwned::to_owned);
        Ok(())
    }
}

#[test]
fn resume_builds_and_restores_the_task() {
    let h = harness();
    let mut context = Map::new();
    context.insert("epoch".into(), json!(7));
    let mut checkpoint =
        sealed("t1", "agent", TaskState::Failed, 0.3, Utc::now()).with_context(context);
    h.store.save(&mut checkpoint).unwrap();

    let (trainer, plan) = handler(&h)
        .resume("t1", |plan| {
            assert_eq!(plan.command, "train --epochs 40");
            Ok(Trainer {
                epoch: 0,
                restored_from: None,
            })
        })
        .unwrap();
    assert_eq!(trainer.epoch, 7);
    assert_eq!(trainer.restored_from.as_deref(), Some("t1"));
    assert_eq!(plan.state_machine.state(), TaskState::Running);
}

#[test]
fn restore_errors_propagate() {
    let h = harness();
    let mut checkpoint = sealed("t1", "agent", TaskState::Paused, 0.3, Utc::now());
    h.store.save(&mut checkpoint).unwrap();

    let result = handler(&h).resume("t1", |_| {
        Ok(Trainer {
            epoch: 0,
            restored_from: None,
        })
    });
    assert!(matches!(result, Err(AppError::InvalidState(_))));
}
