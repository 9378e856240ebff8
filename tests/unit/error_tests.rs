//! Unit tests for `AppError` display formats.

use longhaul::models::task_state::TaskState;
use longhaul::AppError;

#[test]
fn invalid_transition_names_both_states() {
    let err = AppError::InvalidTransition {
        from: TaskState::Completed,
        to: TaskState::Running,
    };
    assert_eq!(err.to_string(), "invalid transition: completed -> running");
}

#[test]
fn artifact_missing_lists_every_path() {
    let err = AppError::ArtifactMissing(vec!["out/a.bin".into(), "out/b.bin".into()]);
    assert_eq!(err.to_string(), "artifact missing: out/a.bin, out/b.bin");
}

#[test]
fn messages_are_prefixed_and_unpunctuated() {
    let errors = [
        (AppError::Config("bad".into()), "config:"),
        (AppError::Io("disk".into()), "io:"),
        (AppError::Serialization("json".into()), "serialization:"),
        (AppError::Monitor("proc".into()), "monitor:"),
        (AppError::ChecksumMismatch("t1".into()), "checksum mismatch:"),
        (AppError::ResourceExhaustedPause("cpu".into()), "paused:"),
        (AppError::RecoveryUnavailable("t1".into()), "recovery unavailable:"),
        (AppError::NotFound("t1".into()), "not found:"),
        (AppError::InvalidState("t1".into()), "invalid state:"),
        (AppError::StaleCheckpoint("t1".into()), "stale checkpoint:"),
        (AppError::TaskFailed("exit 1".into()), "task failed:"),
    ];
    for (err, prefix) in errors {
        let text = err.to_string();
        assert!(text.starts_with(prefix), "{text}");
        assert!(!text.ends_with('.'), "{text}");
    }
}

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(_)));
}

#[test]
fn json_errors_convert() {
    let err: AppError = serde_json::from_str::<u32>("nope").unwrap_err().into();
    assert!(matches!(err, AppError::Serialization(_)));
}
