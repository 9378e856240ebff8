//! Integration tests for the resource-aware executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use longhaul::config::{ExecutorConfig, MonitorConfig};
use longhaul::errors::AppError;
use longhaul::hardware::HardwareProfile;
use longhaul::models::metrics::ResourceMetrics;
use longhaul::models::session::SessionState;
use longhaul::monitor::source::{MetricsSource, ReplaySource};
use longhaul::monitor::ResourceMonitor;
use longhaul::orchestrator::executor::{
    ExecutionMode, ExecutorEvent, ResourceAwareExecutor, SessionPauser,
};
use serde_json::Map;

use super::test_helpers::harness;

fn executor(
    source: &Arc<ReplaySource>,
    sessions: Option<Arc<dyn SessionPauser>>,
) -> Arc<ResourceAwareExecutor> {
    let source: Arc<dyn MetricsSource> = Arc::clone(source) as Arc<dyn MetricsSource>;
    let monitor = Arc::new(ResourceMonitor::new(source, &MonitorConfig::default()));
    Arc::new(
        ResourceAwareExecutor::new(
            monitor,
            &ExecutorConfig::default(),
            HardwareProfile::Standard,
            sessions,
        )
        .with_sample_interval(Duration::from_millis(10)),
    )
}

async fn wait_for_mode(executor: &ResourceAwareExecutor, mode: ExecutionMode) -> bool {
    for _ in 0..200 {
        if executor.mode() == mode {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn quiet_host_runs_the_task() {
    let source = Arc::new(ReplaySource::constant(10.0, 20.0, 30.0));
    let executor = executor(&source, None);

    let value = executor.execute(|| async { Ok::<_, AppError>(42) }).await.unwrap();
    assert_eq!(value, 42);
    assert_eq!(executor.mode(), ExecutionMode::Normal);
    assert!(executor.status().unwrap().last_metrics.is_some());
}

#[tokio::test]
async fn task_errors_become_task_failed() {
    let source = Arc::new(ReplaySource::constant(10.0, 20.0, 30.0));
    let executor = executor(&source, None);

    let err = executor
        .execute(|| async { Err::<(), _>("exit status 3") })
        .await
        .unwrap_err();
    match err {
        AppError::TaskFailed(message) => assert_eq!(message, "exit status 3"),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn pressure_pauses_executor_and_sessions() {
    let h = harness();
    let first = h.sessions.create("agent-a", Map::new()).unwrap();
    let second = h.sessions.create("agent-b", Map::new()).unwrap();
    let source = Arc::new(ReplaySource::constant(92.0, 40.0, 30.0));
    let pauser: Arc<dyn SessionPauser> = Arc::clone(&h.sessions) as Arc<dyn SessionPauser>;
    let executor = executor(&source, Some(pauser));

    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let err = executor
        .execute(|| async move {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, AppError>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::ResourceExhaustedPause(ref reason) if reason.contains("cpu")));
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(executor.mode(), ExecutionMode::Paused);
    for id in [&first.session_id, &second.session_id] {
        assert_eq!(h.sessions.get(id).unwrap().state, SessionState::Paused);
    }

    source.set(ResourceMetrics::from_percentages(10.0, 10.0, 10.0));
    let again = executor.execute(|| async { Ok::<_, AppError>(()) }).await;
    assert!(matches!(again, Err(AppError::ResourceExhaustedPause(_))));
    assert_eq!(executor.mode(), ExecutionMode::Paused);
}

#[tokio::test]
async fn monitoring_loop_resumes_after_pressure_drops() {
    let source = Arc::new(ReplaySource::constant(10.0, 95.0, 30.0));
    let executor = executor(&source, None);
    assert!(executor
        .execute(|| async { Ok::<_, AppError>(()) })
        .await
        .is_err());

    source.set(ResourceMetrics::from_percentages(60.0, 50.0, 30.0));
    executor.start_monitoring().unwrap();
    executor.start_monitoring().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(executor.mode(), ExecutionMode::Paused, "cpu above resume threshold");

    source.set(ResourceMetrics::from_percentages(20.0, 50.0, 30.0));
    assert!(wait_for_mode(&executor, ExecutionMode::Normal).await);
    assert!(executor.stop_monitoring(Duration::from_secs(2)).await);

    let status = executor.status().unwrap();
    assert_eq!(status.pause_count, 1);
    let events: Vec<ExecutorEvent> = status.recent_alerts.iter().map(|a| a.event).collect();
    assert_eq!(events, vec![ExecutorEvent::Paused, ExecutorEvent::Resumed]);
    executor.execute(|| async { Ok::<_, AppError>(()) }).await.unwrap();
}

#[tokio::test]
async fn degrade_still_runs_and_restores() {
    let source = Arc::new(ReplaySource::constant(80.0, 20.0, 30.0));
    let executor = executor(&source, None);

    executor.execute(|| async { Ok::<_, AppError>(()) }).await.unwrap();
    assert_eq!(executor.mode(), ExecutionMode::Degraded);

    source.set(ResourceMetrics::from_percentages(30.0, 20.0, 30.0));
    executor.execute(|| async { Ok::<_, AppError>(()) }).await.unwrap();
    assert_eq!(executor.mode(), ExecutionMode::Normal);

    let status = executor.status().unwrap();
    assert_eq!(status.degrade_count, 1);
    assert_eq!(status.pause_count, 0);
}

#[tokio::test]
async fn suspend_rejects_until_manual_resume() {
    let source = Arc::new(ReplaySource::constant(10.0, 10.0, 10.0));
    let executor = executor(&source, None);
    executor.suspend("maintenance window").unwrap();

    executor.start_monitoring().unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(executor.mode(), ExecutionMode::Suspended);
    let err = executor
        .execute(|| async { Ok::<_, AppError>(()) })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::ResourceExhaustedPause(_)));

    executor.resume().unwrap();
    executor.execute(|| async { Ok::<_, AppError>(()) }).await.unwrap();
    assert!(executor.stop_monitoring(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn stop_without_start_is_confirmed() {
    let source = Arc::new(ReplaySource::constant(10.0, 10.0, 10.0));
    let executor = executor(&source, None);
    assert!(executor.stop_monitoring(Duration::from_millis(10)).await);
}
