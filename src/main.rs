#![forbid(unsafe_code)]

//! `longhaul`: durable supervisor for long-running commands.
//!
//! Runs a shell command under checkpointing and resource-aware pausing,
//! and inspects the sessions and checkpoints left behind.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};
use tracing_subscriber::{fmt, EnvFilter};

use longhaul::config::GlobalConfig;
use longhaul::hardware::{HardwareDetector, HardwareProfile, StaticDetector};
use longhaul::models::failure::FailureType;
use longhaul::models::session::SessionState;
use longhaul::monitor::ResourceMonitor;
use longhaul::orchestrator::executor::{ResourceAwareExecutor, SessionPauser};
use longhaul::orchestrator::long_duration::LongDurationOrchestrator;
use longhaul::orchestrator::resume::ResumeHandler;
use longhaul::orchestrator::session_manager::{SessionManager, SessionMonitor};
use longhaul::persistence::checkpoint_store::CheckpointStore;
use longhaul::persistence::retention;
use longhaul::persistence::session_store::SessionStore;
use longhaul::{AppError, Result};

/// Environment variable carrying restored context into a resumed command.
const RESUME_CONTEXT_ENV: &str = "LONGHAUL_RESUME_CONTEXT";

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum StateFilter {
    Active,
    Paused,
    Suspended,
    Completed,
    Failed,
}

impl From<StateFilter> for SessionState {
    fn from(filter: StateFilter) -> Self {
        match filter {
            StateFilter::Active => Self::Active,
            StateFilter::Paused => Self::Paused,
            StateFilter::Suspended => Self::Suspended,
            StateFilter::Completed => Self::Completed,
            StateFilter::Failed => Self::Failed,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "longhaul", about = "Durable supervisor for long-running tasks", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    /// Override the data directory.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Override the detected hardware profile.
    #[arg(long, value_enum, global = true)]
    profile: Option<HardwareProfile>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Supervise a shell command until it exits.
    Run {
        /// Task identifier; reused to resume an earlier run.
        #[arg(long)]
        task_id: String,
        /// Agent identifier recorded on the session.
        #[arg(long, default_value = "cli")]
        agent_id: String,
        /// Resume from the task's checkpoint when one is resumable.
        #[arg(long)]
        resume: bool,
        /// Command line passed to `sh -c`.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
    /// List sessions.
    Sessions {
        /// Only sessions in this state.
        #[arg(long, value_enum)]
        state: Option<StateFilter>,
    },
    /// List tasks that can be resumed.
    Resumable,
    /// Explain whether a task can be resumed.
    Check {
        /// Task identifier.
        task_id: String,
    },
    /// Sample host resources.
    Metrics {
        /// Number of samples to take.
        #[arg(long, default_value_t = 1)]
        samples: u32,
    },
    /// Purge expired sessions and checkpoints once.
    Cleanup,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

/// Shared handles built from configuration.
struct Runtime {
    config: GlobalConfig,
    profile: HardwareProfile,
    store: CheckpointStore,
    monitor: Arc<ResourceMonitor>,
    sessions: Arc<SessionManager>,
}

impl Runtime {
    fn build(args: &Cli) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => GlobalConfig::load_from_path(path)?,
            None => GlobalConfig::default(),
        };
        config.apply_env_overrides();
        if let Some(dir) = &args.data_dir {
            config.data_dir.clone_from(dir);
        }

        let detector = StaticDetector(args.profile.unwrap_or(config.hardware_profile));
        let profile = detector.detect();
        info!(%profile, data_dir = %config.data_dir.display(), "configuration loaded");

        let store = CheckpointStore::new(config.checkpoint_dir(), profile)?;
        let monitor = Arc::new(ResourceMonitor::system(&config.monitor));
        let sessions = Arc::new(
            SessionManager::new(
                SessionStore::new(config.session_dir())?,
                SessionMonitor::new(Some(Arc::clone(&monitor))),
            )
            .with_checkpoint_limit(config.durability.session_checkpoint_limit),
        );
        Ok(Self {
            config,
            profile,
            store,
            monitor,
            sessions,
        })
    }

    fn resume_handler(&self) -> ResumeHandler {
        ResumeHandler::new(self.store.clone(), self.config.project_root.clone())
    }
}

async fn run(args: Cli) -> Result<()> {
    let rt = Runtime::build(&args)?;

    match args.command {
        Command::Run {
            task_id,
            agent_id,
            resume,
            command,
        } => {
            let span = info_span!("supervise", %task_id, %agent_id);
            supervise(&rt, &task_id, &agent_id, resume, &command.join(" "))
                .instrument(span)
                .await
        }
        Command::Sessions { state } => print_json(&rt.sessions.list(state.map(Into::into))),
        Command::Resumable => print_json(&rt.resume_handler().list_resumable()),
        Command::Check { task_id } => {
            let (resumable, reason) = rt.resume_handler().can_resume(&task_id);
            print_json(&serde_json::json!({
                "task_id": task_id,
                "resumable": resumable,
                "reason": reason,
            }))
        }
        Command::Metrics { samples } => {
            let monitor = Arc::clone(&rt.monitor);
            let count = samples.max(1);
            let readings = tokio::task::spawn_blocking(move || {
                (0..count).map(|_| monitor.sample()).collect::<Result<Vec<_>>>()
            })
            .await
            .map_err(|err| AppError::Monitor(format!("sampling task panicked: {err}")))??;
            print_json(&serde_json::json!({
                "profile": rt.profile,
                "samples": readings,
                "alerts": rt.monitor.alerts(usize::try_from(count).unwrap_or(usize::MAX)),
            }))
        }
        Command::Cleanup => {
            let report = retention::purge(&rt.sessions, &rt.store, &rt.config.retention)?;
            print_json(&serde_json::json!({
                "sessions_removed": report.sessions,
                "checkpoints_removed": report.checkpoints,
            }))
        }
    }
}

/// How a supervised child ended.
enum ChildOutcome {
    Exited(ExitStatus),
    Interrupted,
}

async fn supervise(
    rt: &Runtime,
    task_id: &str,
    agent_id: &str,
    resume: bool,
    command: &str,
) -> Result<()> {
    let mut plan = None;
    let mut resume_env = None;
    if resume {
        match rt.resume_handler().prepare(task_id) {
            Ok(prepared) => {
                info!(progress = prepared.progress, "resuming from checkpoint");
                resume_env = Some(serde_json::to_string(&prepared.restored_context)?);
                plan = Some(prepared);
            }
            Err(err) => warn!(%err, "no resumable checkpoint, starting fresh"),
        }
    }

    let orchestrator = Arc::new(LongDurationOrchestrator::new(
        &rt.config,
        rt.profile,
        rt.store.clone(),
        Arc::clone(&rt.sessions),
    ));
    let pauser: Arc<dyn SessionPauser> = Arc::clone(&rt.sessions) as Arc<dyn SessionPauser>;
    let executor = Arc::new(ResourceAwareExecutor::new(
        Arc::clone(&rt.monitor),
        &rt.config.executor,
        rt.profile,
        Some(pauser),
    ));

    let ct = CancellationToken::new();
    let retention_handle = retention::spawn_retention_task(
        Arc::clone(&rt.sessions),
        rt.store.clone(),
        rt.config.retention.clone(),
        ct.clone(),
    );
    let signal_ct = ct.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_ct.cancel();
    });

    match &plan {
        Some(plan) => orchestrator.resume_from(plan)?,
        None => orchestrator.start(task_id, agent_id, command, None)?,
    };
    executor.start_monitoring()?;

    let outcome = executor
        .execute(|| run_child(command, resume_env.as_deref(), &ct))
        .await;
    let result = settle(&orchestrator, task_id, outcome);

    ct.cancel();
    let timeout = Duration::from_secs(rt.config.durability.stop_timeout_seconds);
    executor.stop_monitoring(timeout).await;
    orchestrator.stop().await;
    if tokio::time::timeout(timeout, retention_handle).await.is_err() {
        warn!("retention task stop requested, completion unconfirmed");
    }
    result
}

/// Close out the task according to how the command ended.
fn settle(
    orchestrator: &LongDurationOrchestrator,
    task_id: &str,
    outcome: Result<ChildOutcome>,
) -> Result<()> {
    match outcome {
        Ok(ChildOutcome::Exited(status)) if status.success() => {
            orchestrator.complete(task_id)?;
            info!("command finished");
            Ok(())
        }
        Ok(ChildOutcome::Exited(status)) => {
            let message = format!("command exited with {status}");
            let recovery = orchestrator.handle_failure(task_id, FailureType::Error, &message, None)?;
            print_json(&serde_json::json!({
                "failure": recovery.failure,
                "strategy": recovery.strategy,
                "checkpoint_progress": recovery.checkpoint.map(|cp| cp.progress),
            }))?;
            Err(AppError::TaskFailed(message))
        }
        Ok(ChildOutcome::Interrupted) => {
            orchestrator.pause_task(task_id, "interrupted by signal")?;
            info!("task paused; rerun with --resume to continue");
            Ok(())
        }
        Err(AppError::ResourceExhaustedPause(reason)) => {
            orchestrator.pause_task(task_id, &reason)?;
            warn!(%reason, "resources exhausted, task paused before launch");
            Err(AppError::ResourceExhaustedPause(reason))
        }
        Err(err) => {
            orchestrator.handle_failure(task_id, FailureType::Crash, &err.to_string(), None)?;
            Err(err)
        }
    }
}

async fn run_child(
    command: &str,
    resume_context: Option<&str>,
    ct: &CancellationToken,
) -> Result<ChildOutcome> {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command).kill_on_drop(true);
    if let Some(context) = resume_context {
        cmd.env(RESUME_CONTEXT_ENV, context);
    }
    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Io(format!("failed to spawn command: {err}")))?;
    info!(pid = ?child.id(), "command started");

    tokio::select! {
        status = child.wait() => Ok(ChildOutcome::Exited(status?)),
        () = ct.cancelled() => {
            if let Err(err) = child.kill().await {
                error!(%err, "failed to kill command");
            }
            Ok(ChildOutcome::Interrupted)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
