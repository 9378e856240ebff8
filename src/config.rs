//! Global configuration parsing and validation.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::hardware::HardwareProfile;
use crate::orchestrator::durability::DurabilityLevel;
use crate::{AppError, Result};

/// Environment variable overriding the configured hardware profile.
pub const HARDWARE_PROFILE_ENV: &str = "LONGHAUL_HARDWARE_PROFILE";

/// Warning/critical pair for a single resource.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ThresholdPair {
    /// Percentage at which a warning alert is raised.
    pub warning: f64,
    /// Percentage at which a critical alert is raised.
    pub critical: f64,
}

/// Resource monitor settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct MonitorConfig {
    /// Samples retained in the rolling history.
    pub history_capacity: usize,
    /// Alerts retained in the rolling alert log.
    pub alert_capacity: usize,
    /// CPU averaging interval for a single sample.
    pub cpu_sample_millis: u64,
    /// Mount point whose usage is reported.
    pub disk_path: PathBuf,
    /// CPU alert thresholds.
    pub cpu: ThresholdPair,
    /// Memory alert thresholds.
    pub memory: ThresholdPair,
    /// Disk alert thresholds.
    pub disk: ThresholdPair,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            alert_capacity: 100,
            cpu_sample_millis: 100,
            disk_path: PathBuf::from("/"),
            cpu: ThresholdPair {
                warning: 80.0,
                critical: 95.0,
            },
            memory: ThresholdPair {
                warning: 85.0,
                critical: 95.0,
            },
            disk: ThresholdPair {
                warning: 85.0,
                critical: 95.0,
            },
        }
    }
}

/// Resource-aware executor settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct ExecutorConfig {
    /// Seconds between background samples.
    pub sample_interval_seconds: u64,
    /// CPU percentage that pauses execution.
    pub pause_cpu: f64,
    /// Memory percentage that pauses execution.
    pub pause_memory: f64,
    /// Disk percentage that pauses execution.
    pub pause_disk: f64,
    /// CPU percentage below which a paused executor may resume.
    pub resume_cpu: f64,
    /// Memory percentage below which a paused executor may resume.
    pub resume_memory: f64,
    /// CPU percentage that degrades execution.
    pub degrade_cpu: f64,
    /// Memory percentage that degrades execution.
    pub degrade_memory: f64,
    /// Executor alerts retained.
    pub alert_log_capacity: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            sample_interval_seconds: 30,
            pause_cpu: 85.0,
            pause_memory: 90.0,
            pause_disk: 95.0,
            resume_cpu: 50.0,
            resume_memory: 70.0,
            degrade_cpu: 75.0,
            degrade_memory: 80.0,
            alert_log_capacity: 100,
        }
    }
}

/// Checkpoint cadence settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct DurabilityConfig {
    /// Cadence level.
    pub level: DurabilityLevel,
    /// Seconds between background checkpoint-loop ticks.
    pub loop_interval_seconds: u64,
    /// Progress snapshots retained in memory per task.
    pub progress_history: usize,
    /// Seconds to wait for background loops to stop.
    pub stop_timeout_seconds: u64,
    /// Newest checkpoints kept inline in each session file.
    pub session_checkpoint_limit: usize,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            level: DurabilityLevel::Standard,
            loop_interval_seconds: 30,
            progress_history: 100,
            stop_timeout_seconds: 5,
            session_checkpoint_limit: 32,
        }
    }
}

/// Retention settings for terminal sessions and old checkpoints.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct RetentionConfig {
    /// Terminal sessions idle longer than this are deleted.
    pub session_max_age_hours: u64,
    /// Checkpoints older than this are deleted.
    pub checkpoint_max_age_hours: u64,
    /// Seconds between purge runs.
    pub purge_interval_seconds: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            session_max_age_hours: 168,
            checkpoint_max_age_hours: 720,
            purge_interval_seconds: 3600,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".longhaul")
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

/// Global configuration parsed from `longhaul.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Root directory for checkpoints, sessions and journals.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory artifact paths are resolved against.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    /// Host capacity class reported by the external detector.
    #[serde(default)]
    pub hardware_profile: HardwareProfile,
    /// Resource monitor settings.
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Checkpoint cadence settings.
    #[serde(default)]
    pub durability: DurabilityConfig,
    /// Retention settings.
    #[serde(default)]
    pub retention: RetentionConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            project_root: default_project_root(),
            hardware_profile: HardwareProfile::default(),
            monitor: MonitorConfig::default(),
            executor: ExecutorConfig::default(),
            durability: DurabilityConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply the hardware profile override from the environment, if set.
    ///
    /// An unparseable value is logged and ignored.
    pub fn apply_env_overrides(&mut self) {
        let Ok(raw) = env::var(HARDWARE_PROFILE_ENV) else {
            return;
        };
        match raw.parse::<HardwareProfile>() {
            Ok(profile) => self.hardware_profile = profile,
            Err(err) => warn!(%err, value = raw, "ignoring invalid hardware profile override"),
        }
    }

    /// Directory holding checkpoint files.
    #[must_use]
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    /// Directory holding session files.
    #[must_use]
    pub fn session_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// Directory holding progress journals.
    #[must_use]
    pub fn progress_dir(&self) -> PathBuf {
        self.data_dir.join("progress")
    }

    /// Directory holding failure journals.
    #[must_use]
    pub fn failure_dir(&self) -> PathBuf {
        self.data_dir.join("failures")
    }

    /// Directory holding artifact backups.
    #[must_use]
    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir.join("backups")
    }

    fn validate(&self) -> Result<()> {
        for (name, pair) in [
            ("monitor.cpu", self.monitor.cpu),
            ("monitor.memory", self.monitor.memory),
            ("monitor.disk", self.monitor.disk),
        ] {
            check_percent(&format!("{name}.warning"), pair.warning)?;
            check_percent(&format!("{name}.critical"), pair.critical)?;
            if pair.warning > pair.critical {
                return Err(AppError::Config(format!(
                    "{name}.warning must not exceed {name}.critical"
                )));
            }
        }

        let exec = &self.executor;
        for (name, value) in [
            ("executor.pause_cpu", exec.pause_cpu),
            ("executor.pause_memory", exec.pause_memory),
            ("executor.pause_disk", exec.pause_disk),
            ("executor.resume_cpu", exec.resume_cpu),
            ("executor.resume_memory", exec.resume_memory),
            ("executor.degrade_cpu", exec.degrade_cpu),
            ("executor.degrade_memory", exec.degrade_memory),
        ] {
            check_percent(name, value)?;
        }
        if exec.resume_cpu >= exec.pause_cpu || exec.resume_memory >= exec.pause_memory {
            return Err(AppError::Config(
                "executor resume thresholds must be below pause thresholds".into(),
            ));
        }

        for (name, value) in [
            (
                "monitor.history_capacity",
                u64::try_from(self.monitor.history_capacity).unwrap_or(u64::MAX),
            ),
            (
                "monitor.alert_capacity",
                u64::try_from(self.monitor.alert_capacity).unwrap_or(u64::MAX),
            ),
            ("monitor.cpu_sample_millis", self.monitor.cpu_sample_millis),
            (
                "executor.sample_interval_seconds",
                exec.sample_interval_seconds,
            ),
            (
                "executor.alert_log_capacity",
                u64::try_from(exec.alert_log_capacity).unwrap_or(u64::MAX),
            ),
            (
                "durability.loop_interval_seconds",
                self.durability.loop_interval_seconds,
            ),
            (
                "durability.progress_history",
                u64::try_from(self.durability.progress_history).unwrap_or(u64::MAX),
            ),
            (
                "durability.session_checkpoint_limit",
                u64::try_from(self.durability.session_checkpoint_limit).unwrap_or(u64::MAX),
            ),
            (
                "retention.purge_interval_seconds",
                self.retention.purge_interval_seconds,
            ),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        Ok(())
    }
}

fn check_percent(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(AppError::Config(format!(
            "{name} must be within (0, 100], got {value}"
        )))
    }
}
