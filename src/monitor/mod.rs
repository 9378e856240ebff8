//! Resource monitor: samples host metrics, keeps a bounded history, and
//! raises threshold alerts.
//!
//! The monitor knows nothing about tasks or sessions; it is a sensor that
//! the executor and the session monitor read from.

pub mod source;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use self::source::{MetricsSource, SystemSource};
use crate::config::{MonitorConfig, ThresholdPair};
use crate::models::metrics::{AlertLevel, ResourceAlert, ResourceKind, ResourceMetrics};
use crate::{AppError, Result};

/// Rolling sample and alert history.
#[derive(Debug, Default)]
struct MonitorState {
    history: VecDeque<ResourceMetrics>,
    alerts: VecDeque<ResourceAlert>,
}

/// Host resource sensor with bounded history.
pub struct ResourceMonitor {
    source: Arc<dyn MetricsSource>,
    cpu: ThresholdPair,
    memory: ThresholdPair,
    disk: ThresholdPair,
    history_capacity: usize,
    alert_capacity: usize,
    state: Mutex<MonitorState>,
}

impl ResourceMonitor {
    /// Monitor reading from `source` with thresholds and capacities from `config`.
    #[must_use]
    pub fn new(source: Arc<dyn MetricsSource>, config: &MonitorConfig) -> Self {
        Self {
            source,
            cpu: config.cpu,
            memory: config.memory,
            disk: config.disk,
            history_capacity: config.history_capacity.max(1),
            alert_capacity: config.alert_capacity.max(1),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// Monitor reading the host through [`SystemSource`].
    #[must_use]
    pub fn system(config: &MonitorConfig) -> Self {
        let source = SystemSource::new(
            config.disk_path.clone(),
            Duration::from_millis(config.cpu_sample_millis),
        );
        Self::new(Arc::new(source), config)
    }

    /// Take a sample, record it, and evaluate alert thresholds.
    ///
    /// Blocks for the source's CPU averaging interval.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Monitor` if the source cannot be read.
    pub fn sample(&self) -> Result<ResourceMetrics> {
        let metrics = self.source.read()?;
        let alerts = self.evaluate(&metrics);

        let mut state = self.lock()?;
        state.history.push_back(metrics.clone());
        while state.history.len() > self.history_capacity {
            state.history.pop_front();
        }
        for alert in alerts {
            warn!(
                resource = alert.resource.as_str(),
                level = ?alert.level,
                value = alert.value,
                threshold = alert.threshold,
                "resource alert"
            );
            state.alerts.push_back(alert);
        }
        while state.alerts.len() > self.alert_capacity {
            state.alerts.pop_front();
        }
        drop(state);

        debug!(
            cpu = metrics.cpu_percent,
            memory = metrics.memory_percent,
            disk = metrics.disk_percent,
            "resource sample"
        );
        Ok(metrics)
    }

    /// Alerts a sample would raise, at most one per resource.
    #[must_use]
    pub fn evaluate(&self, metrics: &ResourceMetrics) -> Vec<ResourceAlert> {
        [
            (ResourceKind::Cpu, metrics.cpu_percent, self.cpu),
            (ResourceKind::Memory, metrics.memory_percent, self.memory),
            (ResourceKind::Disk, metrics.disk_percent, self.disk),
        ]
        .into_iter()
        .filter_map(|(resource, value, pair)| {
            let (level, threshold) = if value >= pair.critical {
                (AlertLevel::Critical, pair.critical)
            } else if value >= pair.warning {
                (AlertLevel::Warning, pair.warning)
            } else {
                return None;
            };
            Some(ResourceAlert {
                timestamp: metrics.timestamp,
                resource,
                level,
                value,
                threshold,
                message: format!(
                    "{} usage {value:.1}% reached {threshold:.1}%",
                    resource.as_str()
                ),
            })
        })
        .collect()
    }

    /// Mean of the samples taken in the last `window_seconds`.
    ///
    /// Network counters and the timestamp come from the newest sample.
    /// Returns `None` if no sample falls inside the window.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn average(&self, window_seconds: u64) -> Option<ResourceMetrics> {
        let window = chrono::Duration::seconds(i64::try_from(window_seconds).unwrap_or(i64::MAX));
        let cutoff = Utc::now() - window;
        let state = self.lock().ok()?;
        let recent: Vec<&ResourceMetrics> = state
            .history
            .iter()
            .filter(|sample| sample.timestamp >= cutoff)
            .collect();
        let newest = (*recent.last()?).clone();
        let n = recent.len() as f64;
        let mean = |field: fn(&ResourceMetrics) -> f64| -> f64 {
            recent.iter().map(|sample| field(sample)).sum::<f64>() / n
        };

        Some(ResourceMetrics {
            cpu_percent: mean(|m| m.cpu_percent),
            memory_percent: mean(|m| m.memory_percent),
            memory_used_mb: mean(|m| m.memory_used_mb),
            memory_available_mb: mean(|m| m.memory_available_mb),
            disk_percent: mean(|m| m.disk_percent),
            disk_used_gb: mean(|m| m.disk_used_gb),
            disk_free_gb: mean(|m| m.disk_free_gb),
            ..newest
        })
    }

    /// The `recent_n` most recent alerts, oldest first.
    #[must_use]
    pub fn alerts(&self, recent_n: usize) -> Vec<ResourceAlert> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let skip = state.alerts.len().saturating_sub(recent_n);
        state.alerts.iter().skip(skip).cloned().collect()
    }

    /// Newest recorded sample.
    #[must_use]
    pub fn latest(&self) -> Option<ResourceMetrics> {
        self.lock().ok()?.history.back().cloned()
    }

    /// Number of samples currently retained.
    #[must_use]
    pub fn history_len(&self) -> usize {
        self.lock().map_or(0, |state| state.history.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, MonitorState>> {
        self.state
            .lock()
            .map_err(|_| AppError::InvalidState("resource monitor mutex poisoned".into()))
    }
}
