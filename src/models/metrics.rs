//! Resource samples and threshold alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time host resource sample.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ResourceMetrics {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Busy CPU share across all cores, 0-100.
    pub cpu_percent: f64,
    /// Used memory share, 0-100.
    pub memory_percent: f64,
    /// Used memory in MiB.
    pub memory_used_mb: f64,
    /// Available memory in MiB.
    pub memory_available_mb: f64,
    /// Used disk share of the monitored mount, 0-100.
    pub disk_percent: f64,
    /// Used disk space in GiB.
    pub disk_used_gb: f64,
    /// Free disk space in GiB.
    pub disk_free_gb: f64,
    /// Cumulative bytes sent on non-loopback interfaces.
    #[serde(default)]
    pub network_sent_bytes: Option<u64>,
    /// Cumulative bytes received on non-loopback interfaces.
    #[serde(default)]
    pub network_recv_bytes: Option<u64>,
}

impl ResourceMetrics {
    /// Sample stamped now with only the percentage fields populated.
    ///
    /// Useful for policy evaluation where absolute sizes do not matter.
    #[must_use]
    pub fn from_percentages(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent,
            memory_used_mb: 0.0,
            memory_available_mb: 0.0,
            disk_percent,
            disk_used_gb: 0.0,
            disk_free_gb: 0.0,
            network_sent_bytes: None,
            network_recv_bytes: None,
        }
    }
}

/// Which resource an alert refers to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Processor utilisation.
    Cpu,
    /// Physical memory.
    Memory,
    /// Disk space on the monitored mount.
    Disk,
}

impl ResourceKind {
    /// Lowercase name for messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Disk => "disk",
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    /// Above the warning threshold.
    Warning,
    /// Above the critical threshold.
    Critical,
}

/// A sample crossing a configured threshold.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ResourceAlert {
    /// Timestamp of the triggering sample.
    pub timestamp: DateTime<Utc>,
    /// Resource that crossed its threshold.
    pub resource: ResourceKind,
    /// Severity.
    pub level: AlertLevel,
    /// Observed value.
    pub value: f64,
    /// Threshold that was crossed.
    pub threshold: f64,
    /// Human-readable summary.
    pub message: String,
}
