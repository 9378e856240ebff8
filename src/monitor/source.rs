//! Metric sources feeding the [`ResourceMonitor`](super::ResourceMonitor).
//!
//! [`SystemSource`] reads Linux `/proc` counters and `statvfs` for the
//! monitored mount. [`ReplaySource`] hands out scripted samples.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;

use crate::models::metrics::ResourceMetrics;
use crate::{AppError, Result};

const MIB: f64 = 1024.0 * 1024.0;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Anything able to produce a resource sample.
pub trait MetricsSource: Send + Sync {
    /// Take one sample. May block for a short, bounded interval.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Monitor` if the underlying counters are unreadable.
    fn read(&self) -> Result<ResourceMetrics>;
}

/// Host metrics from `/proc` and `statvfs`.
#[derive(Debug, Clone)]
pub struct SystemSource {
    proc_root: PathBuf,
    disk_path: PathBuf,
    cpu_interval: Duration,
}

impl SystemSource {
    /// Source averaging CPU over `cpu_interval` and reporting `disk_path`'s mount.
    #[must_use]
    pub fn new(disk_path: impl Into<PathBuf>, cpu_interval: Duration) -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            disk_path: disk_path.into(),
            cpu_interval,
        }
    }

    /// Read `/proc`-format files from another root.
    #[must_use]
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    fn read_proc(&self, name: &str) -> Result<String> {
        let path = self.proc_root.join(name);
        fs::read_to_string(&path)
            .map_err(|err| AppError::Monitor(format!("cannot read {}: {err}", path.display())))
    }

    fn cpu_percent(&self) -> Result<f64> {
        let first = parse_cpu_times(&self.read_proc("stat")?)?;
        std::thread::sleep(self.cpu_interval);
        let second = parse_cpu_times(&self.read_proc("stat")?)?;
        Ok(cpu_busy_percent(first, second))
    }
}

impl MetricsSource for SystemSource {
    #[allow(clippy::cast_precision_loss)]
    fn read(&self) -> Result<ResourceMetrics> {
        let cpu_percent = self.cpu_percent()?;
        let memory = parse_meminfo(&self.read_proc("meminfo")?)?;
        let disk = disk_usage(&self.disk_path)?;
        let network = self
            .read_proc("net/dev")
            .ok()
            .and_then(|raw| parse_net_dev(&raw));

        let used = memory.total_bytes.saturating_sub(memory.available_bytes);
        Ok(ResourceMetrics {
            timestamp: Utc::now(),
            cpu_percent,
            memory_percent: percent(used, memory.total_bytes),
            memory_used_mb: used as f64 / MIB,
            memory_available_mb: memory.available_bytes as f64 / MIB,
            disk_percent: percent(disk.used_bytes, disk.used_bytes + disk.free_bytes),
            disk_used_gb: disk.used_bytes as f64 / GIB,
            disk_free_gb: disk.free_bytes as f64 / GIB,
            network_sent_bytes: network.map(|(_, sent)| sent),
            network_recv_bytes: network.map(|(recv, _)| recv),
        })
    }
}

/// Aggregate jiffies from the first `cpu` line of `/proc/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

fn parse_cpu_times(stat: &str) -> Result<CpuTimes> {
    let line = stat
        .lines()
        .find(|line| line.starts_with("cpu "))
        .ok_or_else(|| AppError::Monitor("no aggregate cpu line in stat".into()))?;

    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .map(str::parse)
        .collect::<std::result::Result<_, _>>()
        .map_err(|err| AppError::Monitor(format!("bad cpu counter: {err}")))?;
    if fields.len() < 4 {
        return Err(AppError::Monitor("cpu line has too few counters".into()));
    }

    // user nice system idle iowait irq softirq steal; guest time is already in user.
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    let total = fields.iter().take(8).sum();
    Ok(CpuTimes { idle, total })
}

#[allow(clippy::cast_precision_loss)]
fn cpu_busy_percent(first: CpuTimes, second: CpuTimes) -> f64 {
    let total = second.total.saturating_sub(first.total);
    if total == 0 {
        return 0.0;
    }
    let idle = second.idle.saturating_sub(first.idle).min(total);
    (total - idle) as f64 / total as f64 * 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MemoryInfo {
    total_bytes: u64,
    available_bytes: u64,
}

fn parse_meminfo(raw: &str) -> Result<MemoryInfo> {
    let field = |name: &str| -> Option<u64> {
        raw.lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|value| value.parse::<u64>().ok())
            .map(|kib| kib * 1024)
    };

    let total_bytes =
        field("MemTotal").ok_or_else(|| AppError::Monitor("meminfo lacks MemTotal".into()))?;
    let available_bytes = field("MemAvailable").unwrap_or_else(|| {
        field("MemFree").unwrap_or(0) + field("Buffers").unwrap_or(0) + field("Cached").unwrap_or(0)
    });
    Ok(MemoryInfo {
        total_bytes,
        available_bytes: available_bytes.min(total_bytes),
    })
}

/// Sum of (received, sent) bytes over non-loopback interfaces.
fn parse_net_dev(raw: &str) -> Option<(u64, u64)> {
    let mut recv = 0u64;
    let mut sent = 0u64;
    let mut seen = false;
    for line in raw.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() >= 9 {
            recv = recv.saturating_add(fields[0]);
            sent = sent.saturating_add(fields[8]);
            seen = true;
        }
    }
    seen.then_some((recv, sent))
}

#[derive(Debug, Clone, Copy)]
struct DiskUsage {
    used_bytes: u64,
    free_bytes: u64,
}

#[cfg(unix)]
#[allow(clippy::useless_conversion)]
fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|err| AppError::Monitor(format!("statvfs {} failed: {err}", path.display())))?;
    let fragment = u64::from(stat.fragment_size());
    let blocks = u64::from(stat.blocks());
    let free = u64::from(stat.blocks_free());
    let available = u64::from(stat.blocks_available());
    Ok(DiskUsage {
        used_bytes: blocks.saturating_sub(free).saturating_mul(fragment),
        free_bytes: available.saturating_mul(fragment),
    })
}

#[cfg(not(unix))]
fn disk_usage(path: &Path) -> Result<DiskUsage> {
    Err(AppError::Monitor(format!(
        "disk usage for {} is unsupported on this platform",
        path.display()
    )))
}

#[allow(clippy::cast_precision_loss)]
fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Scripted source: yields queued samples in order, then repeats the last one.
///
/// Each sample is re-stamped with the time it is read.
#[derive(Debug, Default)]
pub struct ReplaySource {
    state: Mutex<ReplayState>,
}

#[derive(Debug, Default)]
struct ReplayState {
    queue: VecDeque<ResourceMetrics>,
    last: Option<ResourceMetrics>,
}

impl ReplaySource {
    /// Source preloaded with `samples`.
    #[must_use]
    pub fn new(samples: impl IntoIterator<Item = ResourceMetrics>) -> Self {
        Self {
            state: Mutex::new(ReplayState {
                queue: samples.into_iter().collect(),
                last: None,
            }),
        }
    }

    /// Source that always reports the given percentages.
    #[must_use]
    pub fn constant(cpu_percent: f64, memory_percent: f64, disk_percent: f64) -> Self {
        Self::new([ResourceMetrics::from_percentages(
            cpu_percent,
            memory_percent,
            disk_percent,
        )])
    }

    /// Queue another sample.
    pub fn push(&self, sample: ResourceMetrics) {
        if let Ok(mut state) = self.state.lock() {
            state.queue.push_back(sample);
        }
    }

    /// Drop queued samples and report `sample` from now on.
    pub fn set(&self, sample: ResourceMetrics) {
        if let Ok(mut state) = self.state.lock() {
            state.queue.clear();
            state.queue.push_back(sample);
        }
    }
}

impl MetricsSource for ReplaySource {
    fn read(&self) -> Result<ResourceMetrics> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| AppError::Monitor("replay source mutex poisoned".into()))?;
        if let Some(next) = state.queue.pop_front() {
            state.last = Some(next);
        }
        let mut sample = state
            .last
            .clone()
            .ok_or_else(|| AppError::Monitor("replay source has no samples".into()))?;
        sample.timestamp = Utc::now();
        Ok(sample)
    }
}
