//! Hardware profile classification supplied by an external detector.
//!
//! The supervisor never inspects the host itself; it consumes whatever
//! profile the detector reports and scales thresholds and intervals from it.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Capacity class of the host.
#[derive(
    Debug, Copy, Clone, Default, Eq, PartialEq, Hash, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum HardwareProfile {
    /// Small machines: compress checkpoints, checkpoint more often, pause earlier.
    Constrained,
    /// Developer workstations.
    Development,
    /// Ordinary servers.
    #[default]
    Standard,
    /// Large machines: relaxed thresholds, less frequent sampling.
    HighCapacity,
}

impl HardwareProfile {
    /// Whether checkpoints should be gzip-compressed on this host.
    #[must_use]
    pub fn compress_checkpoints(self) -> bool {
        self == Self::Constrained
    }

    /// Multiplier applied to the base checkpoint interval.
    #[must_use]
    pub fn checkpoint_interval_scale(self) -> f64 {
        match self {
            Self::Constrained => 0.8,
            Self::Development | Self::Standard => 1.0,
            Self::HighCapacity => 1.2,
        }
    }

    /// Multiplier applied to the executor's sampling interval.
    #[must_use]
    pub fn sample_interval_scale(self) -> f64 {
        match self {
            Self::HighCapacity => 2.0,
            _ => 1.0,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Constrained => "constrained",
            Self::Development => "development",
            Self::Standard => "standard",
            Self::HighCapacity => "high_capacity",
        }
    }
}

impl Display for HardwareProfile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardwareProfile {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "constrained" => Ok(Self::Constrained),
            "development" => Ok(Self::Development),
            "standard" => Ok(Self::Standard),
            "high_capacity" => Ok(Self::HighCapacity),
            other => Err(AppError::Config(format!(
                "unknown hardware profile '{other}'"
            ))),
        }
    }
}

/// External collaborator reporting the host's capacity class.
pub trait HardwareDetector: Send + Sync {
    /// Classify the current host.
    fn detect(&self) -> HardwareProfile;
}

/// Detector that always reports a fixed profile (usually from configuration).
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticDetector(pub HardwareProfile);

impl HardwareDetector for StaticDetector {
    fn detect(&self) -> HardwareProfile {
        self.0
    }
}
