use crate::{Error, Result};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use vision_capture::{CaptureConfig, Resolution};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Max allowed timestamp spread within one batch (ms).
    pub tolerant_interval_ms: i64,
    /// Max wall-clock time for one synchronization attempt (s).
    pub timeout_s: f64,
    /// Camera frame rate; only sizes the batch cache lifetime.
    pub frame_rate_hz: f64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            tolerant_interval_ms: 30,
            timeout_s: 2.0,
            frame_rate_hz: 60.0,
        }
    }
}

impl CollectorConfig {
    pub fn timeout(&self) -> Result<Duration> {
        Duration::try_from_secs_f64(self.timeout_s)
            .map_err(|e| Error::Config(format!("timeout_s {}: {e}", self.timeout_s)))
    }

    /// How long a synchronized batch stays valid: one frame period.
    pub fn cache_ttl(&self) -> Result<Duration> {
        if self.frame_rate_hz.is_nan() || self.frame_rate_hz <= 0.0 {
            return Err(Error::Config(format!(
                "frame_rate_hz must be positive, got {}",
                self.frame_rate_hz
            )));
        }
        Duration::try_from_secs_f64(1.0 / self.frame_rate_hz)
            .map_err(|e| Error::Config(format!("frame_rate_hz {}: {e}", self.frame_rate_hz)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.tolerant_interval_ms < 0 {
            return Err(Error::Config(format!(
                "tolerant_interval_ms must not be negative, got {}",
                self.tolerant_interval_ms
            )));
        }
        if self.timeout_s.is_nan() || self.timeout_s <= 0.0 {
            return Err(Error::Config(format!(
                "timeout_s must be positive, got {}",
                self.timeout_s
            )));
        }
        self.timeout()?;
        self.cache_ttl()?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub request_width: u32,
    pub request_height: u32,
    pub stall_timeout_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            request_width: 640,
            request_height: 480,
            stall_timeout_ms: 1000,
        }
    }
}

impl CaptureSettings {
    pub fn to_capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            requested: Resolution::new(self.request_width, self.request_height),
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
        }
    }
}

/// Chessboard geometry in inner corners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub rows: u32,
    pub cols: u32,
    pub square_size: f64,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            rows: 6,
            cols: 9,
            square_size: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Joint detections required per camera pair before solving.
    pub target_samples: usize,
    pub tick_interval_ms: u64,
    pub board: BoardConfig,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            target_samples: 10,
            tick_interval_ms: 200,
            board: BoardConfig::default(),
        }
    }
}

/// Largest accepted board side, in inner corners.
pub const MAX_BOARD_CORNERS: u32 = 1_000;

impl CalibrationConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_samples == 0 {
            return Err(Error::Config("target_samples must be at least 1".into()));
        }
        if self.board.rows < 2 || self.board.cols < 2 {
            return Err(Error::Config(format!(
                "board must have at least 2x2 inner corners, got {}x{}",
                self.board.rows, self.board.cols
            )));
        }
        if self.board.rows > MAX_BOARD_CORNERS || self.board.cols > MAX_BOARD_CORNERS {
            return Err(Error::Config(format!(
                "board must have at most {MAX_BOARD_CORNERS} inner corners per side, got {}x{}",
                self.board.rows, self.board.cols
            )));
        }
        if self.board.square_size.is_nan() || self.board.square_size <= 0.0 {
            return Err(Error::Config(format!(
                "square_size must be positive, got {}",
                self.board.square_size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RigConfig {
    pub collector: CollectorConfig,
    pub capture: CaptureSettings,
    pub calibration: CalibrationConfig,
}

impl RigConfig {
    pub fn validate(&self) -> Result<()> {
        self.collector.validate()?;
        self.calibration.validate()
    }
}

pub fn load_config_file(path: impl AsRef<Path>) -> anyhow::Result<RigConfig> {
    let path = path.as_ref();
    let raw =
        fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
    let config: RigConfig =
        serde_yaml::from_str(&raw).with_context(|| format!("parsing yaml: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("validating config: {}", path.display()))?;
    Ok(config)
}
