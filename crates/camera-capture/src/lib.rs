//! Camera Capture Library for Stereo Depth Recording
//!
//! Provides the exclusive capture device used by the field recorder.
//! Supports:
//! - Explicit-state device wrapper (Closed → Open → Writing)
//! - Simulated stereo camera for bench tests without hardware
//! - Vendor SDK binding (feature `vendor-sdk`)
//! - IMU / barometer / magnetometer telemetry samples

pub mod device;
pub mod driver;
#[cfg(feature = "vendor-sdk")]
pub mod ffi;
pub mod frame;
pub mod imu;
pub mod sim;

pub use device::{CaptureDevice, DeviceState, OpenRetry};
pub use driver::{CameraDriver, CameraHandle, GrabStatus};
pub use frame::{DepthMap, ImageBuffer, View};
pub use imu::{TelemetrySample, TELEMETRY_CSV_HEADER};
pub use sim::{SimConfig, SimState, SimulatedDriver};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Camera error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    Open(String),

    #[error("Camera not open")]
    NotOpen,

    #[error("Operation requires a {expected} device, device is {found}")]
    InvalidState {
        expected: &'static str,
        found: DeviceState,
    },

    #[error("Write target rejected: {0}")]
    Write(String),

    #[error("Hardware refused a second concurrent write target")]
    WriteBusy,

    #[error("Retrieve failed: {0}")]
    Retrieve(String),

    #[error("Sensor data unavailable: {0}")]
    Sensors(String),

    #[error("Camera setting rejected: {0}")]
    Setting(String),

    #[error("No free camera handle")]
    HandleLimit,
}

/// Sensor resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Hd2k,
    Hd1080,
    Hd720,
    Vga,
}

impl Resolution {
    /// Per-eye image dimensions
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::Hd2k => (2208, 1242),
            Resolution::Hd1080 => (1920, 1080),
            Resolution::Hd720 => (1280, 720),
            Resolution::Vga => (672, 376),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resolution::Hd2k => "HD2K",
            Resolution::Hd1080 => "HD1080",
            Resolution::Hd720 => "HD720",
            Resolution::Vga => "VGA",
        };
        f.write_str(name)
    }
}

/// Depth computation level
///
/// `None` disables the depth engine entirely; every other tier trades
/// compute for quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepthLevel {
    #[default]
    None,
    Performance,
    Quality,
    Ultra,
    NeuralLite,
    Neural,
    NeuralPlus,
}

impl DepthLevel {
    /// Tier selected when a depth-bearing mode needs depth and none was chosen
    pub const DEFAULT_TIER: DepthLevel = DepthLevel::NeuralLite;

    pub fn is_enabled(self) -> bool {
        self != DepthLevel::None
    }

    pub fn name(self) -> &'static str {
        match self {
            DepthLevel::None => "NONE",
            DepthLevel::Performance => "PERFORMANCE",
            DepthLevel::Quality => "QUALITY",
            DepthLevel::Ultra => "ULTRA",
            DepthLevel::NeuralLite => "NEURAL_LITE",
            DepthLevel::Neural => "NEURAL",
            DepthLevel::NeuralPlus => "NEURAL_PLUS",
        }
    }
}

impl fmt::Display for DepthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Parameters the hardware is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CameraConfig {
    /// Sensor resolution
    pub resolution: Resolution,
    /// Target frame rate
    pub fps: u32,
    /// Depth computation level
    pub depth: DepthLevel,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::Hd720,
            fps: 30,
            depth: DepthLevel::None,
        }
    }
}

impl fmt::Display for CameraConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}fps depth={}", self.resolution, self.fps, self.depth)
    }
}

/// Container compression policy for the hardware write target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    Lossless,
    H264,
    H265,
}

/// Continuous write-to-file request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteParams {
    /// Container file path
    pub path: PathBuf,
    /// Compression policy
    pub compression: Compression,
    /// Frame rate written to the container
    pub target_fps: u32,
}

impl WriteParams {
    pub fn new(path: impl Into<PathBuf>, compression: Compression, target_fps: u32) -> Self {
        Self {
            path: path.into(),
            compression,
            target_fps,
        }
    }
}

/// Adjustable video settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoSetting {
    Exposure,
    Gain,
}

/// Value of a video setting: automatic or a manual 0-100 level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingValue {
    Auto,
    Manual(u8),
}

impl SettingValue {
    /// Parse the operator representation (-1 = auto, 0..=100 = manual)
    pub fn from_raw(raw: i32) -> Result<Self, CameraError> {
        match raw {
            -1 => Ok(SettingValue::Auto),
            0..=100 => Ok(SettingValue::Manual(raw as u8)),
            other => Err(CameraError::Setting(format!(
                "value {} outside -1 (auto) or 0..=100",
                other
            ))),
        }
    }

    pub fn as_raw(self) -> i32 {
        match self {
            SettingValue::Auto => -1,
            SettingValue::Manual(v) => v as i32,
        }
    }
}
