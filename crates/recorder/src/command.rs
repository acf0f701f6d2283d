//! Command boundary for the external control layer
//!
//! Commands arrive either as JSON (`{"command":"set_mode","mode":"raw_multi_stream"}`)
//! or as operator console lines (`mode raw`). Every command yields a
//! [`CommandOutcome`]; failures carry the human-readable reason.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use camera_capture::{DepthLevel, View};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::controller::{Recorder, RecordingStatus};
use crate::error::RecorderError;
use crate::profile::{parse_depth_level, CaptureProfile, RecordingMode};

/// Snapshot view selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraView {
    #[default]
    Left,
    Right,
}

impl From<CameraView> for View {
    fn from(view: CameraView) -> Self {
        match view {
            CameraView::Left => View::Left,
            CameraView::Right => View::Right,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Start {
        #[serde(default)]
        duration_secs: Option<u64>,
    },
    Stop,
    SetMode {
        mode: RecordingMode,
    },
    SetDepthLevel {
        depth: DepthLevel,
    },
    SetResolution {
        profile: CaptureProfile,
    },
    SetExposure {
        value: i32,
    },
    SetGain {
        value: i32,
    },
    SetDepthRate {
        rate_hz: u32,
    },
    RotateSegment,
    /// Save the latest image as JPEG, or just report its size
    Snapshot {
        #[serde(default)]
        view: CameraView,
        #[serde(default)]
        path: Option<PathBuf>,
    },
    Status,
}

fn parse_number<T: FromStr>(what: &str, arg: Option<&str>) -> Result<T, String> {
    let arg = arg.ok_or_else(|| format!("{} needs a value", what))?;
    arg.parse()
        .map_err(|_| format!("invalid {} '{}'", what, arg))
}

impl FromStr for Command {
    type Err = String;

    /// Console syntax: `start [secs]`, `stop`, `mode <mode>`, `depth <level>`,
    /// `resolution <profile>`, `exposure <-1..100>`, `gain <-1..100>`,
    /// `depth-rate <hz>`, `rotate`, `snapshot [left|right] [path]`, `status`
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or("empty command")?.to_ascii_lowercase();
        let arg = words.next();

        let command = match verb.as_str() {
            "start" => Command::Start {
                duration_secs: arg.map(|a| parse_number("duration", Some(a))).transpose()?,
            },
            "stop" => Command::Stop,
            "mode" => Command::SetMode {
                mode: arg.ok_or("mode needs a value")?.parse()?,
            },
            "depth" => Command::SetDepthLevel {
                depth: parse_depth_level(arg.ok_or("depth needs a value")?)?,
            },
            "resolution" | "profile" => Command::SetResolution {
                profile: arg.ok_or("resolution needs a value")?.parse()?,
            },
            "exposure" => Command::SetExposure {
                value: parse_number("exposure", arg)?,
            },
            "gain" => Command::SetGain {
                value: parse_number("gain", arg)?,
            },
            "depth-rate" | "depth_rate" => Command::SetDepthRate {
                rate_hz: parse_number("depth rate", arg)?,
            },
            "rotate" => Command::RotateSegment,
            "snapshot" => {
                let (view, path) = match arg.map(str::to_ascii_lowercase).as_deref() {
                    Some("left") => (CameraView::Left, words.next()),
                    Some("right") => (CameraView::Right, words.next()),
                    _ => (CameraView::Left, arg),
                };
                Command::Snapshot {
                    view,
                    path: path.map(PathBuf::from),
                }
            }
            "status" => Command::Status,
            other => return Err(format!("unknown command '{}'", other)),
        };
        Ok(command)
    }
}

/// Result surfaced to the control layer
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordingStatus>,
}

impl CommandOutcome {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            status: None,
        }
    }

    fn failed(error: &RecorderError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            status: None,
        }
    }
}

impl Recorder {
    /// Run one command and report success or the failure reason
    pub fn execute(&self, command: Command) -> CommandOutcome {
        info!(command = ?command, "Command received");
        let result = match command {
            Command::Start { duration_secs } => self
                .start(duration_secs.map(Duration::from_secs))
                .map(|dir| format!("Recording started in {}", dir.display())),
            Command::Stop => self.stop().map(|summary| {
                format!(
                    "Recording stopped: {} frames, {} segment(s), {:.1} MB",
                    summary.frames,
                    summary.segments,
                    summary.bytes as f64 / (1024.0 * 1024.0)
                )
            }),
            Command::SetMode { mode } => self
                .set_mode(mode)
                .map(|_| format!("Mode {} (depth {})", mode, self.depth_level())),
            Command::SetDepthLevel { depth } => self
                .set_depth_level(depth)
                .map(|_| format!("Depth level {}", depth)),
            Command::SetResolution { profile } => self
                .set_resolution(profile)
                .map(|_| format!("Capture profile {}", profile)),
            Command::SetExposure { value } => self
                .set_exposure(value)
                .map(|_| format!("Exposure {}", value)),
            Command::SetGain { value } => self.set_gain(value).map(|_| format!("Gain {}", value)),
            Command::SetDepthRate { rate_hz } => {
                self.set_depth_rate(rate_hz);
                Ok(format!("Depth rate {} Hz", rate_hz))
            }
            Command::RotateSegment => self
                .rotate_segment()
                .map(|video| format!("Recording to {}", video.display())),
            Command::Snapshot { view, path } => self.snapshot_to(view.into(), path),
            Command::Status => {
                let status = self.status();
                return CommandOutcome {
                    success: true,
                    message: status.message.clone(),
                    status: Some(status),
                };
            }
        };

        match result {
            Ok(message) => CommandOutcome::ok(message),
            Err(e) => {
                warn!("Command rejected: {}", e);
                CommandOutcome::failed(&e)
            }
        }
    }

    fn snapshot_to(&self, view: View, path: Option<PathBuf>) -> Result<String, RecorderError> {
        let image = self.snapshot(view)?;
        let Some(path) = path else {
            return Ok(format!("{:?} image {}x{}", view, image.width, image.height));
        };
        let rgb = image.to_rgb().ok_or_else(|| {
            RecorderError::InvalidConfiguration("snapshot buffer does not match its size".into())
        })?;
        rgb.save(&path).map_err(|e| RecorderError::Output {
            path: path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::Other, e),
        })?;
        Ok(format!("Snapshot saved to {}", path.display()))
    }
}
