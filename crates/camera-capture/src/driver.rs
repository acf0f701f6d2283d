//! Hardware collaborator traits
//!
//! A `CameraDriver` opens handles; a `CameraHandle` is one exclusive,
//! stateful connection to the stereo camera. Handles are not internally
//! synchronized: callers must serialize every call on a handle.

use std::path::Path;

use crate::frame::{DepthMap, ImageBuffer, View};
use crate::imu::TelemetrySample;
use crate::{CameraConfig, CameraError, SettingValue, VideoSetting, WriteParams};

/// Outcome of a single grab call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrabStatus {
    /// A new frame is ready
    Success,
    /// Frame arrived damaged; the best-effort buffer is still usable
    CorruptedFrame,
    /// Grab failed, may succeed on retry
    TransientFailure(String),
    /// Input exhausted (playback sources only)
    EndOfInput,
}

impl GrabStatus {
    /// Whether buffers from this grab can be retrieved and written
    pub fn has_frame(&self) -> bool {
        matches!(self, GrabStatus::Success | GrabStatus::CorruptedFrame)
    }
}

/// Opens camera handles with a given configuration
pub trait CameraDriver: Send + Sync {
    /// Open a new handle; fails if the hardware is busy or unplugged
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CameraHandle>, CameraError>;
}

/// One opened camera
pub trait CameraHandle: Send {
    /// Block until the next frame is captured
    fn grab(&mut self) -> GrabStatus;

    /// Image of the last grabbed frame
    fn retrieve_image(&mut self, view: View) -> Result<ImageBuffer, CameraError>;

    /// Depth measurement of the last grabbed frame
    fn retrieve_depth(&mut self) -> Result<DepthMap, CameraError>;

    /// Start writing every grabbed frame to `params.path` (unpaused).
    ///
    /// Returns `CameraError::WriteBusy` when another target is active and
    /// the hardware cannot write two targets at once.
    fn enable_write(&mut self, params: &WriteParams) -> Result<(), CameraError>;

    /// Pause or resume all active write targets
    fn pause_write(&mut self, paused: bool);

    /// Finalize and close the write target at `path`
    fn disable_write(&mut self, path: &Path);

    /// Current IMU / barometer / magnetometer reading
    fn sensors(&mut self) -> Result<TelemetrySample, CameraError>;

    fn setting(&self, setting: VideoSetting) -> Result<i32, CameraError>;

    fn set_setting(&mut self, setting: VideoSetting, value: SettingValue)
        -> Result<(), CameraError>;

    /// Release the hardware. Further calls fail.
    fn close(&mut self);
}
