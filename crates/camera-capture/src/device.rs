//! Explicit-state wrapper around one camera handle

use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::driver::{CameraDriver, CameraHandle, GrabStatus};
use crate::frame::{DepthMap, ImageBuffer, View};
use crate::imu::TelemetrySample;
use crate::{CameraConfig, CameraError, SettingValue, VideoSetting, WriteParams};

/// Lifecycle state of a capture device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Closed,
    Open,
    Writing,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Closed => "closed",
            DeviceState::Open => "open",
            DeviceState::Writing => "writing",
        };
        f.write_str(name)
    }
}

/// Retry policy for opening the hardware
#[derive(Debug, Clone, Copy)]
pub struct OpenRetry {
    /// Retries after the first attempt
    pub retries: u32,
    /// Fixed wait between attempts
    pub backoff: Duration,
}

impl Default for OpenRetry {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Exclusive owner of one camera handle
///
/// `Closed → Open → Writing → Closed`. Methods that need the hardware
/// fail with `CameraError::NotOpen` on a closed device.
pub struct CaptureDevice {
    label: &'static str,
    handle: Option<Box<dyn CameraHandle>>,
    config: Option<CameraConfig>,
    targets: Vec<PathBuf>,
    paused: bool,
}

impl CaptureDevice {
    /// A device that holds no hardware
    pub fn closed(label: &'static str) -> Self {
        Self {
            label,
            handle: None,
            config: None,
            targets: Vec::new(),
            paused: false,
        }
    }

    /// Open the hardware, retrying transient USB failures
    pub fn open(
        driver: &dyn CameraDriver,
        config: &CameraConfig,
        retry: &OpenRetry,
        label: &'static str,
    ) -> Result<Self, CameraError> {
        info!(device = label, "Opening camera: {}", config);

        let mut attempt = 0;
        loop {
            match driver.open(config) {
                Ok(handle) => {
                    info!(device = label, attempt, "Camera opened");
                    return Ok(Self {
                        label,
                        handle: Some(handle),
                        config: Some(*config),
                        targets: Vec::new(),
                        paused: false,
                    });
                }
                Err(e) if attempt < retry.retries => {
                    attempt += 1;
                    warn!(
                        device = label,
                        "Open failed ({}), retry {}/{} in {:?}",
                        e,
                        attempt,
                        retry.retries,
                        retry.backoff
                    );
                    thread::sleep(retry.backoff);
                }
                Err(e) => {
                    error!(
                        device = label,
                        "Camera open failed after {} retries: {}", retry.retries, e
                    );
                    return Err(CameraError::Open(format!(
                        "{} (after {} retries)",
                        e, retry.retries
                    )));
                }
            }
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn state(&self) -> DeviceState {
        match (&self.handle, self.targets.is_empty()) {
            (None, _) => DeviceState::Closed,
            (Some(_), true) => DeviceState::Open,
            (Some(_), false) => DeviceState::Writing,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Configuration the hardware was opened with
    pub fn config(&self) -> Option<&CameraConfig> {
        self.config.as_ref()
    }

    /// Active write targets, oldest first
    pub fn write_targets(&self) -> &[PathBuf] {
        &self.targets
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn handle_mut(&mut self) -> Result<&mut Box<dyn CameraHandle>, CameraError> {
        self.handle.as_mut().ok_or(CameraError::NotOpen)
    }

    /// Grab the next frame
    pub fn grab(&mut self) -> Result<GrabStatus, CameraError> {
        Ok(self.handle_mut()?.grab())
    }

    pub fn retrieve_image(&mut self, view: View) -> Result<ImageBuffer, CameraError> {
        self.handle_mut()?.retrieve_image(view)
    }

    pub fn retrieve_depth(&mut self) -> Result<DepthMap, CameraError> {
        self.handle_mut()?.retrieve_depth()
    }

    pub fn sensors(&mut self) -> Result<TelemetrySample, CameraError> {
        self.handle_mut()?.sensors()
    }

    /// Start continuous write to `params.path`
    pub fn enable_write(&mut self, params: &WriteParams) -> Result<(), CameraError> {
        let handle = self.handle_mut()?;
        handle.enable_write(params)?;
        debug!(device = self.label, path = %params.path.display(), "Write enabled");
        self.targets.push(params.path.clone());
        self.paused = false;
        Ok(())
    }

    /// Pause or resume every active target
    pub fn pause_write(&mut self, paused: bool) {
        if self.targets.is_empty() {
            return;
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.pause_write(paused);
            self.paused = paused;
        }
    }

    /// Finalize one write target; a no-op for unknown paths
    pub fn disable_write(&mut self, path: &Path) {
        let Some(pos) = self.targets.iter().position(|p| p == path) else {
            debug!(device = self.label, path = %path.display(), "Disable for inactive target ignored");
            return;
        };
        if let Some(handle) = self.handle.as_mut() {
            handle.disable_write(path);
        }
        self.targets.remove(pos);
        if self.targets.is_empty() {
            self.paused = false;
        }
        debug!(device = self.label, path = %path.display(), "Write disabled");
    }

    /// Finalize every active write target
    pub fn disable_all_writes(&mut self) {
        let targets = std::mem::take(&mut self.targets);
        if let Some(handle) = self.handle.as_mut() {
            for path in &targets {
                handle.disable_write(path);
            }
        }
        self.paused = false;
    }

    pub fn setting(&self, setting: VideoSetting) -> Result<i32, CameraError> {
        self.handle
            .as_ref()
            .ok_or(CameraError::NotOpen)?
            .setting(setting)
    }

    pub fn set_setting(
        &mut self,
        setting: VideoSetting,
        value: SettingValue,
    ) -> Result<(), CameraError> {
        self.handle_mut()?.set_setting(setting, value)
    }

    /// Disable writes and release the hardware
    pub fn close(&mut self) {
        if self.handle.is_none() {
            return;
        }
        self.disable_all_writes();
        if let Some(mut handle) = self.handle.take() {
            handle.close();
        }
        self.config = None;
        info!(device = self.label, "Camera closed");
    }
}

impl Drop for CaptureDevice {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for CaptureDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureDevice")
            .field("label", &self.label)
            .field("state", &self.state())
            .field("config", &self.config)
            .field("targets", &self.targets)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimulatedDriver};
    use crate::Compression;

    fn fast_retry() -> OpenRetry {
        OpenRetry {
            retries: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedDriver::new(SimConfig::unpaced());
        let mut device =
            CaptureDevice::open(&driver, &CameraConfig::default(), &fast_retry(), "primary")
                .unwrap();
        assert_eq!(device.state(), DeviceState::Open);

        let path = dir.path().join("video.svo");
        device
            .enable_write(&WriteParams::new(&path, Compression::Lossless, 30))
            .unwrap();
        assert_eq!(device.state(), DeviceState::Writing);
        assert_eq!(device.grab().unwrap(), GrabStatus::Success);

        device.disable_write(&path);
        assert_eq!(device.state(), DeviceState::Open);

        device.close();
        assert_eq!(device.state(), DeviceState::Closed);
        assert_eq!(device.grab(), Err(CameraError::NotOpen));
        assert_eq!(driver.state().open_handles(), 0);
    }

    #[test]
    fn test_open_retries_then_succeeds() {
        let driver = SimulatedDriver::new(SimConfig::unpaced());
        driver.state().inject_open_failures(3);
        let device =
            CaptureDevice::open(&driver, &CameraConfig::default(), &fast_retry(), "primary");
        assert!(device.is_ok());
        assert_eq!(driver.state().open_attempts(), 4);
    }

    #[test]
    fn test_open_fails_after_retry_budget() {
        let driver = SimulatedDriver::new(SimConfig::unpaced());
        driver.state().inject_open_failures(4);
        let result =
            CaptureDevice::open(&driver, &CameraConfig::default(), &fast_retry(), "primary");
        assert!(matches!(result, Err(CameraError::Open(_))));
        assert_eq!(driver.state().open_handles(), 0);
    }

    #[test]
    fn test_close_disables_writes() {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedDriver::new(SimConfig::unpaced());
        let mut device =
            CaptureDevice::open(&driver, &CameraConfig::default(), &fast_retry(), "primary")
                .unwrap();
        let path = dir.path().join("video.svo");
        device
            .enable_write(&WriteParams::new(&path, Compression::Lossless, 30))
            .unwrap();
        drop(device);
        assert_eq!(driver.state().open_handles(), 0);
        assert_eq!(driver.state().active_writes(), 0);
    }
}
