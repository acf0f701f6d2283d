//! Simulated stereo camera
//!
//! Deterministic software stand-in for the vendor SDK. Frames are paced at
//! the configured frame rate, write targets grow by a fixed number of bytes
//! per grabbed frame, and faults can be injected through `SimState`.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::driver::{CameraDriver, CameraHandle, GrabStatus};
use crate::frame::{DepthMap, ImageBuffer, View};
use crate::imu::TelemetrySample;
use crate::{CameraConfig, CameraError, SettingValue, VideoSetting, WriteParams};

/// Simulated camera configuration
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Bytes appended to each write target per grabbed frame
    pub bytes_per_frame: usize,
    /// Maximum number of simultaneously open handles
    pub max_handles: usize,
    /// Whether one handle may write two targets at once
    pub dual_write: bool,
    /// Sleep in `grab` to honour the configured frame rate
    pub pace_frames: bool,
    /// Size of retrieved images and depth maps
    pub frame_size: (u32, u32),
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bytes_per_frame: 64 * 1024,
            max_handles: 1,
            dual_write: false,
            pace_frames: true,
            frame_size: (160, 90),
        }
    }
}

impl SimConfig {
    /// Frames as fast as they are grabbed (unit tests)
    pub fn unpaced() -> Self {
        Self {
            pace_frames: false,
            ..Default::default()
        }
    }
}

/// Counters and fault injection shared by the driver and all its handles
#[derive(Debug, Default)]
pub struct SimState {
    open_attempts: AtomicU32,
    open_handles: AtomicUsize,
    closes: AtomicU32,
    grabs: AtomicU64,
    depth_retrievals: AtomicU64,
    image_retrievals: AtomicU64,
    active_writes: AtomicUsize,
    open_failures: AtomicU32,
    grab_failures: AtomicU32,
    grab_failures_forever: AtomicBool,
    corrupted_frames: AtomicU32,
    write_failures: AtomicU32,
    setting_failures: AtomicU32,
    end_of_input_after: AtomicU64,
}

/// Decrement `counter` if positive; true when a fault should fire
fn take_fault(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl SimState {
    /// Fail the next `n` open calls
    pub fn inject_open_failures(&self, n: u32) {
        self.open_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` grabs with a transient error
    pub fn inject_grab_failures(&self, n: u32) {
        self.grab_failures.store(n, Ordering::SeqCst);
    }

    /// Fail every grab until cleared
    pub fn fail_grabs_forever(&self, enabled: bool) {
        self.grab_failures_forever.store(enabled, Ordering::SeqCst);
    }

    /// Report the next `n` frames as corrupted
    pub fn inject_corrupted_frames(&self, n: u32) {
        self.corrupted_frames.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` enable-write calls
    pub fn inject_write_failures(&self, n: u32) {
        self.write_failures.store(n, Ordering::SeqCst);
    }

    /// Reject the next `n` exposure/gain changes
    pub fn inject_setting_failures(&self, n: u32) {
        self.setting_failures.store(n, Ordering::SeqCst);
    }

    /// Report end of input once `frames` frames were grabbed (0 = never)
    pub fn end_input_after(&self, frames: u64) {
        self.end_of_input_after.store(frames, Ordering::SeqCst);
    }

    pub fn open_attempts(&self) -> u32 {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn grabs(&self) -> u64 {
        self.grabs.load(Ordering::SeqCst)
    }

    pub fn depth_retrievals(&self) -> u64 {
        self.depth_retrievals.load(Ordering::SeqCst)
    }

    pub fn image_retrievals(&self) -> u64 {
        self.image_retrievals.load(Ordering::SeqCst)
    }

    pub fn active_writes(&self) -> usize {
        self.active_writes.load(Ordering::SeqCst)
    }
}

/// Driver producing `SimHandle`s
#[derive(Clone)]
pub struct SimulatedDriver {
    config: SimConfig,
    state: Arc<SimState>,
}

impl SimulatedDriver {
    pub fn new(config: SimConfig) -> Self {
        Self {
            config,
            state: Arc::new(SimState::default()),
        }
    }

    /// Shared counters / fault injection
    pub fn state(&self) -> &Arc<SimState> {
        &self.state
    }
}

impl CameraDriver for SimulatedDriver {
    fn open(&self, config: &CameraConfig) -> Result<Box<dyn CameraHandle>, CameraError> {
        self.state.open_attempts.fetch_add(1, Ordering::SeqCst);

        if take_fault(&self.state.open_failures) {
            return Err(CameraError::Open("simulated USB enumeration failure".into()));
        }

        let reserved = self
            .state
            .open_handles
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.config.max_handles).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(CameraError::HandleLimit);
        }

        debug!("Simulated camera opened: {}", config);
        Ok(Box::new(SimHandle::new(
            *config,
            self.config.clone(),
            Arc::clone(&self.state),
        )))
    }
}

struct SimWrite {
    path: PathBuf,
    file: File,
}

/// One simulated camera handle
pub struct SimHandle {
    camera: CameraConfig,
    sim: SimConfig,
    state: Arc<SimState>,
    writes: Vec<SimWrite>,
    paused: bool,
    frame: u64,
    has_frame: bool,
    next_frame_at: Instant,
    exposure: SettingValue,
    gain: SettingValue,
    payload: Vec<u8>,
    closed: bool,
}

impl SimHandle {
    fn new(camera: CameraConfig, sim: SimConfig, state: Arc<SimState>) -> Self {
        let payload = vec![0u8; sim.bytes_per_frame];
        Self {
            camera,
            sim,
            state,
            writes: Vec::new(),
            paused: false,
            frame: 0,
            has_frame: false,
            next_frame_at: Instant::now(),
            exposure: SettingValue::Auto,
            gain: SettingValue::Auto,
            payload,
            closed: false,
        }
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.camera.fps.max(1)))
    }

    fn pace(&mut self) {
        if !self.sim.pace_frames {
            return;
        }
        let now = Instant::now();
        if self.next_frame_at > now {
            thread::sleep(self.next_frame_at - now);
            self.next_frame_at += self.frame_interval();
        } else {
            self.next_frame_at = now + self.frame_interval();
        }
    }

    fn append_frame(&mut self) {
        if self.paused {
            return;
        }
        for write in &mut self.writes {
            if let Err(e) = write.file.write_all(&self.payload) {
                warn!("Simulated write to {} failed: {}", write.path.display(), e);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), CameraError> {
        if self.closed {
            Err(CameraError::NotOpen)
        } else {
            Ok(())
        }
    }
}

impl CameraHandle for SimHandle {
    fn grab(&mut self) -> GrabStatus {
        if self.closed {
            return GrabStatus::TransientFailure("handle closed".into());
        }
        self.pace();
        self.state.grabs.fetch_add(1, Ordering::SeqCst);

        if self.state.grab_failures_forever.load(Ordering::SeqCst)
            || take_fault(&self.state.grab_failures)
        {
            return GrabStatus::TransientFailure("simulated USB timeout".into());
        }

        let limit = self.state.end_of_input_after.load(Ordering::SeqCst);
        if limit > 0 && self.frame >= limit {
            return GrabStatus::EndOfInput;
        }

        self.frame += 1;
        self.has_frame = true;
        self.append_frame();

        if take_fault(&self.state.corrupted_frames) {
            GrabStatus::CorruptedFrame
        } else {
            GrabStatus::Success
        }
    }

    fn retrieve_image(&mut self, view: View) -> Result<ImageBuffer, CameraError> {
        self.ensure_open()?;
        if !self.has_frame {
            return Err(CameraError::Retrieve("no frame grabbed yet".into()));
        }
        self.state.image_retrievals.fetch_add(1, Ordering::SeqCst);
        let (width, height) = self.sim.frame_size;
        let shade = match view {
            View::Left => 64u8,
            View::Right => 192u8,
        };
        let tick = (self.frame % 256) as u8;
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                data.extend_from_slice(&[
                    (x as u8).wrapping_add(tick),
                    (y as u8).wrapping_add(tick),
                    shade,
                    255,
                ]);
            }
        }
        Ok(ImageBuffer::new(data, width, height, epoch_nanos()))
    }

    fn retrieve_depth(&mut self) -> Result<DepthMap, CameraError> {
        self.ensure_open()?;
        self.state.depth_retrievals.fetch_add(1, Ordering::SeqCst);
        if !self.camera.depth.is_enabled() {
            return Err(CameraError::Retrieve("depth computation disabled".into()));
        }
        if !self.has_frame {
            return Err(CameraError::Retrieve("no frame grabbed yet".into()));
        }
        let (width, height) = self.sim.frame_size;
        let offset = (self.frame % 100) as f32 / 10.0;
        let values = (0..height)
            .flat_map(|y| (0..width).map(move |x| 1.0 + offset + (x + y) as f32 / 50.0))
            .collect();
        Ok(DepthMap::new(values, width, height))
    }

    fn enable_write(&mut self, params: &WriteParams) -> Result<(), CameraError> {
        self.ensure_open()?;
        if take_fault(&self.state.write_failures) {
            return Err(CameraError::Write("simulated encoder failure".into()));
        }
        if !self.writes.is_empty() && !self.sim.dual_write {
            return Err(CameraError::WriteBusy);
        }
        let file = File::create(&params.path)
            .map_err(|e| CameraError::Write(format!("{}: {}", params.path.display(), e)))?;
        self.writes.push(SimWrite {
            path: params.path.clone(),
            file,
        });
        self.paused = false;
        self.state.active_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn pause_write(&mut self, paused: bool) {
        self.paused = paused;
    }

    fn disable_write(&mut self, path: &Path) {
        if let Some(pos) = self.writes.iter().position(|w| w.path == path) {
            let mut write = self.writes.remove(pos);
            let _ = write.file.flush();
            let _ = write.file.sync_all();
            self.state.active_writes.fetch_sub(1, Ordering::SeqCst);
        }
        if self.writes.is_empty() {
            self.paused = false;
        }
    }

    fn sensors(&mut self) -> Result<TelemetrySample, CameraError> {
        self.ensure_open()?;
        let phase = self.frame as f32 / 30.0;
        Ok(TelemetrySample {
            timestamp_ms: epoch_nanos() / 1_000_000,
            rotation: [phase.sin() * 5.0, phase.cos() * 5.0, phase * 0.1],
            accel: [0.02, -0.01, 9.81],
            gyro: [0.1, 0.0, -0.1],
            mag: [22.0, -4.5, 41.0],
            pressure: 1013.25,
            temperature: 35.0,
        })
    }

    fn setting(&self, setting: VideoSetting) -> Result<i32, CameraError> {
        self.ensure_open()?;
        Ok(match setting {
            VideoSetting::Exposure => self.exposure.as_raw(),
            VideoSetting::Gain => self.gain.as_raw(),
        })
    }

    fn set_setting(
        &mut self,
        setting: VideoSetting,
        value: SettingValue,
    ) -> Result<(), CameraError> {
        self.ensure_open()?;
        if take_fault(&self.state.setting_failures) {
            return Err(CameraError::Setting(format!("simulated {:?} rejection", setting)));
        }
        match setting {
            VideoSetting::Exposure => self.exposure = value,
            VideoSetting::Gain => self.gain = value,
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        let paths: Vec<PathBuf> = self.writes.iter().map(|w| w.path.clone()).collect();
        for path in paths {
            self.disable_write(&path);
        }
        self.closed = true;
        self.state.open_handles.fetch_sub(1, Ordering::SeqCst);
        self.state.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn epoch_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
