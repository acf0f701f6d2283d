//! Mode/resolution controller and session lifecycle
//!
//! `Idle → Initializing → Recording → Stopping → Idle`. Every transition
//! runs under one lifecycle lock; reconfiguration is only accepted while
//! idle, and any change of depth level or resolution on an open camera
//! goes through close → settle → reopen.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camera_capture::{
    CameraConfig, CameraDriver, CameraError, CaptureDevice, Compression, DepthLevel, GrabStatus,
    ImageBuffer, OpenRetry, SettingValue, VideoSetting, View, WriteParams,
};
use chrono::{DateTime, Local};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use storage::{SegmentPaths, SessionLayout, SessionStorage};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::depth_writer::{DepthOutput, DepthWriter, DepthWriterConfig, DepthWriterContext};
use crate::error::{RecorderError, RotationError};
use crate::profile::{CaptureProfile, ModeSelection, RecordingMode};
use crate::rotation::{RotationContext, RotationKind, RotationSettings, RotationStrategy};
use crate::selector::{shared, DeviceSelector};
use crate::session::{
    container_variant, target_size, written_path, SegmentTarget, SessionCounters, SharedTarget, ShutdownSignal,
};
use crate::sink::{RawFrameSink, DEFAULT_JPEG_QUALITY};
use crate::telemetry::TelemetryWriter;
use crate::worker::{
    join_bounded, FrameSink, RecordingWorker, SharedTelemetry, WorkerConfig, WorkerContext,
};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Controller state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecorderState {
    Idle,
    Initializing,
    Recording,
    Stopping,
}

impl fmt::Display for RecorderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecorderState::Idle => "idle",
            RecorderState::Initializing => "initializing",
            RecorderState::Recording => "recording",
            RecorderState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Hardware timings of the reacquire and stop protocols
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerTimings {
    /// Wait after closing the camera before reopening it
    pub settle_ms: u64,
    pub open_retries: u32,
    pub open_backoff_ms: u64,
    /// Bounded wait for worker threads to exit
    pub worker_stop_timeout_ms: u64,
    /// Duration / worker-exit polling period
    pub monitor_interval_ms: u64,
}

impl Default for ControllerTimings {
    fn default() -> Self {
        Self {
            settle_ms: 3000,
            open_retries: 3,
            open_backoff_ms: 2000,
            worker_stop_timeout_ms: 5000,
            monitor_interval_ms: 100,
        }
    }
}

impl ControllerTimings {
    pub fn open_retry(&self) -> OpenRetry {
        OpenRetry {
            retries: self.open_retries,
            backoff: Duration::from_millis(self.open_backoff_ms),
        }
    }
}

/// Size-dependent delays around finalizing a container
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GracePolicy {
    pub large_file_bytes: u64,
    pub huge_file_bytes: u64,
    /// Before disabling a large file (after a sync)
    pub pre_disable_ms: u64,
    pub post_disable_ms: u64,
    pub post_disable_large_ms: u64,
    pub post_disable_huge_ms: u64,
    pub sync_filesystem: bool,
}

impl Default for GracePolicy {
    fn default() -> Self {
        Self {
            large_file_bytes: GIB,
            huge_file_bytes: 2 * GIB,
            pre_disable_ms: 500,
            post_disable_ms: 500,
            post_disable_large_ms: 2000,
            post_disable_huge_ms: 3000,
            sync_filesystem: true,
        }
    }
}

impl GracePolicy {
    /// No waits and no sync (bench and test rigs)
    pub fn immediate() -> Self {
        Self {
            pre_disable_ms: 0,
            post_disable_ms: 0,
            post_disable_large_ms: 0,
            post_disable_huge_ms: 0,
            sync_filesystem: false,
            ..Self::default()
        }
    }

    pub fn pre_disable(&self, bytes: u64) -> Option<Duration> {
        (bytes > self.large_file_bytes).then(|| Duration::from_millis(self.pre_disable_ms))
    }

    pub fn post_disable(&self, bytes: u64) -> Duration {
        let ms = if bytes > self.huge_file_bytes {
            self.post_disable_huge_ms
        } else if bytes > self.large_file_bytes {
            self.post_disable_large_ms
        } else {
            self.post_disable_ms
        };
        Duration::from_millis(ms)
    }

    fn sync(&self) {
        if self.sync_filesystem {
            // SAFETY: sync(2) takes no arguments and cannot fail
            unsafe { libc::sync() };
        }
    }
}

/// Recorder configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecorderSettings {
    pub mode: RecordingMode,
    pub depth: DepthLevel,
    pub profile: CaptureProfile,
    pub compression: Compression,
    /// Session length when `start` is given none
    pub duration_secs: u64,
    pub jpeg_quality: u8,
    /// -1 = auto, 0..=100 manual
    pub exposure: i32,
    pub gain: i32,
    pub worker: WorkerConfig,
    pub depth_writer: DepthWriterConfig,
    pub rotation: RotationSettings,
    pub timings: ControllerTimings,
    pub grace: GracePolicy,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            mode: RecordingMode::CompressedOnly,
            depth: DepthLevel::None,
            profile: CaptureProfile::Hd720p60,
            compression: Compression::Lossless,
            duration_secs: 240,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            exposure: -1,
            gain: -1,
            worker: WorkerConfig::default(),
            depth_writer: DepthWriterConfig::default(),
            rotation: RotationSettings::default(),
            timings: ControllerTimings::default(),
            grace: GracePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Selection {
    modes: ModeSelection,
    profile: CaptureProfile,
    exposure: SettingValue,
    gain: SettingValue,
}

impl Selection {
    fn from_settings(settings: &RecorderSettings) -> Self {
        let modes = ModeSelection::new(settings.mode, settings.depth).unwrap_or_else(|reason| {
            warn!("Configured depth level ignored: {}", reason);
            ModeSelection::default().with_mode(settings.mode)
        });
        let setting = |raw: i32, name: &str| {
            SettingValue::from_raw(raw).unwrap_or_else(|e| {
                warn!("Configured {} ignored: {}", name, e);
                SettingValue::Auto
            })
        };
        Self {
            modes,
            profile: settings.profile,
            exposure: setting(settings.exposure, "exposure"),
            gain: setting(settings.gain, "gain"),
        }
    }

    fn camera_config(&self) -> CameraConfig {
        self.profile.camera_config(self.modes.depth())
    }
}

#[derive(Debug, Clone)]
enum StopCause {
    Operator,
    DurationElapsed,
    WorkerEnded,
    Shutdown,
    RotationFailed(String),
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCause::Operator => f.write_str("operator request"),
            StopCause::DurationElapsed => f.write_str("duration elapsed"),
            StopCause::WorkerEnded => f.write_str("worker ended"),
            StopCause::Shutdown => f.write_str("shutdown"),
            StopCause::RotationFailed(reason) => write!(f, "rotation failed: {}", reason),
        }
    }
}

/// What a finished session left on disk
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub dir: PathBuf,
    pub mode: RecordingMode,
    pub segments: u32,
    /// Bytes of the last segment (raw mode: whole session)
    pub bytes: u64,
    pub frames: u64,
    pub depth_samples: u64,
    pub duration_secs: f64,
    pub video: Option<PathBuf>,
    pub failure: Option<String>,
}

struct ActiveSession {
    id: Uuid,
    layout: SessionLayout,
    mode: RecordingMode,
    started: Instant,
    started_at: DateTime<Local>,
    duration: Duration,
    fps: u32,
    compression: Compression,
    selector: Arc<DeviceSelector>,
    worker: RecordingWorker,
    depth_writer: Option<DepthWriter>,
    target: SharedTarget,
    telemetry: SharedTelemetry,
    counters: Arc<SessionCounters>,
    segment_started: Instant,
    teardowns: Vec<JoinHandle<()>>,
}

/// Status snapshot for the control layer
#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatus {
    pub state: RecorderState,
    pub mode: RecordingMode,
    pub depth: DepthLevel,
    pub profile: CaptureProfile,
    pub rotation: RotationKind,
    pub session_id: Option<Uuid>,
    pub session: Option<String>,
    pub started_at: Option<String>,
    pub elapsed_secs: u64,
    pub duration_secs: u64,
    pub remaining_secs: u64,
    pub bytes_written: u64,
    pub mb_per_sec: f64,
    pub current_file: Option<PathBuf>,
    pub segment: u32,
    pub frames: u64,
    pub depth_samples: u64,
    pub depth_rate_hz: u32,
    pub exposure: i32,
    pub gain: i32,
    pub camera_open: bool,
    pub camera_initializing: bool,
    pub last_error: Option<String>,
    pub message: String,
}

struct Inner {
    driver: Arc<dyn CameraDriver>,
    storage: Arc<dyn SessionStorage>,
    settings: RecorderSettings,
    strategy: Box<dyn RotationStrategy>,
    shutdown: ShutdownSignal,
    lifecycle: Mutex<()>,
    state: Mutex<RecorderState>,
    selection: Mutex<Selection>,
    device: Mutex<Option<Arc<DeviceSelector>>>,
    camera_initializing: AtomicBool,
    session: Mutex<Option<ActiveSession>>,
    last_summary: Mutex<Option<SessionSummary>>,
    last_error: Mutex<Option<String>>,
    message: Mutex<String>,
    depth_rate: Arc<AtomicU32>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Clears `camera_initializing` however the reacquire ends
struct InitializingFlag<'a>(&'a AtomicBool);

impl<'a> InitializingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for InitializingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Stereo camera recorder
///
/// Cheap to clone; all clones drive the same camera.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Recorder {
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        storage: Arc<dyn SessionStorage>,
        settings: RecorderSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        let selection = Selection::from_settings(&settings);
        let strategy = settings.rotation.strategy.strategy();
        let depth_rate = Arc::new(AtomicU32::new(settings.depth_writer.rate_hz));
        info!(
            mode = %selection.modes.mode(),
            depth = %selection.modes.depth(),
            profile = %selection.profile,
            rotation = strategy.name(),
            "Recorder created"
        );
        Self {
            inner: Arc::new(Inner {
                driver,
                storage,
                settings,
                strategy,
                shutdown,
                lifecycle: Mutex::new(()),
                state: Mutex::new(RecorderState::Idle),
                selection: Mutex::new(selection),
                device: Mutex::new(None),
                camera_initializing: AtomicBool::new(false),
                session: Mutex::new(None),
                last_summary: Mutex::new(None),
                last_error: Mutex::new(None),
                message: Mutex::new("Ready".into()),
                depth_rate,
                monitor: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> RecorderState {
        *self.inner.state.lock()
    }

    pub fn is_camera_initializing(&self) -> bool {
        self.inner.camera_initializing.load(Ordering::SeqCst)
    }

    pub fn mode(&self) -> RecordingMode {
        self.inner.selection.lock().modes.mode()
    }

    pub fn depth_level(&self) -> DepthLevel {
        self.inner.selection.lock().modes.depth()
    }

    pub fn profile(&self) -> CaptureProfile {
        self.inner.selection.lock().profile
    }

    pub fn last_summary(&self) -> Option<SessionSummary> {
        self.inner.last_summary.lock().clone()
    }

    fn set_state(&self, state: RecorderState) {
        let mut current = self.inner.state.lock();
        if *current != state {
            debug!(from = %*current, to = %state, "State change");
            *current = state;
        }
    }

    fn set_message(&self, message: impl Into<String>) {
        *self.inner.message.lock() = message.into();
    }

    fn record_error(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.set_message(reason.clone());
        *self.inner.last_error.lock() = Some(reason);
    }

    fn reject_if_unavailable(&self) -> Result<(), RecorderError> {
        if self.inner.shutdown.is_triggered() {
            return Err(RecorderError::ShuttingDown);
        }
        if self.is_camera_initializing() {
            return Err(RecorderError::CameraBusy);
        }
        Ok(())
    }

    /// Lifecycle lock for an idle-only reconfiguration
    fn guard_reconfigure(&self, what: &str) -> Result<MutexGuard<'_, ()>, RecorderError> {
        self.reject_if_unavailable()?;
        let guard = self.inner.lifecycle.lock();
        let state = self.state();
        if state != RecorderState::Idle {
            return Err(RecorderError::invalid_state(
                state,
                format!("{} requires an idle recorder, stop the recording first", what),
            ));
        }
        Ok(guard)
    }

    /// Open the camera with the current configuration
    pub fn initialize(&self) -> Result<(), RecorderError> {
        let _life = self.guard_reconfigure("initializing the camera")?;
        let config = self.inner.selection.lock().camera_config();
        self.set_state(RecorderState::Initializing);
        let result = self.ensure_device(config).map(|_| ());
        self.set_state(RecorderState::Idle);
        match &result {
            Ok(()) => self.set_message("Camera ready"),
            Err(e) => self.record_error(e.to_string()),
        }
        result
    }

    fn apply_settings(&self, device: &mut CaptureDevice, selection: &Selection) {
        for (setting, value) in [
            (VideoSetting::Exposure, selection.exposure),
            (VideoSetting::Gain, selection.gain),
        ] {
            if let Err(e) = device.set_setting(setting, value) {
                warn!(device = device.label(), "Re-applying {:?} failed: {}", setting, e);
            }
        }
    }

    /// Return the open device if its configuration matches, else reacquire
    fn ensure_device(&self, config: CameraConfig) -> Result<Arc<DeviceSelector>, RecorderError> {
        let current = self.inner.device.lock().clone();
        if let Some(selector) = current {
            let matches = {
                let device = selector.active();
                let dev = device.lock();
                dev.is_open() && dev.config() == Some(&config)
            };
            if matches {
                return Ok(selector);
            }
        }
        self.reacquire(config)
    }

    /// Close → settle → reopen with retries
    ///
    /// On failure the camera stays closed; nothing half-open is kept.
    fn reacquire(&self, config: CameraConfig) -> Result<Arc<DeviceSelector>, RecorderError> {
        let _flag = InitializingFlag::raise(&self.inner.camera_initializing);
        let timings = &self.inner.settings.timings;

        let previous = self.inner.device.lock().take();
        if let Some(selector) = previous {
            selector.close_all();
            drop(selector);
            info!(settle_ms = timings.settle_ms, "Camera closed, waiting for hardware to settle");
            thread::sleep(Duration::from_millis(timings.settle_ms));
        }

        let selection = *self.inner.selection.lock();
        let retry = timings.open_retry();
        let mut device = CaptureDevice::open(&*self.inner.driver, &config, &retry, "primary")
            .map_err(RecorderError::CameraOpen)?;
        self.apply_settings(&mut device, &selection);
        let selector = Arc::new(DeviceSelector::new(device));

        if self.inner.settings.rotation.strategy == RotationKind::DualHandle {
            let no_retry = OpenRetry {
                retries: 0,
                ..retry
            };
            match CaptureDevice::open(&*self.inner.driver, &config, &no_retry, "standby") {
                Ok(mut standby) => {
                    self.apply_settings(&mut standby, &selection);
                    selector.set_standby(shared(standby));
                }
                Err(e) => warn!("Standby handle unavailable, dual-handle swaps will fall back: {}", e),
            }
        }

        *self.inner.device.lock() = Some(Arc::clone(&selector));
        info!(config = %config, "Camera ready");
        Ok(selector)
    }

    /// Reacquire after an idle reconfiguration if the camera is open
    fn apply_camera_change(&self, config: CameraConfig) -> Result<(), RecorderError> {
        if self.inner.device.lock().is_none() {
            debug!(config = %config, "Camera closed, configuration applies at next open");
            return Ok(());
        }
        self.set_state(RecorderState::Initializing);
        let result = self.reacquire(config).map(|_| ());
        self.set_state(RecorderState::Idle);
        match &result {
            Ok(()) => self.set_message(format!("Camera reconfigured: {}", config)),
            Err(e) => self.record_error(e.to_string()),
        }
        result
    }

    /// Select the recording mode, coupling the depth level to it
    pub fn set_mode(&self, mode: RecordingMode) -> Result<(), RecorderError> {
        let _life = self.guard_reconfigure("changing the recording mode")?;
        let (before, after) = {
            let mut selection = self.inner.selection.lock();
            let before = *selection;
            selection.modes = selection.modes.with_mode(mode);
            (before, *selection)
        };
        info!(mode = %mode, "Recording mode selected");
        if before.modes.depth() != after.modes.depth() {
            info!(
                from = %before.modes.depth(),
                to = %after.modes.depth(),
                "Depth level follows mode"
            );
            return self.apply_camera_change(after.camera_config());
        }
        Ok(())
    }

    pub fn set_depth_level(&self, depth: DepthLevel) -> Result<(), RecorderError> {
        let _life = self.guard_reconfigure("changing the depth level")?;
        let config = {
            let mut selection = self.inner.selection.lock();
            let updated = selection
                .modes
                .with_depth(depth)
                .map_err(RecorderError::InvalidConfiguration)?;
            if updated == selection.modes {
                return Ok(());
            }
            selection.modes = updated;
            selection.camera_config()
        };
        info!(depth = %depth, "Depth level selected");
        self.apply_camera_change(config)
    }

    pub fn set_resolution(&self, profile: CaptureProfile) -> Result<(), RecorderError> {
        let _life = self.guard_reconfigure("changing the resolution")?;
        let config = {
            let mut selection = self.inner.selection.lock();
            if selection.profile == profile {
                return Ok(());
            }
            selection.profile = profile;
            selection.camera_config()
        };
        info!(profile = %profile, "Capture profile selected");
        self.apply_camera_change(config)
    }

    pub fn set_exposure(&self, raw: i32) -> Result<(), RecorderError> {
        self.set_video_setting(VideoSetting::Exposure, raw)
    }

    pub fn set_gain(&self, raw: i32) -> Result<(), RecorderError> {
        self.set_video_setting(VideoSetting::Gain, raw)
    }

    fn set_video_setting(&self, setting: VideoSetting, raw: i32) -> Result<(), RecorderError> {
        let value = SettingValue::from_raw(raw)
            .map_err(|e| RecorderError::InvalidConfiguration(e.to_string()))?;
        let _life = self.guard_reconfigure("changing camera settings")?;

        let selector = self.inner.device.lock().clone();
        if let Some(selector) = selector {
            selector.active().lock().set_setting(setting, value)?;
            if let Some(standby) = selector.take_standby() {
                if let Err(e) = standby.lock().set_setting(setting, value) {
                    warn!("Standby {:?} not updated: {}", setting, e);
                }
                selector.set_standby(standby);
            }
        }

        // Only what the camera accepted is remembered
        let mut selection = self.inner.selection.lock();
        match setting {
            VideoSetting::Exposure => selection.exposure = value,
            VideoSetting::Gain => selection.gain = value,
        }
        drop(selection);
        info!(value = raw, "{:?} set", setting);
        Ok(())
    }

    /// Depth side-channel rate; takes effect on the writer's next iteration
    pub fn set_depth_rate(&self, rate_hz: u32) {
        self.inner.depth_rate.store(rate_hz, Ordering::Relaxed);
        info!(rate_hz, "Depth rate set");
    }

    /// Start a session; `None` uses the configured duration
    pub fn start(&self, duration: Option<Duration>) -> Result<PathBuf, RecorderError> {
        self.reject_if_unavailable()?;
        let _life = self.inner.lifecycle.lock();
        let state = self.state();
        if state != RecorderState::Idle {
            return Err(RecorderError::invalid_state(state, "a session is already active"));
        }

        let duration =
            duration.unwrap_or_else(|| Duration::from_secs(self.inner.settings.duration_secs));
        self.set_state(RecorderState::Initializing);
        match self.begin_session(duration) {
            Ok((id, dir)) => {
                self.set_state(RecorderState::Recording);
                *self.inner.last_error.lock() = None;
                self.set_message(format!("Recording to {}", dir.display()));
                self.spawn_monitor(id);
                Ok(dir)
            }
            Err(e) => {
                self.set_state(RecorderState::Idle);
                error!("Recording not started: {}", e);
                self.record_error(e.to_string());
                Err(e)
            }
        }
    }

    fn begin_session(&self, duration: Duration) -> Result<(Uuid, PathBuf), RecorderError> {
        let settings = &self.inner.settings;
        let selection = *self.inner.selection.lock();
        let mode = selection.modes.mode();
        let fps = selection.profile.fps();
        let selector = self.ensure_device(selection.camera_config())?;

        let layout = self.inner.storage.create_session_directory()?;
        let first = layout.segment(0);
        let counters = Arc::new(SessionCounters::default());
        counters.bytes.begin_segment(0);

        let telemetry = TelemetryWriter::create(&first.telemetry, None).map_err(|source| {
            RecorderError::Output {
                path: first.telemetry.clone(),
                source,
            }
        })?;
        let telemetry: SharedTelemetry = Arc::new(Mutex::new(Some(telemetry)));
        let target: SharedTarget = Arc::new(RwLock::new(SegmentTarget {
            index: 0,
            video: first.video.clone(),
        }));

        let sink = if mode.uses_container() {
            let params = WriteParams::new(&first.video, settings.compression, fps);
            selector.active().lock().enable_write(&params)?;
            if let Some(actual) = written_path(&first.video) {
                target.write().video = actual;
            }
            FrameSink::Container(Arc::clone(&target))
        } else {
            let raw = self
                .inner
                .storage
                .create_raw_layout(&layout, selection.modes.depth().is_enabled())?;
            FrameSink::Raw(RawFrameSink::new(raw, settings.jpeg_quality))
        };

        let threads = self.spawn_session_threads(&selector, &layout, mode, fps, sink, &telemetry, &counters);
        let (worker, depth_writer) = match threads {
            Ok(threads) => threads,
            Err(e) => {
                selector.active().lock().disable_all_writes();
                return Err(e);
            }
        };

        let id = Uuid::new_v4();
        let now = Instant::now();
        info!(
            session = %id,
            dir = %layout.dir().display(),
            mode = %mode,
            config = %selection.camera_config(),
            duration_secs = duration.as_secs(),
            "Recording started"
        );
        let dir = layout.dir().to_path_buf();
        *self.inner.session.lock() = Some(ActiveSession {
            id,
            layout,
            mode,
            started: now,
            started_at: Local::now(),
            duration,
            fps,
            compression: settings.compression,
            selector,
            worker,
            depth_writer,
            target,
            telemetry,
            counters,
            segment_started: now,
            teardowns: Vec::new(),
        });
        Ok((id, dir))
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_session_threads(
        &self,
        selector: &Arc<DeviceSelector>,
        layout: &SessionLayout,
        mode: RecordingMode,
        fps: u32,
        sink: FrameSink,
        telemetry: &SharedTelemetry,
        counters: &Arc<SessionCounters>,
    ) -> Result<(RecordingWorker, Option<DepthWriter>), RecorderError> {
        let settings = &self.inner.settings;
        let output = match mode {
            RecordingMode::CompressedWithDepthMetadata => Some(DepthOutput::Records),
            RecordingMode::CompressedWithDepthImages => Some(DepthOutput::Images {
                max_range_m: settings.depth_writer.max_range_m,
            }),
            _ => None,
        };

        let depth_dir = layout.depth_dir();
        if output.is_some() {
            fs::create_dir_all(&depth_dir).map_err(|source| RecorderError::Output {
                path: depth_dir.clone(),
                source,
            })?;
        }

        let worker = RecordingWorker::spawn(WorkerContext {
            selector: Arc::clone(selector),
            sink,
            telemetry: Arc::clone(telemetry),
            counters: Arc::clone(counters),
            fps,
            config: settings.worker.clone(),
            shutdown: self.inner.shutdown.clone(),
        })
        .map_err(|source| RecorderError::Output {
            path: layout.dir().to_path_buf(),
            source,
        })?;

        let depth_writer = match output {
            Some(output) => {
                let spawned = DepthWriter::spawn(DepthWriterContext {
                    selector: Arc::clone(selector),
                    counters: Arc::clone(counters),
                    rate: Arc::clone(&self.inner.depth_rate),
                    output,
                    dir: depth_dir.clone(),
                    config: settings.depth_writer.clone(),
                    shutdown: self.inner.shutdown.clone(),
                });
                match spawned {
                    Ok(writer) => Some(writer),
                    Err(source) => {
                        let timeout = Duration::from_millis(settings.timings.worker_stop_timeout_ms);
                        if let Err(e) = worker.stop(timeout) {
                            warn!("Recording worker not joined: {}", e);
                        }
                        return Err(RecorderError::Output {
                            path: depth_dir,
                            source,
                        });
                    }
                }
            }
            None => None,
        };

        Ok((worker, depth_writer))
    }

    fn spawn_monitor(&self, id: Uuid) {
        let recorder = self.clone();
        let spawned = thread::Builder::new()
            .name("session-monitor".into())
            .spawn(move || recorder.monitor(id));
        match spawned {
            // A previous monitor exits on its own once it sees a new session id
            Ok(handle) => *self.inner.monitor.lock() = Some(handle),
            Err(e) => error!("Session monitor not started, duration will not be enforced: {}", e),
        }
    }

    /// Enforce duration, worker exit, shutdown and automatic rotation
    fn monitor(&self, id: Uuid) {
        let interval = Duration::from_millis(self.inner.settings.timings.monitor_interval_ms);
        let segment_secs = self.inner.settings.rotation.segment_secs;
        loop {
            thread::sleep(interval);
            let _life = self.inner.lifecycle.lock();
            let (cause, rotate) = {
                let session = self.inner.session.lock();
                let Some(s) = session.as_ref().filter(|s| s.id == id) else {
                    return;
                };
                let cause = if s.worker.is_finished() {
                    Some(StopCause::WorkerEnded)
                } else if s.started.elapsed() >= s.duration {
                    Some(StopCause::DurationElapsed)
                } else if self.inner.shutdown.is_triggered() {
                    Some(StopCause::Shutdown)
                } else {
                    None
                };
                let rotate = segment_secs > 0
                    && s.mode.uses_container()
                    && s.segment_started.elapsed() >= Duration::from_secs(segment_secs);
                (cause, rotate)
            };

            if let Some(cause) = cause {
                self.finish_session(cause);
                return;
            }
            if rotate {
                if let Err(e) = self.rotate_locked() {
                    warn!("Automatic segment rotation failed: {}", e);
                }
            }
        }
    }

    /// Stop the active session
    pub fn stop(&self) -> Result<SessionSummary, RecorderError> {
        let _life = self.inner.lifecycle.lock();
        let state = self.state();
        if state != RecorderState::Recording {
            return Err(RecorderError::invalid_state(state, "no active recording"));
        }
        self.finish_session(StopCause::Operator)
            .ok_or_else(|| RecorderError::invalid_state(state, "no active recording"))
    }

    /// Full stop protocol; caller holds the lifecycle lock
    fn finish_session(&self, cause: StopCause) -> Option<SessionSummary> {
        let session = self.inner.session.lock().take()?;
        self.set_state(RecorderState::Stopping);
        info!(session = %session.id, cause = %cause, "Stopping recording");

        let timeout = Duration::from_millis(self.inner.settings.timings.worker_stop_timeout_ms);
        if let Some(writer) = &session.depth_writer {
            writer.request_stop();
        }
        let exit = match session.worker.stop(timeout) {
            Ok(exit) => Some(exit),
            Err(e) => {
                warn!("Recording worker not joined, finalizing anyway: {}", e);
                None
            }
        };
        if let Some(writer) = session.depth_writer {
            writer.stop(timeout);
        }
        for teardown in session.teardowns {
            if let Err(e) = join_bounded(teardown, timeout) {
                warn!("Rotation teardown not joined: {}", e);
            }
        }

        let target = session.target.read().clone();
        let mut bytes = session.counters.bytes.get();
        let video = if session.mode.uses_container() {
            bytes = bytes.max(target_size(&target.video).unwrap_or(0));
            self.finalize_container(&session.selector, &target.video, bytes);
            Some(target.video.clone())
        } else {
            None
        };

        let writer = session.telemetry.lock().take();
        if let Some(writer) = writer {
            let path = writer.path().to_path_buf();
            match writer.finish() {
                Ok(rows) => info!(rows, path = %path.display(), "Telemetry closed"),
                Err(e) => warn!("Telemetry {} not finalized: {}", path.display(), e),
            }
        }

        let failure = match (&cause, exit.as_ref().and_then(|e| e.failure_reason())) {
            (_, Some(reason)) => Some(reason),
            (StopCause::RotationFailed(reason), None) => Some(format!("Segment switch failed: {}", reason)),
            _ => None,
        };

        let summary = SessionSummary {
            id: session.id,
            dir: session.layout.dir().to_path_buf(),
            mode: session.mode,
            segments: target.index + 1,
            bytes,
            frames: session.counters.frames(),
            depth_samples: session.counters.depth_samples(),
            duration_secs: session.started.elapsed().as_secs_f64(),
            video,
            failure: failure.clone(),
        };
        info!(
            session = %summary.id,
            frames = summary.frames,
            segments = summary.segments,
            size_mb = summary.bytes / MIB,
            "Recording stopped"
        );

        match failure {
            Some(reason) => {
                error!("{}", reason);
                self.record_error(reason);
            }
            None => self.set_message(format!("Recording stopped ({})", cause)),
        }
        *self.inner.last_summary.lock() = Some(summary.clone());
        self.set_state(RecorderState::Idle);
        Some(summary)
    }

    fn finalize_container(&self, selector: &DeviceSelector, video: &Path, bytes: u64) {
        let grace = &self.inner.settings.grace;
        if let Some(wait) = grace.pre_disable(bytes) {
            info!(size_mb = bytes / MIB, "Large file pre-shutdown sync");
            grace.sync();
            thread::sleep(wait);
        }

        selector.active().lock().disable_all_writes();

        let wait = grace.post_disable(bytes);
        info!(
            wait_ms = wait.as_millis() as u64,
            size_mb = bytes / MIB,
            "Waiting for hardware buffer flush"
        );
        thread::sleep(wait);
        grace.sync();

        if let Some(size) = target_size(video) {
            info!(path = %video.display(), size_mb = size / MIB, "Container finalized");
        }
    }

    /// Switch to the next segment using the configured strategy
    pub fn rotate_segment(&self) -> Result<PathBuf, RecorderError> {
        if self.inner.shutdown.is_triggered() {
            return Err(RecorderError::ShuttingDown);
        }
        let _life = self.inner.lifecycle.lock();
        self.rotate_locked()
    }

    fn rotate_locked(&self) -> Result<PathBuf, RecorderError> {
        let state = self.state();
        if state != RecorderState::Recording {
            return Err(RecorderError::invalid_state(
                state,
                "segment rotation needs an active recording",
            ));
        }
        let (selector, target, telemetry, counters, layout, mode, compression, fps) = {
            let session = self.inner.session.lock();
            let s = session
                .as_ref()
                .ok_or(RecorderError::Rotation(RotationError::NotRecording))?;
            (
                Arc::clone(&s.selector),
                Arc::clone(&s.target),
                Arc::clone(&s.telemetry),
                Arc::clone(&s.counters),
                s.layout.clone(),
                s.mode,
                s.compression,
                s.fps,
            )
        };
        if !mode.uses_container() {
            return Err(RecorderError::invalid_state(
                state,
                "raw multi-stream recordings are not segmented",
            ));
        }

        let current = target.read().clone();
        let next = layout.segment(current.index + 1);
        let floor = telemetry.lock().as_ref().and_then(|w| w.last_timestamp());
        let next_telemetry = TelemetryWriter::create(&next.telemetry, floor).map_err(|e| {
            RotationError::RolledBack(format!("{}: {}", next.telemetry.display(), e))
        })?;

        info!(
            strategy = self.inner.strategy.name(),
            from = %current.video.display(),
            to = %next.video.display(),
            "Rotating segment"
        );
        let ctx = RotationContext {
            selector: &selector,
            current: &current.video,
            next: &next.video,
            compression,
            fps,
            settings: &self.inner.settings.rotation,
        };

        match self.inner.strategy.rotate(&ctx) {
            Ok(report) => {
                let previous = telemetry.lock().replace(next_telemetry);
                *target.write() = SegmentTarget {
                    index: next.index,
                    video: report.video.clone(),
                };
                counters.bytes.begin_segment(next.index);
                if let Some(previous) = previous {
                    if let Err(e) = previous.finish() {
                        warn!("Previous telemetry not finalized: {}", e);
                    }
                }

                let now = Instant::now();
                let mut session = self.inner.session.lock();
                if let Some(s) = session.as_mut() {
                    s.segment_started = now;
                    if let Some(teardown) = report.teardown {
                        s.teardowns.push(teardown);
                    }
                }
                drop(session);

                if report.discarded_frames > 0 {
                    debug!(frames = report.discarded_frames, "Bridging frames dropped");
                }
                info!(
                    strategy = report.strategy,
                    segment = next.index,
                    switch_ms = report.elapsed.as_millis() as u64,
                    "Segment rotated"
                );
                self.set_message(format!("Recording segment {}", next.index));
                Ok(report.video)
            }
            Err(RotationError::SessionStopped(reason)) => {
                drop(next_telemetry);
                discard_segment(&next, false);
                error!("Segment switch left no healthy target, stopping: {}", reason);
                self.finish_session(StopCause::RotationFailed(reason.clone()));
                Err(RotationError::SessionStopped(reason).into())
            }
            Err(e) => {
                drop(next_telemetry);
                discard_segment(&next, true);
                warn!("Segment switch rolled back: {}", e);
                self.record_error(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Latest image of one view
    ///
    /// Shares the device lock with the worker and only grabs itself when
    /// no session is running.
    pub fn snapshot(&self, view: View) -> Result<ImageBuffer, RecorderError> {
        self.reject_if_unavailable()?;
        let selector = self.inner.device.lock().clone();
        let Some(selector) = selector else {
            return Err(RecorderError::invalid_state(self.state(), "camera is not open"));
        };
        let device = selector.active();
        let mut dev = device.lock();
        if self.state() != RecorderState::Recording {
            match dev.grab()? {
                status if status.has_frame() => {}
                GrabStatus::TransientFailure(reason) => {
                    return Err(CameraError::Retrieve(reason).into())
                }
                _ => return Err(CameraError::Retrieve("no frame available".into()).into()),
            }
        }
        Ok(dev.retrieve_image(view)?)
    }

    /// Poll until no session is active
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.state() == RecorderState::Idle && self.inner.session.lock().is_none() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    pub fn status(&self) -> RecordingStatus {
        let selection = *self.inner.selection.lock();
        let camera_open = self.inner.device.lock().is_some();
        let mut status = RecordingStatus {
            state: self.state(),
            mode: selection.modes.mode(),
            depth: selection.modes.depth(),
            profile: selection.profile,
            rotation: self.inner.settings.rotation.strategy,
            session_id: None,
            session: None,
            started_at: None,
            elapsed_secs: 0,
            duration_secs: self.inner.settings.duration_secs,
            remaining_secs: 0,
            bytes_written: 0,
            mb_per_sec: 0.0,
            current_file: None,
            segment: 0,
            frames: 0,
            depth_samples: 0,
            depth_rate_hz: self.inner.depth_rate.load(Ordering::Relaxed),
            exposure: selection.exposure.as_raw(),
            gain: selection.gain.as_raw(),
            camera_open,
            camera_initializing: self.is_camera_initializing(),
            last_error: self.inner.last_error.lock().clone(),
            message: self.inner.message.lock().clone(),
        };

        let session = self.inner.session.lock();
        if let Some(s) = session.as_ref() {
            let elapsed = s.started.elapsed();
            let bytes = s.counters.bytes.get();
            let segment_secs = s.segment_started.elapsed().as_secs_f64();
            let target = s.target.read().clone();
            status.session_id = Some(s.id);
            status.session = Some(s.layout.name());
            status.started_at = Some(s.started_at.to_rfc3339());
            status.elapsed_secs = elapsed.as_secs();
            status.duration_secs = s.duration.as_secs();
            status.remaining_secs = s.duration.saturating_sub(elapsed).as_secs();
            status.bytes_written = bytes;
            status.mb_per_sec = if segment_secs > 0.0 {
                bytes as f64 / MIB as f64 / segment_secs
            } else {
                0.0
            };
            status.current_file = Some(if s.mode.uses_container() {
                target.video
            } else {
                s.layout.dir().to_path_buf()
            });
            status.segment = target.index;
            status.frames = s.counters.frames();
            status.depth_samples = s.counters.depth_samples();
        } else if let Some(last) = self.inner.last_summary.lock().as_ref() {
            status.session_id = Some(last.id);
            status.session = Some(last.dir.display().to_string());
            status.bytes_written = last.bytes;
            status.current_file = last.video.clone();
            status.segment = last.segments.saturating_sub(1);
            status.frames = last.frames;
            status.depth_samples = last.depth_samples;
        }
        status
    }

    /// Reject new requests, stop any session, release the camera
    ///
    /// Idempotent.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.trigger();
        info!("Recorder shutting down");
        {
            let _life = self.inner.lifecycle.lock();
            let active = self.inner.session.lock().is_some();
            if active {
                self.finish_session(StopCause::Shutdown);
            }
            let selector = self.inner.device.lock().take();
            if let Some(selector) = selector {
                selector.close_all();
            }
            self.set_state(RecorderState::Idle);
            self.set_message("Shut down");
        }
        let monitor = self.inner.monitor.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = join_bounded(handle, Duration::from_secs(1)) {
                debug!("Session monitor not joined: {}", e);
            }
        }
        info!("Recorder shut down");
    }
}

/// Remove the files of a segment that never became the write target
fn discard_segment(segment: &SegmentPaths, with_video: bool) {
    let mut paths = vec![segment.telemetry.clone()];
    if with_video {
        paths.push(segment.video.clone());
        paths.push(container_variant(&segment.video));
    }
    for path in paths {
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Abandoned segment file removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Abandoned segment file {} not removed: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_segment_removes_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(dir.path());
        let segment = layout.segment(1);
        fs::write(&segment.telemetry, b"timestamp\n").unwrap();
        fs::write(container_variant(&segment.video), b"partial").unwrap();

        discard_segment(&segment, true);
        assert!(!segment.telemetry.exists());
        assert!(!segment.video.exists());
        assert!(!container_variant(&segment.video).exists());

        // Nothing left to remove is not an error
        discard_segment(&segment, true);
    }

    #[test]
    fn test_discard_segment_keeps_video_when_asked() {
        let dir = tempfile::tempdir().unwrap();
        let layout = SessionLayout::new(dir.path());
        let segment = layout.segment(2);
        fs::write(&segment.telemetry, b"timestamp\n").unwrap();
        fs::write(&segment.video, b"finalized").unwrap();

        discard_segment(&segment, false);
        assert!(!segment.telemetry.exists());
        assert!(segment.video.exists());
    }

    #[test]
    fn test_grace_delays_scale_with_size() {
        let grace = GracePolicy::default();
        assert_eq!(grace.pre_disable(GIB), None);
        assert_eq!(grace.pre_disable(GIB + 1), Some(Duration::from_millis(500)));
        assert_eq!(grace.post_disable(10 * MIB), Duration::from_millis(500));
        assert_eq!(grace.post_disable(GIB + 1), Duration::from_secs(2));
        assert_eq!(grace.post_disable(2 * GIB + 1), Duration::from_secs(3));
        assert_eq!(GracePolicy::immediate().post_disable(3 * GIB), Duration::ZERO);
    }

    #[test]
    fn test_invalid_configured_pair_is_coupled() {
        let settings = RecorderSettings {
            mode: RecordingMode::CompressedWithDepthImages,
            depth: DepthLevel::None,
            exposure: 300,
            ..RecorderSettings::default()
        };
        let selection = Selection::from_settings(&settings);
        assert_eq!(selection.modes.depth(), DepthLevel::DEFAULT_TIER);
        assert_eq!(selection.exposure, SettingValue::Auto);
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: RecorderSettings = serde_json::from_str(
            r#"{"mode":"raw_multi_stream","profile":"vga100","rotation":{"strategy":"dual_handle"}}"#,
        )
        .unwrap();
        assert_eq!(settings.mode, RecordingMode::RawMultiStream);
        assert_eq!(settings.profile, CaptureProfile::Vga100);
        assert_eq!(settings.rotation.strategy, RotationKind::DualHandle);
        assert_eq!(settings.rotation.verify_timeout_ms, 3000);
        assert_eq!(settings.timings.settle_ms, 3000);
        assert_eq!(settings.duration_secs, 240);
    }
}
