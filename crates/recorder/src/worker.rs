//! Recording worker
//!
//! Drives the active capture device until told to stop: grabs frames,
//! samples telemetry at a decimated rate, tracks bytes from the filesystem
//! and watches for timing gaps and stalled file growth.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camera_capture::{GrabStatus, TelemetrySample};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::profile::{telemetry_decimation, worker_sleep};
use crate::selector::DeviceSelector;
use crate::session::{target_size, SessionCounters, SharedTarget, ShutdownSignal};
use crate::sink::RawFrameSink;
use crate::telemetry::TelemetryWriter;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Telemetry writer swapped by segment rotation
pub type SharedTelemetry = Arc<Mutex<Option<TelemetryWriter>>>;

/// Recording loop tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Consecutive grab failures that abort the session
    pub failure_ceiling: u32,
    /// Sleep after a failed grab
    pub failure_backoff_ms: u64,
    /// Inter-frame interval reported as a gap
    pub gap_threshold_ms: u64,
    /// Gap warnings logged per session
    pub max_gap_warnings: u32,
    /// Window of the growth stall check
    pub stall_check_secs: u64,
    /// Minimum growth per window before a stall is reported
    pub stall_min_growth_bytes: u64,
    /// Stalls are only reported above this size
    pub stall_size_floor_bytes: u64,
    /// One-time notice once a file passes this size
    pub large_file_notice_bytes: u64,
    /// Frames between status lines and telemetry flushes
    pub status_interval_frames: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            failure_ceiling: 10,
            failure_backoff_ms: 100,
            gap_threshold_ms: 500,
            max_gap_warnings: 5,
            stall_check_secs: 10,
            stall_min_growth_bytes: 10 * MIB,
            stall_size_floor_bytes: GIB,
            large_file_notice_bytes: 16 * GIB,
            status_interval_frames: 1800,
        }
    }
}

/// Where grabbed frames end up
pub enum FrameSink {
    /// The hardware writes the container; the worker only measures it
    Container(SharedTarget),
    /// The worker encodes every frame itself
    Raw(RawFrameSink),
}

/// Why the worker loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    FailureCeiling { failures: u32, last_error: String },
    EndOfInput,
}

impl WorkerExit {
    /// Reason to surface when the loop ended on its own
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            WorkerExit::FailureCeiling {
                failures,
                last_error,
            } => Some(format!(
                "Recording aborted after {} consecutive grab failures: {}",
                failures, last_error
            )),
            _ => None,
        }
    }
}

/// Everything the worker thread owns or shares
pub struct WorkerContext {
    pub selector: Arc<DeviceSelector>,
    pub sink: FrameSink,
    pub telemetry: SharedTelemetry,
    pub counters: Arc<SessionCounters>,
    pub fps: u32,
    pub config: WorkerConfig,
    pub shutdown: ShutdownSignal,
}

/// Handle to the running worker thread
pub struct RecordingWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<WorkerExit>>,
}

impl RecordingWorker {
    pub fn spawn(ctx: WorkerContext) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = thread::Builder::new()
            .name("recording-worker".into())
            .spawn(move || run(ctx, stop_clone))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the loop to exit at its next iteration boundary
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Stop and wait up to `timeout` for the loop to exit
    pub fn stop(mut self, timeout: Duration) -> Result<WorkerExit, String> {
        self.request_stop();
        match self.handle.take() {
            Some(handle) => join_bounded(handle, timeout),
            None => Ok(WorkerExit::Stopped),
        }
    }
}

impl Drop for RecordingWorker {
    fn drop(&mut self) {
        self.request_stop();
    }
}

/// Join a thread, giving up (and detaching it) after `timeout`
pub(crate) fn join_bounded<T>(handle: JoinHandle<T>, timeout: Duration) -> Result<T, String> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(format!("thread did not exit within {:?}", timeout));
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle.join().map_err(|_| "thread panicked".to_string())
}

struct StallMonitor {
    window: Duration,
    checked_at: Instant,
    bytes_at_check: u64,
}

impl StallMonitor {
    fn new(window: Duration) -> Self {
        Self {
            window,
            checked_at: Instant::now(),
            bytes_at_check: 0,
        }
    }

    /// Growth over the finished window, if one just finished
    fn check(&mut self, bytes: u64) -> Option<u64> {
        if self.checked_at.elapsed() < self.window {
            return None;
        }
        let growth = bytes.saturating_sub(self.bytes_at_check);
        self.checked_at = Instant::now();
        self.bytes_at_check = bytes;
        Some(growth)
    }
}

fn append_telemetry(telemetry: &SharedTelemetry, counters: &SessionCounters, sample: &TelemetrySample) {
    let mut guard = telemetry.lock();
    let Some(writer) = guard.as_mut() else {
        return;
    };
    match writer.append(sample) {
        Ok(true) => {
            counters.telemetry_rows.fetch_add(1, Ordering::Relaxed);
        }
        Ok(false) => {}
        Err(e) => warn!("Telemetry write to {} failed: {}", writer.path().display(), e),
    }
}

fn flush_telemetry(telemetry: &SharedTelemetry) {
    if let Some(writer) = telemetry.lock().as_mut() {
        if let Err(e) = writer.flush() {
            warn!("Telemetry flush failed: {}", e);
        }
    }
}

fn run(mut ctx: WorkerContext, stop: Arc<AtomicBool>) -> WorkerExit {
    let cfg = ctx.config.clone();
    let decimation = telemetry_decimation(ctx.fps);
    let idle = worker_sleep(ctx.fps);
    let backoff = Duration::from_millis(cfg.failure_backoff_ms);
    let gap_threshold = Duration::from_millis(cfg.gap_threshold_ms);
    let mut stall = StallMonitor::new(Duration::from_secs(cfg.stall_check_secs));

    let mut failures = 0u32;
    let mut frames = 0u64;
    let mut last_frame_at: Option<Instant> = None;
    let mut gap_warnings = 0u32;
    let mut corrupt_burst = false;
    let mut large_file_noticed = false;
    let started = Instant::now();

    info!(
        fps = ctx.fps,
        decimation,
        idle_ms = idle.as_millis() as u64,
        "Recording worker started"
    );

    while !stop.load(Ordering::SeqCst) && !ctx.shutdown.is_triggered() {
        let index = frames + 1;
        let sample_due = index % decimation == 0;

        let device = ctx.selector.active();
        let (status, sample, raw) = {
            let mut dev = device.lock();
            let status = dev
                .grab()
                .unwrap_or_else(|e| GrabStatus::TransientFailure(e.to_string()));
            if status.has_frame() {
                let sample = if sample_due {
                    dev.sensors()
                        .map_err(|e| debug!("Telemetry unavailable: {}", e))
                        .ok()
                } else {
                    None
                };
                let raw = match &ctx.sink {
                    FrameSink::Raw(sink) => Some(sink.capture(&mut dev, index)),
                    FrameSink::Container(_) => None,
                };
                (status, sample, raw)
            } else {
                (status, None, None)
            }
        };
        drop(device);

        match status {
            GrabStatus::TransientFailure(reason) => {
                failures += 1;
                ctx.counters
                    .consecutive_failures
                    .store(failures, Ordering::SeqCst);
                if failures >= cfg.failure_ceiling {
                    error!(failures, "Grab failure ceiling reached, stopping: {}", reason);
                    flush_telemetry(&ctx.telemetry);
                    return WorkerExit::FailureCeiling {
                        failures,
                        last_error: reason,
                    };
                }
                warn!(failures, "Grab failed: {}", reason);
                thread::sleep(backoff);
                continue;
            }
            GrabStatus::EndOfInput => {
                info!(frames, "End of input");
                flush_telemetry(&ctx.telemetry);
                return WorkerExit::EndOfInput;
            }
            GrabStatus::CorruptedFrame => {
                ctx.counters.corrupted_frames.fetch_add(1, Ordering::Relaxed);
                if !corrupt_burst {
                    warn!(frame = index, "Corrupted frame, keeping best-effort data");
                    corrupt_burst = true;
                }
            }
            GrabStatus::Success => {
                corrupt_burst = false;
            }
        }

        if failures > 0 {
            debug!("Grab recovered after {} failures", failures);
            failures = 0;
            ctx.counters.consecutive_failures.store(0, Ordering::SeqCst);
        }

        let now = Instant::now();
        if let Some(previous) = last_frame_at {
            let gap = now - previous;
            if gap > gap_threshold && gap_warnings < cfg.max_gap_warnings {
                gap_warnings += 1;
                warn!(
                    gap_ms = gap.as_millis() as u64,
                    warning = gap_warnings,
                    "Frame gap detected"
                );
            }
        }
        last_frame_at = Some(now);

        frames = index;
        ctx.counters.frames.store(frames, Ordering::SeqCst);

        if let Some(sample) = sample {
            append_telemetry(&ctx.telemetry, &ctx.counters, &sample);
        }

        match &mut ctx.sink {
            FrameSink::Container(target) => {
                let target = target.read().clone();
                if let Some(size) = target_size(&target.video) {
                    ctx.counters.bytes.observe(target.index, size);
                }
            }
            FrameSink::Raw(sink) => {
                match raw {
                    Some(Ok(frame)) => {
                        sink.write(&frame);
                    }
                    Some(Err(e)) => debug!(frame = index, "Raw retrieve failed: {}", e),
                    None => {}
                }
                ctx.counters.bytes.observe(0, sink.bytes());
            }
        }
        let bytes = ctx.counters.bytes.get();

        if let Some(growth) = stall.check(bytes) {
            if bytes > cfg.stall_size_floor_bytes && growth < cfg.stall_min_growth_bytes {
                warn!(
                    size_mb = bytes / MIB,
                    growth_mb = growth / MIB,
                    "File growth stalled, possible buffer buildup"
                );
            }
        }

        if !large_file_noticed && bytes > cfg.large_file_notice_bytes {
            large_file_noticed = true;
            info!(size_gb = bytes / GIB, "Recording file is very large, still writing");
        }

        if cfg.status_interval_frames > 0 && frames % cfg.status_interval_frames == 0 {
            let elapsed = started.elapsed().as_secs_f64();
            info!(
                frames,
                size_mb = bytes / MIB,
                fps = format!("{:.1}", frames as f64 / elapsed.max(0.001)),
                "Recording status"
            );
            flush_telemetry(&ctx.telemetry);
        }

        thread::sleep(idle);
    }

    flush_telemetry(&ctx.telemetry);
    info!(frames, "Recording worker stopped");
    WorkerExit::Stopped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::DeviceSelector;
    use crate::session::SegmentTarget;
    use camera_capture::{
        CameraConfig, CaptureDevice, Compression, OpenRetry, SimConfig, SimulatedDriver,
        WriteParams,
    };
    use parking_lot::RwLock;

    struct Rig {
        driver: SimulatedDriver,
        selector: Arc<DeviceSelector>,
        counters: Arc<SessionCounters>,
        telemetry: SharedTelemetry,
        target: SharedTarget,
        _dir: tempfile::TempDir,
    }

    fn rig() -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let driver = SimulatedDriver::new(SimConfig {
            bytes_per_frame: 1000,
            ..SimConfig::unpaced()
        });
        let mut device = CaptureDevice::open(
            &driver,
            &CameraConfig::default(),
            &OpenRetry::default(),
            "primary",
        )
        .unwrap();
        let video = dir.path().join("video.svo");
        device
            .enable_write(&WriteParams::new(&video, Compression::Lossless, 30))
            .unwrap();
        let telemetry = TelemetryWriter::create(dir.path().join("sensors.csv"), None).unwrap();
        Rig {
            driver,
            selector: Arc::new(DeviceSelector::new(device)),
            counters: Arc::new(SessionCounters::default()),
            telemetry: Arc::new(Mutex::new(Some(telemetry))),
            target: Arc::new(RwLock::new(SegmentTarget { index: 0, video })),
            _dir: dir,
        }
    }

    fn spawn(rig: &Rig) -> RecordingWorker {
        RecordingWorker::spawn(WorkerContext {
            selector: rig.selector.clone(),
            sink: FrameSink::Container(rig.target.clone()),
            telemetry: rig.telemetry.clone(),
            counters: rig.counters.clone(),
            fps: 30,
            config: WorkerConfig {
                failure_backoff_ms: 1,
                ..WorkerConfig::default()
            },
            shutdown: ShutdownSignal::new(),
        })
        .unwrap()
    }

    fn wait_for(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_failure_ceiling_stops_worker() {
        let rig = rig();
        rig.driver.state().fail_grabs_forever(true);
        let worker = spawn(&rig);
        wait_for(|| worker.is_finished());
        let exit = worker.stop(Duration::from_secs(1)).unwrap();
        assert!(matches!(exit, WorkerExit::FailureCeiling { failures: 10, .. }));
        assert!(exit.failure_reason().unwrap().contains("10 consecutive"));
    }

    #[test]
    fn test_failures_reset_on_success() {
        let rig = rig();
        rig.driver.state().inject_grab_failures(9);
        let worker = spawn(&rig);
        wait_for(|| rig.counters.frames() >= 5);
        assert_eq!(rig.counters.consecutive_failures.load(Ordering::SeqCst), 0);
        assert_eq!(worker.stop(Duration::from_secs(1)), Ok(WorkerExit::Stopped));
    }

    #[test]
    fn test_bytes_follow_file_size_and_telemetry_is_decimated() {
        let rig = rig();
        let worker = spawn(&rig);
        wait_for(|| rig.counters.frames() >= 20);
        assert_eq!(worker.stop(Duration::from_secs(1)), Ok(WorkerExit::Stopped));

        let frames = rig.counters.frames();
        assert!(rig.counters.bytes.get() >= 1000 * frames.saturating_sub(1));
        let rows = rig.counters.telemetry_rows.load(Ordering::SeqCst);
        assert_eq!(rows, frames / 2);
    }

    #[test]
    fn test_end_of_input_exits() {
        let rig = rig();
        rig.driver.state().end_input_after(3);
        let worker = spawn(&rig);
        wait_for(|| worker.is_finished());
        assert_eq!(worker.stop(Duration::from_secs(1)), Ok(WorkerExit::EndOfInput));
        assert_eq!(rig.counters.frames(), 3);
    }

    #[test]
    fn test_corrupted_frames_are_kept() {
        let rig = rig();
        rig.driver.state().inject_corrupted_frames(4);
        let worker = spawn(&rig);
        wait_for(|| rig.counters.frames() >= 6);
        worker.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(rig.counters.corrupted_frames.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_stall_monitor_reports_growth_per_window() {
        let mut monitor = StallMonitor::new(Duration::from_millis(20));
        assert_eq!(monitor.check(1_000), None);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(monitor.check(5_000), Some(5_000));
        assert_eq!(monitor.check(9_000), None);

        thread::sleep(Duration::from_millis(30));
        assert_eq!(monitor.check(9_500), Some(4_500));
    }
}
