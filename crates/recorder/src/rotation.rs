//! Segment rotation strategies
//!
//! Each strategy switches the active write target from `current` to `next`
//! while the worker keeps grabbing. On success the new target exists and
//! the old one is finalized. `RotationError::RolledBack` means the old
//! target is still the live one; `RotationError::SessionStopped` means the
//! old target was already finalized and the caller must stop the session.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use camera_capture::{CameraError, Compression, View, WriteParams};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::RotationError;
use crate::selector::{DeviceSelector, SharedDevice};
use crate::session::wait_for_target;

/// Selectable rotation algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationKind {
    /// Pause, finalize, re-enable: safest, largest gap
    #[default]
    Sequential,
    /// Finalize and re-enable back to back
    Fast,
    /// Enable the new target before finalizing the old one
    Overlapped,
    /// Enable on a second handle, then flip the active selector
    DualHandle,
    /// Experimental: buffer frames in memory during teardown (discarded)
    MemoryBuffered,
}

impl RotationKind {
    pub fn name(self) -> &'static str {
        match self {
            RotationKind::Sequential => "sequential",
            RotationKind::Fast => "fast",
            RotationKind::Overlapped => "overlapped",
            RotationKind::DualHandle => "dual_handle",
            RotationKind::MemoryBuffered => "memory_buffered",
        }
    }

    pub fn strategy(self) -> Box<dyn RotationStrategy> {
        match self {
            RotationKind::Sequential => Box::new(SequentialSwitch),
            RotationKind::Fast => Box::new(FastSwitch),
            RotationKind::Overlapped => Box::new(OverlappedSwitch),
            RotationKind::DualHandle => Box::new(DualHandleSwap),
            RotationKind::MemoryBuffered => Box::new(MemoryBufferedSwitch),
        }
    }
}

impl fmt::Display for RotationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RotationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "sequential" => Ok(RotationKind::Sequential),
            "fast" => Ok(RotationKind::Fast),
            "overlapped" => Ok(RotationKind::Overlapped),
            "dual_handle" | "dual" => Ok(RotationKind::DualHandle),
            "memory_buffered" | "buffered" => Ok(RotationKind::MemoryBuffered),
            other => Err(format!("unknown rotation strategy '{}'", other)),
        }
    }
}

/// Rotation tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RotationSettings {
    pub strategy: RotationKind,
    /// Rotate automatically after this many seconds (0 = on request only)
    pub segment_secs: u64,
    /// Sequential: wait between pausing and finalizing
    pub pause_settle_ms: u64,
    /// Time allowed for a new target to appear
    pub verify_timeout_ms: u64,
    /// Fast switch existence check budget
    pub fast_verify_timeout_ms: u64,
    /// Overlapped: dual-write window before the old target is finalized
    pub overlap_settle_ms: u64,
    pub verify_poll_ms: u64,
    /// Memory-buffered: frames held at most
    pub buffer_capacity: usize,
}

impl Default for RotationSettings {
    fn default() -> Self {
        Self {
            strategy: RotationKind::Sequential,
            segment_secs: 0,
            pause_settle_ms: 100,
            verify_timeout_ms: 3000,
            fast_verify_timeout_ms: 1000,
            overlap_settle_ms: 100,
            verify_poll_ms: 20,
            buffer_capacity: 150,
        }
    }
}

/// Inputs of one rotation attempt
pub struct RotationContext<'a> {
    pub selector: &'a Arc<DeviceSelector>,
    pub current: &'a Path,
    pub next: &'a Path,
    pub compression: Compression,
    pub fps: u32,
    pub settings: &'a RotationSettings,
}

impl RotationContext<'_> {
    fn params(&self) -> WriteParams {
        WriteParams::new(self.next, self.compression, self.fps)
    }

    fn wait_for_next(&self, timeout_ms: u64) -> Option<PathBuf> {
        wait_for_target(
            self.next,
            Duration::from_millis(timeout_ms),
            Duration::from_millis(self.settings.verify_poll_ms),
        )
    }

    /// Roll back a new target that never appeared while the old one lives
    fn abandon_next(&self, device: &SharedDevice, reason: String) -> RotationError {
        device.lock().disable_write(self.next);
        RotationError::RolledBack(reason)
    }

    /// Confirm the new target after the old one was finalized
    fn confirm_after_close(
        &self,
        device: &SharedDevice,
        timeout_ms: u64,
    ) -> Result<PathBuf, RotationError> {
        match self.wait_for_next(timeout_ms) {
            Some(path) => Ok(path),
            None => {
                device.lock().disable_write(self.next);
                Err(RotationError::SessionStopped(format!(
                    "{} did not appear within {}ms",
                    self.next.display(),
                    timeout_ms
                )))
            }
        }
    }

    fn missing(&self) -> String {
        format!(
            "{} did not appear within {}ms",
            self.next.display(),
            self.settings.verify_timeout_ms
        )
    }
}

/// Result of a successful switch
#[derive(Debug)]
pub struct RotationReport {
    /// Strategy that actually performed the switch (after fallbacks)
    pub strategy: &'static str,
    /// Path the hardware is writing (may carry the container suffix)
    pub video: PathBuf,
    pub elapsed: Duration,
    /// Deferred finalization of the previous handle
    pub teardown: Option<JoinHandle<()>>,
    /// Frames grabbed into memory and dropped
    pub discarded_frames: usize,
}

impl RotationReport {
    fn new(strategy: &'static str, video: PathBuf, started: Instant) -> Self {
        Self {
            strategy,
            video,
            elapsed: started.elapsed(),
            teardown: None,
            discarded_frames: 0,
        }
    }
}

/// A segment switching algorithm
pub trait RotationStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn rotate(&self, ctx: &RotationContext<'_>) -> Result<RotationReport, RotationError>;
}

fn enable_failed(ctx: &RotationContext<'_>, e: CameraError) -> RotationError {
    RotationError::SessionStopped(format!("enable {}: {}", ctx.next.display(), e))
}

/// Pause, finalize the old target, enable the new one
pub struct SequentialSwitch;

impl RotationStrategy for SequentialSwitch {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn rotate(&self, ctx: &RotationContext<'_>) -> Result<RotationReport, RotationError> {
        let started = Instant::now();
        let device = ctx.selector.active();

        device.lock().pause_write(true);
        thread::sleep(Duration::from_millis(ctx.settings.pause_settle_ms));

        {
            let mut dev = device.lock();
            dev.disable_write(ctx.current);
            dev.enable_write(&ctx.params())
                .map_err(|e| enable_failed(ctx, e))?;
        }

        let video = ctx.confirm_after_close(&device, ctx.settings.verify_timeout_ms)?;
        Ok(RotationReport::new(self.name(), video, started))
    }
}

/// Finalize and enable back to back, short existence check
pub struct FastSwitch;

impl RotationStrategy for FastSwitch {
    fn name(&self) -> &'static str {
        "fast"
    }

    fn rotate(&self, ctx: &RotationContext<'_>) -> Result<RotationReport, RotationError> {
        let started = Instant::now();
        let device = ctx.selector.active();
        {
            let mut dev = device.lock();
            dev.disable_write(ctx.current);
            dev.enable_write(&ctx.params())
                .map_err(|e| enable_failed(ctx, e))?;
        }
        let video = ctx.confirm_after_close(&device, ctx.settings.fast_verify_timeout_ms)?;
        Ok(RotationReport::new(self.name(), video, started))
    }
}

/// Dual-write window, pause-switch fallback when the hardware refuses it
pub struct OverlappedSwitch;

impl RotationStrategy for OverlappedSwitch {
    fn name(&self) -> &'static str {
        "overlapped"
    }

    fn rotate(&self, ctx: &RotationContext<'_>) -> Result<RotationReport, RotationError> {
        let started = Instant::now();
        let device = ctx.selector.active();

        let enabled = device.lock().enable_write(&ctx.params());
        match enabled {
            Ok(()) => {
                let Some(video) = ctx.wait_for_next(ctx.settings.verify_timeout_ms) else {
                    return Err(ctx.abandon_next(&device, ctx.missing()));
                };
                thread::sleep(Duration::from_millis(ctx.settings.overlap_settle_ms));
                {
                    let mut dev = device.lock();
                    dev.pause_write(true);
                    dev.disable_write(ctx.current);
                    dev.pause_write(false);
                }
                Ok(RotationReport::new(self.name(), video, started))
            }
            Err(CameraError::WriteBusy) => {
                info!("Dual write refused, falling back to pause-switch");
                {
                    let mut dev = device.lock();
                    dev.pause_write(true);
                    dev.disable_write(ctx.current);
                    dev.enable_write(&ctx.params())
                        .map_err(|e| enable_failed(ctx, e))?;
                }
                let video = ctx.confirm_after_close(&device, ctx.settings.verify_timeout_ms)?;
                Ok(RotationReport::new(self.name(), video, started))
            }
            Err(e) => Err(RotationError::RolledBack(format!(
                "enable {}: {}",
                ctx.next.display(),
                e
            ))),
        }
    }
}

/// Enable on the standby handle and flip the selector
pub struct DualHandleSwap;

impl RotationStrategy for DualHandleSwap {
    fn name(&self) -> &'static str {
        "dual_handle"
    }

    fn rotate(&self, ctx: &RotationContext<'_>) -> Result<RotationReport, RotationError> {
        let started = Instant::now();
        let Some(standby) = ctx.selector.take_standby() else {
            warn!("No standby handle available, using overlapped switch");
            return OverlappedSwitch.rotate(ctx);
        };

        let enabled = standby.lock().enable_write(&ctx.params());
        if let Err(e) = enabled {
            ctx.selector.set_standby(standby);
            return Err(RotationError::RolledBack(format!(
                "standby refused {}: {}",
                ctx.next.display(),
                e
            )));
        }
        let Some(video) = ctx.wait_for_next(ctx.settings.verify_timeout_ms) else {
            let err = ctx.abandon_next(&standby, ctx.missing());
            ctx.selector.set_standby(standby);
            return Err(err);
        };

        let previous = ctx.selector.flip(standby);
        let mut report = RotationReport::new(self.name(), video, started);

        let selector = Arc::clone(ctx.selector);
        let current = ctx.current.to_path_buf();
        let spawned = thread::Builder::new()
            .name("rotation-teardown".into())
            .spawn(move || {
                let t = Instant::now();
                previous.lock().disable_write(&current);
                selector.set_standby(previous);
                info!(
                    path = %current.display(),
                    elapsed_ms = t.elapsed().as_millis() as u64,
                    "Previous handle finalized and parked as standby"
                );
            });
        match spawned {
            Ok(handle) => report.teardown = Some(handle),
            // The dropped device closes itself, finalizing the old target
            Err(e) => warn!("Teardown thread not started ({}), previous handle released", e),
        }
        Ok(report)
    }
}

/// Experimental: grab into memory while the old target is finalized
///
/// The bridging grabs run on the live device, so the hardware still
/// encodes those frames into the enabled targets. They bypass the
/// recording worker, which means they are missing from the frame counter
/// and the telemetry file. The in-memory copies are not reconciled into
/// the new segment; they are counted and dropped.
pub struct MemoryBufferedSwitch;

impl RotationStrategy for MemoryBufferedSwitch {
    fn name(&self) -> &'static str {
        "memory_buffered"
    }

    fn rotate(&self, ctx: &RotationContext<'_>) -> Result<RotationReport, RotationError> {
        let started = Instant::now();
        let device = ctx.selector.active();

        let enabled = device.lock().enable_write(&ctx.params());
        if let Err(e) = enabled {
            warn!("Memory-buffered switch could not enable new target ({}), using overlapped switch", e);
            return OverlappedSwitch.rotate(ctx);
        }
        let Some(video) = ctx.wait_for_next(ctx.settings.verify_timeout_ms) else {
            return Err(ctx.abandon_next(&device, ctx.missing()));
        };

        let teardown_done = AtomicBool::new(false);
        let frame_interval = Duration::from_millis(1000 / u64::from(ctx.fps.max(1)));
        let capacity = ctx.settings.buffer_capacity;

        let buffered = thread::scope(|scope| {
            let buffering = scope.spawn(|| {
                let mut frames = Vec::with_capacity(capacity);
                while frames.len() < capacity && !teardown_done.load(Ordering::SeqCst) {
                    {
                        let mut dev = device.lock();
                        let grabbed = dev.grab().map(|s| s.has_frame()).unwrap_or(false);
                        if grabbed {
                            if let Ok(image) = dev.retrieve_image(View::Left) {
                                frames.push(image);
                            }
                        }
                    }
                    thread::sleep(frame_interval);
                }
                frames
            });

            {
                let mut dev = device.lock();
                dev.pause_write(true);
                dev.disable_write(ctx.current);
                dev.pause_write(false);
            }
            teardown_done.store(true, Ordering::SeqCst);
            buffering.join().unwrap_or_default()
        });

        warn!(
            frames = buffered.len(),
            "Bridging copies discarded; these frames have no telemetry rows"
        );
        let mut report = RotationReport::new(self.name(), video, started);
        report.discarded_frames = buffered.len();
        Ok(report)
    }
}
