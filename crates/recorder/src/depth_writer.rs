//! Depth side-channel writer
//!
//! Runs beside the recording worker and samples the depth measurement of
//! the most recently grabbed frame at its own rate. The rate is re-read on
//! every iteration, so changes take effect mid-session.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use camera_capture::{CameraError, DepthMap};
use image::ImageFormat;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::selector::DeviceSelector;
use crate::session::{SessionCounters, ShutdownSignal};
use crate::worker::join_bounded;

const HEADER_LEN: usize = 12;

/// One binary depth sample
///
/// Layout (little endian): `width:i32, height:i32, frame_index:i32`,
/// followed by `width * height` `f32` values in meters, row major.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthRecord {
    pub width: i32,
    pub height: i32,
    pub frame_index: i32,
    pub values: Vec<f32>,
}

impl DepthRecord {
    pub fn from_map(map: &DepthMap, frame_index: u64) -> Self {
        Self {
            width: map.width as i32,
            height: map.height as i32,
            frame_index: i32::try_from(frame_index).unwrap_or(i32::MAX),
            values: map.values.clone(),
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.values.len() * 4
    }

    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        out.write_i32::<LittleEndian>(self.width)?;
        out.write_i32::<LittleEndian>(self.height)?;
        out.write_i32::<LittleEndian>(self.frame_index)?;
        for value in &self.values {
            out.write_f32::<LittleEndian>(*value)?;
        }
        Ok(())
    }

    /// Decode one record, rejecting short or over-long payloads
    pub fn read_from<R: Read>(input: &mut R) -> io::Result<Self> {
        let width = input.read_i32::<LittleEndian>()?;
        let height = input.read_i32::<LittleEndian>()?;
        let frame_index = input.read_i32::<LittleEndian>()?;
        if width < 0 || height < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("negative dimensions {}x{}", width, height),
            ));
        }
        let count = (width as usize)
            .checked_mul(height as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "dimensions overflow"))?;

        let mut values = vec![0f32; count];
        input.read_f32_into::<LittleEndian>(&mut values)?;

        let mut trailing = [0u8; 1];
        if input.read(&mut trailing)? != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("payload longer than {}x{} values", width, height),
            ));
        }

        Ok(Self {
            width,
            height,
            frame_index,
            values,
        })
    }
}

/// What each retained sample becomes on disk
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DepthOutput {
    /// `depth_NNNNNN.depth` binary records
    Records,
    /// `depth_NNNNNN.png` grayscale, clamped at `max_range_m`
    Images { max_range_m: f32 },
}

/// Depth side-channel tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DepthWriterConfig {
    /// Initial samples per second (0 = retrieve and discard)
    pub rate_hz: u32,
    /// Loop interval while the rate is 0
    pub discard_interval_ms: u64,
    /// Poll interval while waiting for the next sample
    pub poll_interval_ms: u64,
    /// Far clamp of the grayscale visualisation
    pub max_range_m: f32,
}

impl Default for DepthWriterConfig {
    fn default() -> Self {
        Self {
            rate_hz: 10,
            discard_interval_ms: 100,
            poll_interval_ms: 5,
            max_range_m: 20.0,
        }
    }
}

/// Everything the depth thread needs
pub struct DepthWriterContext {
    pub selector: Arc<DeviceSelector>,
    pub counters: Arc<SessionCounters>,
    pub rate: Arc<AtomicU32>,
    pub output: DepthOutput,
    pub dir: PathBuf,
    pub config: DepthWriterConfig,
    pub shutdown: ShutdownSignal,
}

/// Handle to the running depth thread
pub struct DepthWriter {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<u64>>,
}

impl DepthWriter {
    pub fn spawn(ctx: DepthWriterContext) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = thread::Builder::new()
            .name("depth-writer".into())
            .spawn(move || run(ctx, stop_clone))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Stop and wait up to `timeout`; returns samples written if joined
    pub fn stop(mut self, timeout: Duration) -> Option<u64> {
        self.request_stop();
        let handle = self.handle.take()?;
        match join_bounded(handle, timeout) {
            Ok(written) => Some(written),
            Err(e) => {
                warn!("Depth writer not joined: {}", e);
                None
            }
        }
    }
}

impl Drop for DepthWriter {
    fn drop(&mut self) {
        self.request_stop();
    }
}

fn retrieve(ctx: &DepthWriterContext) -> Result<DepthMap, CameraError> {
    let device = ctx.selector.active();
    let result = device.lock().retrieve_depth();
    ctx.counters.depth_retrievals.fetch_add(1, Ordering::Relaxed);
    result
}

fn persist(ctx: &DepthWriterContext, map: &DepthMap, frame: u64) -> Result<(), String> {
    match ctx.output {
        DepthOutput::Records => {
            let path = ctx.dir.join(format!("depth_{:06}.depth", frame));
            let file = File::create(&path).map_err(|e| format!("{}: {}", path.display(), e))?;
            let mut out = BufWriter::new(file);
            DepthRecord::from_map(map, frame)
                .write_to(&mut out)
                .and_then(|_| out.flush())
                .map_err(|e| format!("{}: {}", path.display(), e))
        }
        DepthOutput::Images { max_range_m } => {
            let path = ctx.dir.join(format!("depth_{:06}.png", frame));
            map.to_visualization(max_range_m)
                .save_with_format(&path, ImageFormat::Png)
                .map_err(|e| format!("{}: {}", path.display(), e))
        }
    }
}

/// Time between samples at `rate_hz`, never shorter than one poll
fn sample_interval(rate_hz: u32, poll: Duration) -> Duration {
    Duration::from_millis(1000 / u64::from(rate_hz.max(1))).max(poll)
}

fn run(ctx: DepthWriterContext, stop: Arc<AtomicBool>) -> u64 {
    let poll = Duration::from_millis(ctx.config.poll_interval_ms);
    let discard_interval = Duration::from_millis(ctx.config.discard_interval_ms);
    let mut current_rate = None;
    let mut next_due = Instant::now();
    let mut last_frame = 0u64;
    let mut written = 0u64;
    let mut failures = 0u64;

    info!(dir = %ctx.dir.display(), output = ?ctx.output, "Depth writer started");

    while !stop.load(Ordering::SeqCst) && !ctx.shutdown.is_triggered() {
        let rate = ctx.rate.load(Ordering::Relaxed);

        if rate == 0 {
            if current_rate != Some(0) {
                info!("Depth rate 0: computing without writing");
                current_rate = Some(0);
            }
            if let Err(e) = retrieve(&ctx) {
                debug!("Depth retrieve failed: {}", e);
            }
            thread::sleep(discard_interval);
            continue;
        }

        let interval = sample_interval(rate, poll);
        if current_rate != Some(rate) {
            info!(rate, interval_ms = interval.as_millis() as u64, "Depth rate changed");
            current_rate = Some(rate);
            next_due = Instant::now() + interval;
        }

        let now = Instant::now();
        if now < next_due {
            thread::sleep(poll.min(next_due - now));
            continue;
        }
        next_due += interval;
        if next_due < now {
            next_due = now + interval;
        }

        // Write only when the main stream has produced a new frame
        let frame = ctx.counters.frames();
        if frame == 0 || frame == last_frame {
            continue;
        }

        match retrieve(&ctx).map_err(|e| e.to_string()).and_then(|map| {
            persist(&ctx, &map, frame)
        }) {
            Ok(()) => {
                last_frame = frame;
                written += 1;
                ctx.counters.depth_samples.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                failures += 1;
                if failures == 1 || failures % 100 == 0 {
                    warn!(failures, "Depth sample {} not written: {}", frame, e);
                }
            }
        }
    }

    info!(written, failures, "Depth writer stopped");
    written
}
