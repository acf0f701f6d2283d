//! Raw multi-stream frame sink

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use camera_capture::{CameraError, CaptureDevice, DepthMap, ImageBuffer, View};
use image::codecs::jpeg::JpegEncoder;
use storage::RawLayout;
use tracing::warn;

use crate::depth_writer::DepthRecord;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// Buffers retrieved for one raw frame
pub struct RawFrame {
    pub index: u64,
    pub left: ImageBuffer,
    pub right: ImageBuffer,
    pub depth: Option<DepthMap>,
}

/// Writes per-frame JPEGs and depth records into a raw layout
pub struct RawFrameSink {
    layout: RawLayout,
    jpeg_quality: u8,
    bytes: u64,
    frames: u64,
    failures: u64,
}

impl RawFrameSink {
    pub fn new(layout: RawLayout, jpeg_quality: u8) -> Self {
        Self {
            layout,
            jpeg_quality,
            bytes: 0,
            frames: 0,
            failures: 0,
        }
    }

    pub fn with_depth(&self) -> bool {
        self.layout.depth.is_some()
    }

    /// Retrieve the buffers of the last grabbed frame (device lock held)
    pub fn capture(&self, device: &mut CaptureDevice, index: u64) -> Result<RawFrame, CameraError> {
        let left = device.retrieve_image(View::Left)?;
        let right = device.retrieve_image(View::Right)?;
        let depth = if self.with_depth() {
            Some(device.retrieve_depth()?)
        } else {
            None
        };
        Ok(RawFrame {
            index,
            left,
            right,
            depth,
        })
    }

    /// Encode and store a frame; returns the session byte total
    pub fn write(&mut self, frame: &RawFrame) -> u64 {
        let left = self.layout.left_frame(frame.index);
        let right = self.layout.right_frame(frame.index);
        let mut ok = self.write_jpeg(&left, &frame.left) && self.write_jpeg(&right, &frame.right);

        if let (Some(map), Some(path)) = (&frame.depth, self.layout.depth_frame(frame.index)) {
            ok &= self.write_depth(&path, map, frame.index);
        }

        if ok {
            self.frames += 1;
        }
        self.bytes
    }

    fn record_failure(&mut self, path: &Path, reason: String) {
        self.failures += 1;
        if self.failures == 1 || self.failures % 100 == 0 {
            warn!(failures = self.failures, "Raw write {} failed: {}", path.display(), reason);
        }
    }

    fn add_size(&mut self, path: &Path) {
        if let Ok(meta) = std::fs::metadata(path) {
            self.bytes += meta.len();
        }
    }

    fn write_jpeg(&mut self, path: &Path, image: &ImageBuffer) -> bool {
        let Some(rgb) = image.to_rgb() else {
            self.record_failure(path, "buffer size does not match dimensions".into());
            return false;
        };
        let result = File::create(path)
            .map_err(|e| e.to_string())
            .and_then(|file| {
                let mut out = BufWriter::new(file);
                JpegEncoder::new_with_quality(&mut out, self.jpeg_quality)
                    .encode_image(&rgb)
                    .map_err(|e| e.to_string())?;
                out.flush().map_err(|e| e.to_string())
            });
        match result {
            Ok(()) => {
                self.add_size(path);
                true
            }
            Err(e) => {
                self.record_failure(path, e);
                false
            }
        }
    }

    fn write_depth(&mut self, path: &Path, map: &DepthMap, index: u64) -> bool {
        let result = File::create(path).and_then(|file| {
            let mut out = BufWriter::new(file);
            DepthRecord::from_map(map, index).write_to(&mut out)?;
            out.flush()
        });
        match result {
            Ok(()) => {
                self.add_size(path);
                true
            }
            Err(e) => {
                self.record_failure(path, e.to_string());
                false
            }
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_capture::{CameraConfig, DepthLevel, OpenRetry, SimConfig, SimulatedDriver};
    use storage::{DirectoryStorage, SessionStorage};

    #[test]
    fn test_raw_frame_written_with_depth() {
        let root = tempfile::tempdir().unwrap();
        let storage = DirectoryStorage::new(root.path());
        let session = storage.create_session_directory().unwrap();
        let layout = storage.create_raw_layout(&session, true).unwrap();

        let driver = SimulatedDriver::new(SimConfig::unpaced());
        let config = CameraConfig {
            depth: DepthLevel::Performance,
            ..CameraConfig::default()
        };
        let mut device =
            CaptureDevice::open(&driver, &config, &OpenRetry::default(), "primary").unwrap();
        device.grab().unwrap();

        let mut sink = RawFrameSink::new(layout.clone(), DEFAULT_JPEG_QUALITY);
        let frame = sink.capture(&mut device, 1).unwrap();
        let total = sink.write(&frame);

        assert!(layout.left_frame(1).is_file());
        assert!(layout.right_frame(1).is_file());
        let depth = layout.depth_frame(1).unwrap();
        let record = DepthRecord::read_from(&mut File::open(&depth).unwrap()).unwrap();
        assert_eq!((record.width, record.height, record.frame_index), (160, 90, 1));

        let on_disk: u64 = [layout.left_frame(1), layout.right_frame(1), depth]
            .iter()
            .map(|p| std::fs::metadata(p).unwrap().len())
            .sum();
        assert_eq!(total, on_disk);
        assert_eq!(sink.frames(), 1);
    }
}
