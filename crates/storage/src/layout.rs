//! File naming inside a session directory

use std::path::{Path, PathBuf};

const VIDEO_STEM: &str = "video";
const VIDEO_EXT: &str = "svo";
const TELEMETRY_STEM: &str = "sensors";
const TELEMETRY_EXT: &str = "csv";

/// `stem.ext` for segment 0, `stem_segmentNNN.ext` afterwards
pub fn segment_file_name(stem: &str, ext: &str, segment: u32) -> String {
    if segment == 0 {
        format!("{}.{}", stem, ext)
    } else {
        format!("{}_segment{:03}.{}", stem, segment, ext)
    }
}

/// Video container and telemetry CSV of one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPaths {
    pub index: u32,
    pub video: PathBuf,
    pub telemetry: PathBuf,
}

/// One flight session directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    dir: PathBuf,
}

impl SessionLayout {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Directory name, e.g. `flight_20240131_142501`
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn video_path(&self) -> PathBuf {
        self.segment(0).video
    }

    pub fn telemetry_path(&self) -> PathBuf {
        self.segment(0).telemetry
    }

    /// Side-channel depth output directory
    pub fn depth_dir(&self) -> PathBuf {
        self.dir.join("depth")
    }

    pub fn segment(&self, index: u32) -> SegmentPaths {
        SegmentPaths {
            index,
            video: self
                .dir
                .join(segment_file_name(VIDEO_STEM, VIDEO_EXT, index)),
            telemetry: self
                .dir
                .join(segment_file_name(TELEMETRY_STEM, TELEMETRY_EXT, index)),
        }
    }
}

/// Per-stream directories of a raw multi-stream session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLayout {
    pub base: PathBuf,
    pub left: PathBuf,
    pub right: PathBuf,
    /// Absent when depth computation is disabled
    pub depth: Option<PathBuf>,
    pub telemetry: PathBuf,
}

impl RawLayout {
    pub(crate) fn under(session: &SessionLayout, with_depth: bool) -> Self {
        let base = session.dir().to_path_buf();
        Self {
            left: base.join("left"),
            right: base.join("right"),
            depth: with_depth.then(|| base.join("depth")),
            telemetry: session.telemetry_path(),
            base,
        }
    }

    pub fn left_frame(&self, frame: u64) -> PathBuf {
        self.left.join(format!("frame_{:06}_left.jpg", frame))
    }

    pub fn right_frame(&self, frame: u64) -> PathBuf {
        self.right.join(format!("frame_{:06}_right.jpg", frame))
    }

    pub fn depth_frame(&self, frame: u64) -> Option<PathBuf> {
        self.depth
            .as_ref()
            .map(|d| d.join(format!("frame_{:06}_depth.dat", frame)))
    }
}
