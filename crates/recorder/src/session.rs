//! State shared between the controller and its worker threads

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

/// Process-wide cancellation flag
///
/// Set from the signal handler; never performs teardown itself. Workers and
/// the controller observe it at their next iteration boundary.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bytes written to the current segment
///
/// Observations are tagged with the segment they were measured for; stale
/// observations from a previous segment are ignored, and within a segment
/// the value never decreases.
#[derive(Debug, Default)]
pub struct ByteCounter {
    inner: Mutex<(u32, u64)>,
}

impl ByteCounter {
    /// Start counting a new segment from zero
    pub fn begin_segment(&self, segment: u32) {
        *self.inner.lock() = (segment, 0);
    }

    /// Record a ground-truth size measured for `segment`
    pub fn observe(&self, segment: u32, bytes: u64) {
        let mut inner = self.inner.lock();
        if inner.0 == segment && bytes > inner.1 {
            inner.1 = bytes;
        }
    }

    pub fn get(&self) -> u64 {
        self.inner.lock().1
    }
}

/// Live counters of one session
#[derive(Debug, Default)]
pub struct SessionCounters {
    pub bytes: ByteCounter,
    /// Index of the last successfully grabbed main-stream frame
    pub frames: AtomicU64,
    pub consecutive_failures: AtomicU32,
    pub corrupted_frames: AtomicU64,
    pub telemetry_rows: AtomicU64,
    pub depth_samples: AtomicU64,
    pub depth_retrievals: AtomicU64,
}

impl SessionCounters {
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    pub fn depth_samples(&self) -> u64 {
        self.depth_samples.load(Ordering::SeqCst)
    }
}

/// The write target the worker measures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentTarget {
    pub index: u32,
    pub video: PathBuf,
}

pub type SharedTarget = Arc<RwLock<SegmentTarget>>;

/// Newer hardware revisions append `2` to the container file name
pub fn container_variant(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("2");
    PathBuf::from(name)
}

/// The path actually written for `path`, if either variant exists
pub fn written_path(path: &Path) -> Option<PathBuf> {
    if path.exists() {
        return Some(path.to_path_buf());
    }
    let variant = container_variant(path);
    variant.exists().then_some(variant)
}

/// Poll until the target (or its variant) exists
pub fn wait_for_target(path: &Path, timeout: Duration, poll: Duration) -> Option<PathBuf> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(found) = written_path(path) {
            return Some(found);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(poll);
    }
}

/// Current size of a write target, checking the container variant too
pub fn target_size(path: &Path) -> Option<u64> {
    std::fs::metadata(path)
        .or_else(|_| std::fs::metadata(container_variant(path)))
        .map(|m| m.len())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_container_variant() {
        assert_eq!(
            container_variant(Path::new("/d/video.svo")),
            PathBuf::from("/d/video.svo2")
        );
    }

    #[test]
    fn test_written_path_accepts_variant() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("video.svo");
        assert_eq!(written_path(&path), None);
        std::fs::write(container_variant(&path), b"x").unwrap();
        assert_eq!(written_path(&path), Some(container_variant(&path)));
        assert_eq!(target_size(&path), Some(1));
        assert_eq!(
            wait_for_target(&path, Duration::ZERO, Duration::ZERO),
            Some(container_variant(&path))
        );
    }

    #[test]
    fn test_stale_segment_observation_ignored() {
        let counter = ByteCounter::default();
        counter.observe(0, 500);
        counter.begin_segment(1);
        assert_eq!(counter.get(), 0);
        counter.observe(0, 900);
        assert_eq!(counter.get(), 0);
        counter.observe(1, 10);
        assert_eq!(counter.get(), 10);
    }

    proptest! {
        #[test]
        fn byte_counter_monotonic_within_segment(sizes in proptest::collection::vec(0u64..1 << 40, 1..50)) {
            let counter = ByteCounter::default();
            counter.begin_segment(3);
            let mut last = 0;
            for size in sizes {
                counter.observe(3, size);
                let now = counter.get();
                prop_assert!(now >= last);
                last = now;
            }
        }
    }
}
