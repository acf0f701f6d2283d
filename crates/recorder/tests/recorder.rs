//! End-to-end controller behaviour against the simulated camera

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use camera_capture::{
    CameraDriver, DepthLevel, SimConfig, SimState, SimulatedDriver, View, TELEMETRY_CSV_HEADER,
};
use recorder::{
    CaptureProfile, Command, ControllerTimings, DepthRecord, GracePolicy, Recorder,
    RecorderError, RecorderSettings, RecorderState, RecordingMode, RotationError, RotationKind,
    ShutdownSignal,
};
use storage::DirectoryStorage;
use tempfile::TempDir;

struct Rig {
    recorder: Recorder,
    sim: Arc<SimState>,
    _root: TempDir,
}

fn fast_settings() -> RecorderSettings {
    let mut settings = RecorderSettings {
        profile: CaptureProfile::Vga100,
        timings: ControllerTimings {
            settle_ms: 0,
            open_retries: 3,
            open_backoff_ms: 1,
            worker_stop_timeout_ms: 2000,
            monitor_interval_ms: 10,
        },
        grace: GracePolicy::immediate(),
        ..RecorderSettings::default()
    };
    settings.worker.failure_backoff_ms = 5;
    settings.rotation.pause_settle_ms = 10;
    settings.rotation.overlap_settle_ms = 10;
    settings
}

fn rig_with(settings: RecorderSettings, sim: SimConfig) -> Rig {
    let root = tempfile::tempdir().unwrap();
    let driver = SimulatedDriver::new(SimConfig {
        bytes_per_frame: 4096,
        ..sim
    });
    let state = Arc::clone(driver.state());
    let driver: Arc<dyn CameraDriver> = Arc::new(driver);
    let recorder = Recorder::new(
        driver,
        Arc::new(DirectoryStorage::new(root.path())),
        settings,
        ShutdownSignal::new(),
    );
    Rig {
        recorder,
        sim: state,
        _root: root,
    }
}

fn rig() -> Rig {
    rig_with(fast_settings(), SimConfig::default())
}

fn first_line(path: &Path) -> String {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .next()
        .unwrap_or_default()
        .to_string()
}

fn timestamps(path: &Path) -> Vec<u64> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .filter_map(|line| line.split(',').next()?.parse().ok())
        .collect()
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(ext))
        .collect();
    files.sort();
    files
}

#[test]
fn test_every_mode_leaves_telemetry_header() {
    let rig = rig();
    for mode in RecordingMode::ALL {
        rig.recorder.set_mode(mode).unwrap();
        let dir = rig.recorder.start(None).unwrap();
        assert_eq!(rig.recorder.state(), RecorderState::Recording);
        let summary = rig.recorder.stop().unwrap();

        assert_eq!(summary.dir, dir);
        assert_eq!(rig.recorder.state(), RecorderState::Idle);
        assert_eq!(first_line(&dir.join("sensors.csv")), TELEMETRY_CSV_HEADER);
        if mode.uses_container() {
            assert!(dir.join("video.svo").is_file(), "{} wrote no container", mode);
        } else {
            assert!(dir.join("left").is_dir());
            assert!(!dir.join("video.svo").exists());
        }
    }
    assert_eq!(rig.sim.active_writes(), 0);
}

#[test]
fn test_session_stops_when_duration_elapses() {
    let rig = rig();
    let dir = rig.recorder.start(Some(Duration::from_millis(300))).unwrap();
    assert!(rig.recorder.wait_until_idle(Duration::from_secs(5)));

    let summary = rig.recorder.last_summary().unwrap();
    assert!(summary.failure.is_none());
    assert!(summary.frames > 0);
    assert!(summary.bytes > 0);
    assert_eq!(rig.sim.active_writes(), 0);

    let videos = files_with_extension(&dir, "svo");
    assert_eq!(videos, vec![dir.join("video.svo")]);
    assert!(files_with_extension(&dir, "svo2").is_empty());

    let csv = fs::read_to_string(dir.join("sensors.csv")).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some(TELEMETRY_CSV_HEADER));
    assert!(lines.count() >= 1, "no telemetry rows");
}

#[test]
fn test_failure_ceiling_ends_session_with_reason() {
    let rig = rig();
    rig.sim.fail_grabs_forever(true);
    rig.recorder.start(Some(Duration::from_secs(30))).unwrap();
    assert!(rig.recorder.wait_until_idle(Duration::from_secs(5)));

    let status = rig.recorder.status();
    assert_eq!(status.state, RecorderState::Idle);
    let reason = status.last_error.unwrap();
    assert!(reason.contains("10 consecutive grab failures"), "{}", reason);
    assert!(rig.recorder.last_summary().unwrap().failure.is_some());
}

#[test]
fn test_end_of_input_ends_session() {
    let rig = rig();
    rig.sim.end_input_after(20);
    rig.recorder.start(Some(Duration::from_secs(30))).unwrap();
    assert!(rig.recorder.wait_until_idle(Duration::from_secs(5)));
    assert_eq!(rig.recorder.last_summary().unwrap().frames, 20);
}

#[test]
fn test_depth_rate_zero_writes_nothing() {
    let rig = rig();
    rig.recorder
        .set_mode(RecordingMode::CompressedWithDepthMetadata)
        .unwrap();
    rig.recorder.set_depth_rate(0);
    let dir = rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(500));
    rig.recorder.stop().unwrap();

    assert!(dir.join("depth").is_dir());
    assert_eq!(fs::read_dir(dir.join("depth")).unwrap().count(), 0);
    assert!(rig.sim.depth_retrievals() > 0);
}

#[test]
fn test_depth_rate_bounds_written_samples() {
    let rig = rig();
    rig.recorder
        .set_mode(RecordingMode::CompressedWithDepthMetadata)
        .unwrap();
    rig.recorder.set_depth_rate(10);
    let started = Instant::now();
    let dir = rig.recorder.start(None).unwrap();
    let window_start = Instant::now();
    thread::sleep(Duration::from_millis(1000));
    let window = window_start.elapsed().as_secs_f64();
    let summary = rig.recorder.stop().unwrap();
    let elapsed = started.elapsed().as_secs_f64();

    let files = files_with_extension(&dir.join("depth"), "depth");
    assert!(!files.is_empty());
    assert!(files.len() as f64 <= elapsed * 10.0 + 1.0, "{} samples", files.len());
    assert!(
        files.len() as f64 >= (window * 10.0).floor() - 1.0,
        "{} samples in {:.2}s",
        files.len(),
        window
    );
    assert_eq!(summary.depth_samples, files.len() as u64);

    let mut previous = 0;
    for file in files {
        let record = DepthRecord::read_from(&mut fs::File::open(&file).unwrap()).unwrap();
        assert_eq!((record.width, record.height), (160, 90));
        assert!(record.frame_index > previous);
        previous = record.frame_index;
    }
}

#[test]
fn test_depth_images_mode_writes_png() {
    let rig = rig();
    rig.recorder
        .set_mode(RecordingMode::CompressedWithDepthImages)
        .unwrap();
    let dir = rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(400));
    rig.recorder.stop().unwrap();

    let images = files_with_extension(&dir.join("depth"), "png");
    assert!(!images.is_empty());
    let decoded = image::open(&images[0]).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (160, 90));
}

#[test]
fn test_raw_mode_writes_frames_and_rejects_rotation() {
    let rig = rig();
    rig.recorder.set_mode(RecordingMode::RawMultiStream).unwrap();
    rig.recorder.set_depth_level(DepthLevel::Performance).unwrap();
    let dir = rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(300));

    assert!(matches!(
        rig.recorder.rotate_segment(),
        Err(RecorderError::InvalidState { .. })
    ));
    let summary = rig.recorder.stop().unwrap();

    assert!(!files_with_extension(&dir.join("left"), "jpg").is_empty());
    assert!(!files_with_extension(&dir.join("right"), "jpg").is_empty());
    assert!(!files_with_extension(&dir.join("depth"), "dat").is_empty());
    assert!(summary.bytes > 0);
    assert!(summary.video.is_none());
}

fn rotate_once(kind: RotationKind, sim: SimConfig) {
    let mut settings = fast_settings();
    settings.rotation.strategy = kind;
    let rig = rig_with(settings, sim);

    let dir = rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(200));
    let video = rig.recorder.rotate_segment().unwrap();
    assert_eq!(video, dir.join("video_segment001.svo"));
    assert_eq!(rig.recorder.status().segment, 1);
    thread::sleep(Duration::from_millis(200));
    let summary = rig.recorder.stop().unwrap();

    assert_eq!(summary.segments, 2, "{}", kind);
    assert!(fs::metadata(dir.join("video.svo")).unwrap().len() > 0);
    assert!(fs::metadata(&video).unwrap().len() > 0, "{} left an empty segment", kind);
    assert_eq!(rig.sim.active_writes(), 0);

    let first = timestamps(&dir.join("sensors.csv"));
    let second = timestamps(&dir.join("sensors_segment001.csv"));
    assert_eq!(first_line(&dir.join("sensors_segment001.csv")), TELEMETRY_CSV_HEADER);
    if let (Some(last), Some(next)) = (first.last(), second.first()) {
        assert!(next >= last, "{}: segment 1 starts before segment 0 ends", kind);
    }
}

#[test]
fn test_sequential_rotation() {
    rotate_once(RotationKind::Sequential, SimConfig::default());
}

#[test]
fn test_fast_rotation() {
    rotate_once(RotationKind::Fast, SimConfig::default());
}

#[test]
fn test_overlapped_rotation_with_dual_write() {
    rotate_once(
        RotationKind::Overlapped,
        SimConfig {
            dual_write: true,
            ..SimConfig::default()
        },
    );
}

#[test]
fn test_overlapped_rotation_falls_back() {
    rotate_once(RotationKind::Overlapped, SimConfig::default());
}

#[test]
fn test_dual_handle_rotation() {
    rotate_once(
        RotationKind::DualHandle,
        SimConfig {
            max_handles: 2,
            ..SimConfig::default()
        },
    );
}

#[test]
fn test_dual_handle_without_standby_still_rotates() {
    rotate_once(RotationKind::DualHandle, SimConfig::default());
}

#[test]
fn test_memory_buffered_rotation() {
    rotate_once(RotationKind::MemoryBuffered, SimConfig::default());
}

#[test]
fn test_automatic_rotation() {
    let mut settings = fast_settings();
    settings.rotation.segment_secs = 1;
    let rig = rig_with(settings, SimConfig::default());

    let dir = rig.recorder.start(Some(Duration::from_millis(2500))).unwrap();
    assert!(rig.recorder.wait_until_idle(Duration::from_secs(10)));
    assert!(rig.recorder.last_summary().unwrap().segments >= 2);
    assert!(dir.join("video_segment001.svo").is_file());
}

#[test]
fn test_rotation_failure_after_finalize_stops_session() {
    let rig = rig();
    rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(100));
    rig.sim.inject_write_failures(1);

    let result = rig.recorder.rotate_segment();
    assert!(matches!(
        result,
        Err(RecorderError::Rotation(RotationError::SessionStopped(_)))
    ));
    assert_eq!(rig.recorder.state(), RecorderState::Idle);
    assert!(rig.recorder.last_summary().unwrap().failure.is_some());
}

#[test]
fn test_overlapped_rollback_keeps_recording() {
    let mut settings = fast_settings();
    settings.rotation.strategy = RotationKind::Overlapped;
    let rig = rig_with(
        settings,
        SimConfig {
            dual_write: true,
            ..SimConfig::default()
        },
    );
    let dir = rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(100));
    rig.sim.inject_write_failures(1);

    assert!(matches!(
        rig.recorder.rotate_segment(),
        Err(RecorderError::Rotation(RotationError::RolledBack(_)))
    ));
    assert_eq!(rig.recorder.state(), RecorderState::Recording);
    assert!(!dir.join("sensors_segment001.csv").exists());

    let before = fs::metadata(dir.join("video.svo")).unwrap().len();
    thread::sleep(Duration::from_millis(200));
    assert!(fs::metadata(dir.join("video.svo")).unwrap().len() > before);

    rig.recorder.rotate_segment().unwrap();
    rig.recorder.stop().unwrap();
}

#[test]
fn test_reconfiguration_rejected_while_recording() {
    let rig = rig();
    rig.recorder.start(None).unwrap();

    let invalid = |r: Result<(), RecorderError>| matches!(r, Err(RecorderError::InvalidState { .. }));
    assert!(invalid(rig.recorder.set_mode(RecordingMode::RawMultiStream)));
    assert!(invalid(rig.recorder.set_depth_level(DepthLevel::Neural)));
    assert!(invalid(rig.recorder.set_resolution(CaptureProfile::Hd1080p30)));
    assert!(invalid(rig.recorder.set_exposure(50)));
    assert!(invalid(rig.recorder.set_gain(50)));
    assert_eq!(rig.recorder.state(), RecorderState::Recording);
    assert_eq!(rig.recorder.mode(), RecordingMode::CompressedOnly);

    let outcome = rig.recorder.execute(Command::SetResolution {
        profile: CaptureProfile::Hd2k15,
    });
    assert!(!outcome.success);
    assert!(outcome.message.contains("stop the recording"), "{}", outcome.message);

    rig.recorder.stop().unwrap();
    assert!(matches!(
        rig.recorder.stop(),
        Err(RecorderError::InvalidState { .. })
    ));
}

#[test]
fn test_coupled_depth_kept_while_recording() {
    let rig = rig();
    rig.recorder
        .set_mode(RecordingMode::CompressedWithDepthImages)
        .unwrap();
    let tier = rig.recorder.depth_level();
    assert_ne!(tier, DepthLevel::None);
    rig.recorder.start(None).unwrap();

    assert!(matches!(
        rig.recorder.set_depth_level(DepthLevel::None),
        Err(RecorderError::InvalidState { .. })
    ));
    assert_eq!(rig.recorder.depth_level(), tier);
    assert_eq!(rig.recorder.state(), RecorderState::Recording);
    assert_eq!(rig.recorder.mode(), RecordingMode::CompressedWithDepthImages);

    rig.recorder.stop().unwrap();
}

#[test]
fn test_segment_byte_counter_restarts_on_rotation() {
    let rig = rig();
    rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(300));
    let before = rig.recorder.status().bytes_written;
    assert!(before > 0);

    rig.recorder.rotate_segment().unwrap();
    let after = rig.recorder.status();
    assert_eq!(after.segment, 1);
    assert!(after.bytes_written < before, "{} !< {}", after.bytes_written, before);

    rig.recorder.stop().unwrap();
}

#[test]
fn test_mode_coupling_and_invalid_depth() {
    let rig = rig();
    rig.recorder
        .set_mode(RecordingMode::CompressedWithDepthImages)
        .unwrap();
    assert_eq!(rig.recorder.depth_level(), DepthLevel::NeuralLite);

    assert!(matches!(
        rig.recorder.set_depth_level(DepthLevel::None),
        Err(RecorderError::InvalidConfiguration(_))
    ));
    assert_eq!(rig.recorder.depth_level(), DepthLevel::NeuralLite);

    rig.recorder.set_mode(RecordingMode::CompressedOnly).unwrap();
    assert_eq!(rig.recorder.depth_level(), DepthLevel::None);
    assert!(rig.recorder.set_depth_level(DepthLevel::Ultra).is_err());
}

#[test]
fn test_exposure_range() {
    let rig = rig();
    assert!(rig.recorder.set_exposure(-1).is_ok());
    assert!(rig.recorder.set_exposure(100).is_ok());
    assert!(matches!(
        rig.recorder.set_exposure(101),
        Err(RecorderError::InvalidConfiguration(_))
    ));
    assert!(rig.recorder.set_gain(-2).is_err());
    assert_eq!(rig.recorder.status().exposure, 100);
}

#[test]
fn test_rejected_setting_is_not_remembered() {
    let rig = rig();
    rig.recorder.initialize().unwrap();
    rig.recorder.set_exposure(40).unwrap();

    rig.sim.inject_setting_failures(1);
    assert!(matches!(
        rig.recorder.set_exposure(70),
        Err(RecorderError::Camera(_))
    ));
    assert_eq!(rig.recorder.status().exposure, 40);

    rig.sim.inject_setting_failures(1);
    assert!(rig.recorder.set_gain(30).is_err());
    assert_eq!(rig.recorder.status().gain, -1);

    rig.recorder.set_exposure(70).unwrap();
    assert_eq!(rig.recorder.status().exposure, 70);
}

#[test]
fn test_reacquire_closes_then_reopens() {
    let rig = rig();
    rig.recorder.initialize().unwrap();
    assert_eq!(rig.sim.open_handles(), 1);
    let closes = rig.sim.closes();

    rig.recorder.set_resolution(CaptureProfile::Hd720p30).unwrap();
    assert_eq!(rig.sim.closes(), closes + 1);
    assert_eq!(rig.sim.open_handles(), 1);
    assert!(rig.recorder.status().camera_open);

    // Same configuration: no reacquire
    rig.recorder.set_resolution(CaptureProfile::Hd720p30).unwrap();
    assert_eq!(rig.sim.closes(), closes + 1);
}

#[test]
fn test_snapshot_rejected_while_initializing() {
    let mut settings = fast_settings();
    settings.timings.settle_ms = 500;
    let rig = rig_with(settings, SimConfig::default());
    rig.recorder.initialize().unwrap();

    let reconfigure = {
        let recorder = rig.recorder.clone();
        thread::spawn(move || recorder.set_resolution(CaptureProfile::Hd1080p30))
    };
    let deadline = Instant::now() + Duration::from_secs(2);
    while !rig.recorder.is_camera_initializing() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(rig.recorder.is_camera_initializing());
    assert!(matches!(
        rig.recorder.snapshot(View::Left),
        Err(RecorderError::CameraBusy)
    ));
    assert!(matches!(rig.recorder.start(None), Err(RecorderError::CameraBusy)));

    reconfigure.join().unwrap().unwrap();
    assert!(!rig.recorder.is_camera_initializing());
    let image = rig.recorder.snapshot(View::Right).unwrap();
    assert_eq!((image.width, image.height), (160, 90));
}

#[test]
fn test_snapshot_while_recording() {
    let rig = rig();
    rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(100));
    let image = rig.recorder.snapshot(View::Left).unwrap();
    assert_eq!(image.data.len(), 160 * 90 * 4);
    rig.recorder.stop().unwrap();
}

#[test]
fn test_open_failure_leaves_idle_without_handle() {
    let rig = rig();
    rig.sim.inject_open_failures(4);

    let result = rig.recorder.start(None);
    assert!(matches!(result, Err(RecorderError::CameraOpen(_))));
    assert_eq!(rig.sim.open_attempts(), 4);
    assert_eq!(rig.sim.open_handles(), 0);

    let status = rig.recorder.status();
    assert_eq!(status.state, RecorderState::Idle);
    assert!(!status.camera_open);
    assert!(!status.camera_initializing);
    assert!(status.last_error.is_some());

    rig.recorder.start(None).unwrap();
    rig.recorder.stop().unwrap();
}

#[test]
fn test_shutdown_stops_session_and_rejects_requests() {
    let rig = rig();
    rig.recorder.start(None).unwrap();
    thread::sleep(Duration::from_millis(100));

    rig.recorder.shutdown();
    assert_eq!(rig.recorder.state(), RecorderState::Idle);
    assert_eq!(rig.sim.open_handles(), 0);
    assert_eq!(rig.sim.active_writes(), 0);
    assert!(rig.recorder.last_summary().is_some());

    assert!(matches!(rig.recorder.start(None), Err(RecorderError::ShuttingDown)));
    assert!(matches!(
        rig.recorder.snapshot(View::Left),
        Err(RecorderError::ShuttingDown)
    ));
    rig.recorder.shutdown();
}

#[test]
fn test_status_tracks_session() {
    let rig = rig();
    rig.recorder.start(Some(Duration::from_secs(60))).unwrap();
    thread::sleep(Duration::from_millis(300));

    let status = rig.recorder.status();
    assert_eq!(status.state, RecorderState::Recording);
    assert!(status.frames > 0);
    assert!(status.bytes_written > 0);
    assert!(status.remaining_secs <= 60);
    assert!(status.current_file.unwrap().ends_with("video.svo"));
    assert!(status.session.unwrap().starts_with("flight_"));

    let json = serde_json::to_value(rig.recorder.execute(Command::Status)).unwrap();
    assert_eq!(json["success"], true);
    assert_eq!(json["status"]["state"], "recording");
    rig.recorder.stop().unwrap();
}
