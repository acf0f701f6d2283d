//! Drone Recorder Daemon
//!
//! Wires the recorder core to its surroundings: layered configuration,
//! logging, the camera backend and the session storage root.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use camera_capture::{CameraDriver, SimConfig, SimulatedDriver};
use config::{Config, Environment, File};
use recorder::{Recorder, RecorderSettings, ShutdownSignal};
use serde::Deserialize;
use storage::DirectoryStorage;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Environment variables override the file, e.g.
/// `DRONE_RECORDER_RECORDER__MODE=raw_multi_stream`
pub const ENV_PREFIX: &str = "DRONE_RECORDER";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Simulated camera knobs (bench runs without hardware)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimulatorSettings {
    pub bytes_per_frame: usize,
    pub max_handles: usize,
    pub dual_write: bool,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        let sim = SimConfig::default();
        Self {
            bytes_per_frame: sim.bytes_per_frame,
            max_handles: sim.max_handles,
            dual_write: sim.dual_write,
        }
    }
}

impl From<&SimulatorSettings> for SimConfig {
    fn from(settings: &SimulatorSettings) -> Self {
        SimConfig {
            bytes_per_frame: settings.bytes_per_frame,
            max_handles: settings.max_handles,
            dual_write: settings.dual_write,
            ..SimConfig::default()
        }
    }
}

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub log_level: String,
    pub log_format: LogFormat,
    /// Mounted removable storage; sessions are created below it
    pub storage_root: PathBuf,
    /// Use the simulated camera instead of the vendor SDK
    pub simulate: bool,
    pub simulator: SimulatorSettings,
    pub recorder: RecorderSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: LogFormat::Text,
            storage_root: PathBuf::from("/media/recordings"),
            simulate: false,
            simulator: SimulatorSettings::default(),
            recorder: RecorderSettings::default(),
        }
    }
}

/// Load settings: defaults, then the (optional) file, then the environment
pub fn load_settings(path: &Path) -> anyhow::Result<AppSettings> {
    let settings = Config::builder()
        .add_source(File::from(path).required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read configuration {}", path.display()))?;

    settings
        .try_deserialize()
        .context("Invalid recorder configuration")
}

/// Initialize logging
pub fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true);

    let installed = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish()),
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish()),
    };
    installed.expect("Failed to set tracing subscriber");
}

fn camera_driver(settings: &AppSettings) -> anyhow::Result<Arc<dyn CameraDriver>> {
    if settings.simulate {
        info!("Using simulated stereo camera");
        return Ok(Arc::new(SimulatedDriver::new(SimConfig::from(
            &settings.simulator,
        ))));
    }

    #[cfg(feature = "vendor-sdk")]
    {
        info!("Using vendor camera SDK");
        return Ok(Arc::new(camera_capture::ffi::VendorDriver));
    }

    #[cfg(not(feature = "vendor-sdk"))]
    anyhow::bail!("Built without the vendor SDK; run with --simulate or enable the `vendor-sdk` feature");
}

/// Build the recorder for these settings
pub fn build_recorder(settings: &AppSettings, shutdown: ShutdownSignal) -> anyhow::Result<Recorder> {
    if !settings.storage_root.is_dir() {
        warn!(
            root = %settings.storage_root.display(),
            "Storage root not mounted yet, sessions will fail until it is"
        );
    }
    let driver = camera_driver(settings)?;
    let storage = Arc::new(DirectoryStorage::new(&settings.storage_root));
    Ok(Recorder::new(
        driver,
        storage,
        settings.recorder.clone(),
        shutdown,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use recorder::{CaptureProfile, RecordingMode, RotationKind};

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.recorder.profile, CaptureProfile::Hd720p60);
        assert_eq!(settings.recorder.duration_secs, 240);
    }

    #[test]
    fn test_toml_file_layers_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drone-recorder.toml");
        std::fs::write(
            &path,
            r#"
log_format = "json"
storage_root = "/mnt/usb"
simulate = true

[simulator]
max_handles = 2

[recorder]
mode = "compressed_with_depth_metadata"
depth = "neural"
duration_secs = 600

[recorder.rotation]
strategy = "dual_handle"
segment_secs = 300

[recorder.timings]
settle_ms = 1500
"#,
        )
        .unwrap();

        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.storage_root, PathBuf::from("/mnt/usb"));
        assert!(settings.simulate);
        assert_eq!(settings.simulator.max_handles, 2);
        assert_eq!(settings.simulator.bytes_per_frame, 64 * 1024);
        assert_eq!(settings.recorder.mode, RecordingMode::CompressedWithDepthMetadata);
        assert_eq!(settings.recorder.duration_secs, 600);
        assert_eq!(settings.recorder.rotation.strategy, RotationKind::DualHandle);
        assert_eq!(settings.recorder.rotation.segment_secs, 300);
        assert_eq!(settings.recorder.timings.settle_ms, 1500);
        assert_eq!(settings.recorder.timings.open_retries, 3);
    }

    #[test]
    fn test_simulated_recorder_builds() {
        let dir = tempfile::tempdir().unwrap();
        let settings = AppSettings {
            simulate: true,
            storage_root: dir.path().to_path_buf(),
            ..AppSettings::default()
        };
        let recorder = build_recorder(&settings, ShutdownSignal::new()).unwrap();
        assert_eq!(recorder.mode(), RecordingMode::CompressedOnly);
    }
}
