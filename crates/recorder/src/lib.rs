//! Stereo Field Recorder Core
//!
//! Keeps one exclusive stereo camera producing data while it is
//! reconfigured and its write target rotated:
//! - Recording worker (grab loop, decimated telemetry, gap/stall diagnostics)
//! - Depth side-channel writer with a live-adjustable rate
//! - Mode/resolution controller with the close → settle → reopen protocol
//! - Segment rotation strategies
//! - Command boundary for the control layer

pub mod command;
pub mod controller;
pub mod depth_writer;
pub mod error;
pub mod profile;
pub mod rotation;
pub mod selector;
pub mod session;
pub mod sink;
pub mod telemetry;
pub mod worker;

pub use command::{CameraView, Command, CommandOutcome};
pub use controller::{
    ControllerTimings, GracePolicy, Recorder, RecorderSettings, RecorderState, RecordingStatus,
    SessionSummary,
};
pub use depth_writer::{DepthOutput, DepthRecord, DepthWriter, DepthWriterConfig};
pub use error::{RecorderError, RotationError};
pub use profile::{parse_depth_level, CaptureProfile, ModeSelection, RecordingMode};
pub use rotation::{RotationKind, RotationReport, RotationSettings, RotationStrategy};
pub use selector::{DeviceSelector, SharedDevice};
pub use session::{ByteCounter, SessionCounters, ShutdownSignal};
pub use sink::RawFrameSink;
pub use telemetry::TelemetryWriter;
pub use worker::{RecordingWorker, WorkerConfig, WorkerExit};
