//! Recorder error types

use std::path::PathBuf;

use camera_capture::CameraError;
use storage::StorageError;
use thiserror::Error;

use crate::controller::RecorderState;

/// Errors surfaced at the command boundary
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Not allowed while {state}: {reason}")]
    InvalidState {
        state: RecorderState,
        reason: String,
    },

    #[error("Camera is initializing, try again shortly")]
    CameraBusy,

    #[error("Camera initialization failed: {0}")]
    CameraOpen(#[source] CameraError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Segment rotation failed: {0}")]
    Rotation(#[from] RotationError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Recorder is shutting down")]
    ShuttingDown,

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Cannot create {path}: {source}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RecorderError {
    pub(crate) fn invalid_state(state: RecorderState, reason: impl Into<String>) -> Self {
        RecorderError::InvalidState {
            state,
            reason: reason.into(),
        }
    }
}

/// Outcome of a failed segment switch
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("No active compressed recording to rotate")]
    NotRecording,

    /// The previous write target is still active and unchanged
    #[error("Switch aborted, previous target still active: {0}")]
    RolledBack(String),

    /// The previous target was already finalized and the new one is not
    /// confirmed healthy; the session has been stopped
    #[error("Switch failed after the previous target was closed, session stopped: {0}")]
    SessionStopped(String),
}
