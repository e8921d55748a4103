use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the capture pipeline.
///
/// Start-time variants (`InvalidConfig`, `ResolutionFailed`, `StreamUnusable`,
/// `AlreadyRunning`) leave no partial state behind. `UploadFailed` and
/// `SinkOpenFailed` are recovered inside the recording loop and only logged.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid capture config: {0}")]
    InvalidConfig(String),
    #[error("could not resolve '{reference}': {reason}")]
    ResolutionFailed { reference: String, reason: String },
    #[error("stream {url} is unusable: {reason}")]
    StreamUnusable { url: String, reason: String },
    #[error("failed to open source {url}: {reason}")]
    SourceOpenFailed { url: String, reason: String },
    #[error("a capture session is already running")]
    AlreadyRunning,
    #[error("no capture session is running")]
    NotRunning,
    #[error("upload of {key} failed: {reason}")]
    UploadFailed { key: String, reason: String },
    #[error("failed to open chunk sink {path}: {reason}")]
    SinkOpenFailed { path: PathBuf, reason: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl CaptureError {
    /// Stable identifier used in control-plane responses.
    pub fn code(&self) -> &'static str {
        match self {
            CaptureError::InvalidConfig(_) => "invalid_config",
            CaptureError::ResolutionFailed { .. } => "resolution_failed",
            CaptureError::StreamUnusable { .. } => "stream_unusable",
            CaptureError::SourceOpenFailed { .. } => "source_open_failed",
            CaptureError::AlreadyRunning => "already_running",
            CaptureError::NotRunning => "not_running",
            CaptureError::UploadFailed { .. } => "upload_failed",
            CaptureError::SinkOpenFailed { .. } => "sink_open_failed",
            CaptureError::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            CaptureError::InvalidConfig(_) => 400,
            CaptureError::AlreadyRunning | CaptureError::NotRunning => 409,
            CaptureError::ResolutionFailed { .. } | CaptureError::StreamUnusable { .. } => 422,
            _ => 500,
        }
    }
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;
