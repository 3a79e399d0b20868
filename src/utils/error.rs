//! Error types and handling
//!
//! Terminal capture errors and the structured form handed back to callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::export::types::MergeError;
use crate::recorder::channel::RecorderError;
use crate::recorder::config::ConfigError;

/// Kind of failure reported for a capture session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaptureErrorKind {
    /// Recorder cannot be used (buffer mode off, orchestrator gone)
    RecorderUnavailable,
    /// Recorder refused or failed to start a segment
    RecorderStartFailed,
    /// Recorder did not finish a segment in time
    RecorderTimeout,
    /// Trigger fired while the window held nothing
    NoPreBufferSegments,
    /// Another capture session is still running
    SessionBusy,
    /// Reading a segment or writing the output failed
    MergeIoError,
    /// The first segment has neither a video nor an audio track
    MergeNoTracks,
    /// The merge was handed an empty segment list
    NothingToMerge,
    /// Removing a temporary file failed; only ever logged
    CleanupWarning,
    /// Durations or other settings were rejected
    InvalidConfig,
}

impl CaptureErrorKind {
    /// Stable code string for this kind
    pub fn code(&self) -> &'static str {
        match self {
            CaptureErrorKind::RecorderUnavailable => "RECORDER_UNAVAILABLE",
            CaptureErrorKind::RecorderStartFailed => "RECORDER_START_FAILED",
            CaptureErrorKind::RecorderTimeout => "RECORDER_TIMEOUT",
            CaptureErrorKind::NoPreBufferSegments => "NO_PRE_BUFFER_SEGMENTS",
            CaptureErrorKind::SessionBusy => "SESSION_BUSY",
            CaptureErrorKind::MergeIoError => "MERGE_IO_ERROR",
            CaptureErrorKind::MergeNoTracks => "MERGE_NO_TRACKS",
            CaptureErrorKind::NothingToMerge => "NOTHING_TO_MERGE",
            CaptureErrorKind::CleanupWarning => "CLEANUP_WARNING",
            CaptureErrorKind::InvalidConfig => "INVALID_CONFIG",
        }
    }
}

impl fmt::Display for CaptureErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Terminal error of a capture session: a kind plus a human readable message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct CaptureError {
    pub kind: CaptureErrorKind,
    pub message: String,
}

impl CaptureError {
    pub fn new(kind: CaptureErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(CaptureErrorKind::SessionBusy, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(CaptureErrorKind::RecorderUnavailable, message)
    }
}

impl From<RecorderError> for CaptureError {
    fn from(error: RecorderError) -> Self {
        let kind = match &error {
            RecorderError::Unavailable(_) => CaptureErrorKind::RecorderUnavailable,
            RecorderError::AlreadyRecording
            | RecorderError::StartFailed(_)
            | RecorderError::Aborted(_)
            | RecorderError::Io(_) => CaptureErrorKind::RecorderStartFailed,
            RecorderError::Timeout => CaptureErrorKind::RecorderTimeout,
        };
        CaptureError::new(kind, error.to_string())
    }
}

impl From<MergeError> for CaptureError {
    fn from(error: MergeError) -> Self {
        let kind = match &error {
            MergeError::NothingToMerge => CaptureErrorKind::NothingToMerge,
            MergeError::NoTracks(_) => CaptureErrorKind::MergeNoTracks,
            MergeError::Io(_) | MergeError::InvalidContainer { .. } | MergeError::Serialization(_) => {
                CaptureErrorKind::MergeIoError
            }
        };
        CaptureError::new(kind, error.to_string())
    }
}

impl From<ConfigError> for CaptureError {
    fn from(error: ConfigError) -> Self {
        CaptureError::new(CaptureErrorKind::InvalidConfig, error.to_string())
    }
}

/// Error response for callers of the control surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<CaptureError> for ErrorResponse {
    fn from(error: CaptureError) -> Self {
        ErrorResponse {
            code: error.kind.code().to_string(),
            message: error.message,
        }
    }
}

/// Result type alias using CaptureError
pub type CaptureResult<T> = Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_recorder_errors_map_to_kinds() {
        let err: CaptureError = RecorderError::Timeout.into();
        assert_eq!(err.kind, CaptureErrorKind::RecorderTimeout);

        let err: CaptureError = RecorderError::StartFailed("camera busy".to_string()).into();
        assert_eq!(err.kind, CaptureErrorKind::RecorderStartFailed);
        assert!(err.message.contains("camera busy"));
    }

    #[test]
    fn test_merge_errors_map_to_kinds() {
        let err: CaptureError = MergeError::NothingToMerge.into();
        assert_eq!(err.kind, CaptureErrorKind::NothingToMerge);

        let err: CaptureError = MergeError::NoTracks(PathBuf::from("a.sgmt")).into();
        assert_eq!(err.kind, CaptureErrorKind::MergeNoTracks);

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: CaptureError = MergeError::Io(io).into();
        assert_eq!(err.kind, CaptureErrorKind::MergeIoError);
    }

    #[test]
    fn test_error_response_carries_code() {
        let response = ErrorResponse::from(CaptureError::busy("session 42 is merging"));
        assert_eq!(response.code, "SESSION_BUSY");
        assert_eq!(response.message, "session 42 is merging");

        let json = serde_json::to_string(&CaptureErrorKind::NoPreBufferSegments).unwrap();
        assert_eq!(json, "\"NO_PRE_BUFFER_SEGMENTS\"");
    }
}
