//! Segment recorder interface
//!
//! The camera/encoder side lives outside this crate. It is consumed through
//! `SegmentRecorder`, which records one bounded segment at a time.

use super::segment::Segment;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a segment recorder
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Recorder unavailable: {0}")]
    Unavailable(String),

    #[error("A segment is already in flight")]
    AlreadyRecording,

    #[error("Failed to start segment: {0}")]
    StartFailed(String),

    #[error("Segment did not complete in time")]
    Timeout,

    #[error("Segment aborted: {0}")]
    Aborted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RecorderResult<T> = Result<T, RecorderError>;

/// A source of bounded, independently decodable segments
///
/// Callers never issue `begin` while a previous segment is still in flight.
#[async_trait]
pub trait SegmentRecorder: Send + Sync + 'static {
    /// Identifier used in logs
    fn id(&self) -> &str;

    /// Record one segment of (at most) `duration`
    ///
    /// Resolves once the segment file is complete.
    async fn begin(&self, duration: Duration) -> RecorderResult<Segment>;

    /// Ask the in-flight segment to complete now instead of running its full
    /// duration. Does nothing when no segment is in flight.
    fn request_early_stop(&self);
}
