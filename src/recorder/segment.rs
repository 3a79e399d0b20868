//! Recorded segments

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// A completed, independently decodable recording unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    /// Recording order, assigned by the recorder
    pub sequence: u64,

    /// Backing container file
    pub path: PathBuf,

    /// Duration that was requested for this segment
    pub nominal_duration: Duration,

    /// Duration the recorder reports it actually captured
    #[serde(default)]
    pub recorded_duration: Duration,

    /// When the segment completed
    pub completed_at: DateTime<Utc>,
}

/// Segments are shared between the window and capture snapshots
pub type SharedSegment = Arc<Segment>;

impl Segment {
    pub fn new(sequence: u64, path: PathBuf, nominal_duration: Duration) -> Self {
        Self {
            sequence,
            path,
            nominal_duration,
            recorded_duration: nominal_duration,
            completed_at: Utc::now(),
        }
    }

    /// Record how much was captured when it differs from the request
    pub fn with_recorded(mut self, recorded_duration: Duration) -> Self {
        self.recorded_duration = recorded_duration;
        self
    }

    /// Whether the segment covers its whole requested duration
    pub fn is_complete(&self) -> bool {
        self.recorded_duration >= self.nominal_duration
    }

    /// Delete the backing file
    ///
    /// Best effort: failures are logged and reported as `false`, never raised.
    /// A file that is already gone counts as deleted.
    pub fn discard(&self) -> bool {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!("Deleted segment {} ({:?})", self.sequence, self.path);
                true
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                tracing::warn!(
                    "CLEANUP_WARNING: failed to delete segment {} ({:?}): {}",
                    self.sequence,
                    self.path,
                    e
                );
                false
            }
        }
    }
}

/// Delete every backing file, returning how many deletions failed
pub fn discard_all<'a>(segments: impl IntoIterator<Item = &'a SharedSegment>) -> usize {
    segments.into_iter().filter(|s| !s.discard()).count()
}
