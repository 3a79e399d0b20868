//! Buffer state management
//!
//! Defines the capture state machine, the per-trigger session and the
//! lifecycle events published while buffering and capturing.

use super::segment::SharedSegment;
use crate::export::types::MergeReport;
use crate::utils::error::CaptureErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Current state of the capture orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferState {
    /// Buffer mode off, nothing recording
    Idle,
    /// Continuously recording segments into the window
    Buffering,
    /// Trigger received, recording the post-buffer
    Capturing,
    /// Combining pre- and post-buffer segments
    Merging,
}

impl Default for BufferState {
    fn default() -> Self {
        Self::Idle
    }
}

impl BufferState {
    /// Whether a capture session is in progress
    pub fn is_busy(&self) -> bool {
        matches!(self, BufferState::Capturing | BufferState::Merging)
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferState::Idle => "idle",
            BufferState::Buffering => "buffering",
            BufferState::Capturing => "capturing",
            BufferState::Merging => "merging",
        };
        f.write_str(name)
    }
}

/// One trigger-to-output cycle
///
/// `pre_segments` is a snapshot of the window: the window may be cleared or
/// refilled without affecting it.
#[derive(Debug)]
pub struct CaptureSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub output_path: PathBuf,
    pub pre_segments: Vec<SharedSegment>,
    pub post_segments: Vec<SharedSegment>,
}

impl CaptureSession {
    pub fn new(id: Uuid, output_path: PathBuf) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            output_path,
            pre_segments: Vec::new(),
            post_segments: Vec::new(),
        }
    }

    /// Pre-buffer followed by post-buffer, in merge order
    pub fn segments(&self) -> impl Iterator<Item = &SharedSegment> {
        self.pre_segments.iter().chain(self.post_segments.iter())
    }

    pub fn segment_count(&self) -> usize {
        self.pre_segments.len() + self.post_segments.len()
    }

    /// Recorded post-buffer length by nominal duration
    pub fn post_buffer_recorded(&self) -> Duration {
        self.post_segments.iter().map(|s| s.nominal_duration).sum()
    }
}

/// Result of a successful capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedOutput {
    pub session_id: Uuid,

    /// Merged container file
    pub path: PathBuf,

    /// Media duration of the merged file in milliseconds
    pub duration_ms: u64,

    pub pre_segments: usize,
    pub post_segments: usize,

    /// Segment files that were merged (and have since been deleted)
    pub sources: Vec<PathBuf>,

    pub report: MergeReport,
}

impl MergedOutput {
    pub fn segment_count(&self) -> usize {
        self.pre_segments + self.post_segments
    }
}

/// Events emitted while buffering and capturing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum RecorderEvent {
    /// Orchestrator moved between states
    StateChanged { from: BufferState, to: BufferState },

    /// A buffering segment entered the window
    SegmentBuffered {
        sequence: u64,
        window_len: usize,
        evicted: Vec<u64>,
    },

    /// Buffering keeps failing; retries continue
    BufferingDegraded {
        consecutive_failures: u32,
        last_error: String,
    },

    /// Trigger accepted, window snapshot taken
    CaptureStarted { session_id: Uuid, pre_segments: usize },

    /// Post-buffer recording finished (possibly cut short)
    PostBufferRecorded {
        session_id: Uuid,
        post_segments: usize,
        timed_out: bool,
    },

    /// Merge succeeded
    CaptureCompleted {
        session_id: Uuid,
        segments: usize,
        duration_ms: u64,
        merge_ms: u64,
    },

    /// Session ended with a terminal error
    CaptureFailed {
        session_id: Uuid,
        kind: CaptureErrorKind,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::segment::Segment;
    use std::sync::Arc;

    #[test]
    fn test_busy_states() {
        assert!(!BufferState::Idle.is_busy());
        assert!(!BufferState::Buffering.is_busy());
        assert!(BufferState::Capturing.is_busy());
        assert!(BufferState::Merging.is_busy());
    }

    #[test]
    fn test_session_orders_pre_before_post() {
        let seg = |seq: u64, secs: u64| {
            Arc::new(Segment::new(seq, PathBuf::from(format!("{}.sgmt", seq)), Duration::from_secs(secs)))
        };
        let mut session = CaptureSession::new(Uuid::new_v4(), PathBuf::from("out.sgmt"));
        session.pre_segments = vec![seg(1, 3), seg(2, 3)];
        session.post_segments = vec![seg(7, 2), seg(8, 2)];

        let order: Vec<u64> = session.segments().map(|s| s.sequence).collect();
        assert_eq!(order, vec![1, 2, 7, 8]);
        assert_eq!(session.segment_count(), 4);
        assert_eq!(session.post_buffer_recorded(), Duration::from_secs(4));
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = RecorderEvent::StateChanged {
            from: BufferState::Idle,
            to: BufferState::Buffering,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stateChanged");
        assert_eq!(json["to"], "buffering");
    }
}
