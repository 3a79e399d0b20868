//! Merge types
//!
//! Track descriptions, encoded samples and the errors raised while reading
//! segments or writing the merged container.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Media type of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    /// Track kinds in the order output tracks are opened
    pub const ALL: [TrackKind; 2] = [TrackKind::Video, TrackKind::Audio];
}

/// Format description of one track, copied verbatim into the merged output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackFormat {
    pub kind: TrackKind,
    /// Codec identifier (e.g. "h264", "aac")
    pub codec: String,
    /// Units per second of the source clock
    pub timescale: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    /// Decoder configuration record (SPS/PPS, AudioSpecificConfig, ...)
    #[serde(default)]
    pub codec_private: Vec<u8>,
}

impl TrackFormat {
    pub fn video(codec: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            kind: TrackKind::Video,
            codec: codec.into(),
            timescale: 1_000_000,
            width: Some(width),
            height: Some(height),
            sample_rate: None,
            channels: None,
            codec_private: Vec::new(),
        }
    }

    pub fn audio(codec: impl Into<String>, sample_rate: u32, channels: u16) -> Self {
        Self {
            kind: TrackKind::Audio,
            codec: codec.into(),
            timescale: 1_000_000,
            width: None,
            height: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            codec_private: Vec::new(),
        }
    }
}

/// Key frame marker bit in `Sample::flags`
pub const SAMPLE_FLAG_KEY_FRAME: u8 = 0x01;

/// One encoded access unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Presentation timestamp in microseconds, relative to the track start
    pub pts_us: i64,
    pub duration_us: u32,
    /// Raw sample flags, preserved bit for bit
    pub flags: u8,
    pub data: Vec<u8>,
}

impl Sample {
    pub fn is_key_frame(&self) -> bool {
        self.flags & SAMPLE_FLAG_KEY_FRAME != 0
    }
}

/// Per-track outcome of a merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackSummary {
    pub kind: TrackKind,
    pub samples: u64,
    /// Largest presentation timestamp written, in microseconds
    pub last_pts_us: i64,
}

/// Result of a completed merge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    pub output_path: PathBuf,
    pub segments: usize,
    pub tracks: Vec<TrackSummary>,
    pub elapsed_ms: u64,
}

impl MergeReport {
    /// Duration covered by the merged output, taken from the longest track
    pub fn duration(&self) -> Duration {
        let last = self.tracks.iter().map(|t| t.last_pts_us).max().unwrap_or(0);
        Duration::from_micros(last.max(0) as u64)
    }

    pub fn track(&self, kind: TrackKind) -> Option<&TrackSummary> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// Merge errors
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid container {path:?}: {reason}")]
    InvalidContainer { path: PathBuf, reason: String },

    #[error("Nothing to merge")]
    NothingToMerge,

    #[error("No video or audio track in {0:?}")]
    NoTracks(PathBuf),
}

impl MergeError {
    pub fn invalid(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        MergeError::InvalidContainer {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
