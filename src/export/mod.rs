//! Segment merge module
//!
//! This module repackages buffered segments into a single container with
//! continuous per-track timestamps, without re-encoding any sample.

pub mod container;
pub mod pipeline;
pub mod sgmt;
pub mod types;

pub use container::{ContainerFormat, ContainerReader, ContainerWriter};
pub use pipeline::{merge_files, MergePipeline};
pub use sgmt::{SgmtFormat, SgmtReader, SgmtWriter};
pub use types::{
    MergeError, MergeReport, Sample, TrackFormat, TrackKind, TrackSummary, SAMPLE_FLAG_KEY_FRAME,
};
