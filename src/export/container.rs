//! Container abstraction
//!
//! The merge pipeline only ever talks to these traits, so any container
//! family that can be read and written at sample granularity can be merged.

use crate::export::types::{MergeError, Sample, TrackFormat};
use std::path::Path;

/// Sample-level read access to one container file
pub trait ContainerReader {
    /// Tracks in the order they appear in the file
    fn tracks(&self) -> &[TrackFormat];

    /// Samples of one track, in decode order
    fn samples<'a>(
        &'a mut self,
        track: usize,
    ) -> Box<dyn Iterator<Item = Result<Sample, MergeError>> + 'a>;
}

/// Sample-level write access to a container file
///
/// Nothing is visible at the destination path until `finish` succeeds.
/// Dropping a writer without finishing it discards everything written.
pub trait ContainerWriter {
    /// Open an output track and return its index
    fn add_track(&mut self, format: TrackFormat) -> Result<usize, MergeError>;

    fn write_sample(&mut self, track: usize, sample: &Sample) -> Result<(), MergeError>;

    /// Flush and move the file into place
    fn finish(self: Box<Self>) -> Result<(), MergeError>;
}

/// Factory for readers and writers of one container family
pub trait ContainerFormat: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn ContainerReader>, MergeError>;

    fn create(&self, path: &Path) -> Result<Box<dyn ContainerWriter>, MergeError>;

    /// File extension without the leading dot
    fn extension(&self) -> &'static str;
}
