//! Replay buffer module
//!
//! This module implements the buffering side of the crate:
//! - SegmentRecorder trait for the camera/encoder producing segments
//! - SegmentWindow holding the most recent segments
//! - BufferingLoop recording one segment after another
//! - ReplayCoordinator running the capture state machine

pub mod buffering;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod segment;
pub mod state;
pub mod synthetic;
pub mod telemetry;
pub mod window;

pub use channel::{RecorderError, SegmentRecorder};
pub use config::{BufferConfig, ConfigError, PostBufferStrategy};
pub use coordinator::{ReplayCoordinator, ReplayHandle};
pub use segment::{Segment, SharedSegment};
pub use state::{BufferState, CaptureSession, MergedOutput, RecorderEvent};
pub use synthetic::{SyntheticRecorder, SyntheticRecorderConfig};
pub use telemetry::{EventPublisher, TelemetrySink, TracingTelemetry};
pub use window::SegmentWindow;
