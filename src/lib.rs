//! Replay buffer - keep the last few seconds, capture on demand.
//!
//! This is the main library crate. It records short segments continuously,
//! keeps only the most recent ones, and on a trigger records a little more
//! and merges everything into one file with continuous timestamps.

pub mod commands;
pub mod export;
pub mod recorder;
pub mod utils;

pub use export::{merge_files, MergePipeline, MergeReport};
pub use recorder::{
    BufferConfig, BufferState, MergedOutput, RecorderEvent, ReplayCoordinator, ReplayHandle,
    SegmentRecorder,
};
pub use utils::error::{CaptureError, CaptureErrorKind, CaptureResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing/logging
///
/// Honors `RUST_LOG`, defaulting to debug output for this crate. Calling it
/// more than once is harmless.
pub fn init_tracing() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "replay_buffer=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Replay buffer v{}", env!("CARGO_PKG_VERSION"));
    }
}
