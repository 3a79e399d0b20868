//! Buffer mode command handlers

use crate::recorder::config::BufferConfig;
use crate::recorder::coordinator::{ReplayCoordinator, ReplayHandle};
use crate::recorder::state::{BufferState, MergedOutput};
use crate::recorder::SegmentRecorder;
use crate::utils::error::ErrorResponse;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Application state for buffer mode
#[derive(Clone)]
pub struct RecorderState {
    pub handle: ReplayHandle,
}

impl RecorderState {
    pub fn new(handle: ReplayHandle) -> Self {
        Self { handle }
    }

    /// Start the replay buffer with the config stored at `config_path`
    ///
    /// A missing file means default settings.
    pub fn start(recorder: Arc<dyn SegmentRecorder>, config_path: &Path) -> anyhow::Result<Self> {
        let config = BufferConfig::load(config_path)
            .with_context(|| format!("Failed to load buffer config from {:?}", config_path))?;
        let handle = ReplayCoordinator::new(recorder, config)
            .spawn()
            .context("Failed to start replay buffer")?;
        Ok(Self::new(handle))
    }
}

/// Enable buffer mode
pub async fn enable_buffer_mode(
    state: &RecorderState,
    pre_buffer_ms: u64,
    post_buffer_ms: u64,
) -> Result<(), ErrorResponse> {
    state
        .handle
        .enable_buffer_mode(
            Duration::from_millis(pre_buffer_ms),
            Duration::from_millis(post_buffer_ms),
        )
        .await
        .map_err(ErrorResponse::from)
}

/// Disable buffer mode
pub async fn disable_buffer_mode(state: &RecorderState) -> Result<(), ErrorResponse> {
    state.handle.disable_buffer_mode().await.map_err(ErrorResponse::from)
}

/// Capture the buffered footage plus the post-buffer
///
/// Without an output path the capture lands in the configured output
/// directory under a timestamped name.
pub async fn trigger_capture(
    state: &RecorderState,
    output_path: Option<String>,
) -> Result<MergedOutput, ErrorResponse> {
    let result = match output_path {
        Some(path) => state.handle.trigger_capture_to(PathBuf::from(path)).await,
        None => state.handle.trigger_capture().await,
    };
    result.map_err(ErrorResponse::from)
}

/// Get current buffer state
pub async fn get_buffer_state(state: &RecorderState) -> Result<BufferState, ErrorResponse> {
    Ok(state.handle.state())
}
