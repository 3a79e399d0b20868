//! Merge command handlers
//!
//! Merging is also available on its own, for segment files recorded
//! outside the replay buffer.

use crate::export::pipeline::merge_files;
use crate::export::types::MergeReport;
use crate::utils::error::{CaptureError, CaptureErrorKind, ErrorResponse};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State for tracking standalone merges
#[derive(Default, Clone)]
pub struct ExportState {
    /// Whether a merge is currently running
    is_merging: Arc<AtomicBool>,
}

/// Clears the merging flag however the merge ends
struct MergingGuard(Arc<AtomicBool>);

impl Drop for MergingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Relaxed);
    }
}

/// Merge `input_paths`, in order, into `output_path`
pub async fn merge_videos(
    state: &ExportState,
    input_paths: Vec<String>,
    output_path: String,
) -> Result<MergeReport, ErrorResponse> {
    if state.is_merging.swap(true, Ordering::Relaxed) {
        return Err(CaptureError::busy("A merge is already in progress").into());
    }
    let _guard = MergingGuard(state.is_merging.clone());

    tracing::info!("Merging {} files into {}", input_paths.len(), output_path);

    let inputs: Vec<PathBuf> = input_paths.into_iter().map(PathBuf::from).collect();
    let output = PathBuf::from(output_path);
    let result = tokio::task::spawn_blocking(move || merge_files(&inputs, &output)).await;

    match result {
        Ok(Ok(report)) => {
            tracing::info!("Merge completed in {}ms", report.elapsed_ms);
            Ok(report)
        }
        Ok(Err(e)) => {
            tracing::error!("Merge failed: {}", e);
            Err(CaptureError::from(e).into())
        }
        Err(e) => {
            tracing::error!("Merge task panicked: {}", e);
            Err(CaptureError::new(CaptureErrorKind::MergeIoError, e.to_string()).into())
        }
    }
}

/// Check if a merge is running
pub fn is_merging(state: &ExportState) -> bool {
    state.is_merging.load(Ordering::Relaxed)
}
