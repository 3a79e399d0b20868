//! Shared utilities

pub mod error;

pub use error::{CaptureError, CaptureErrorKind, CaptureResult, ErrorResponse};
