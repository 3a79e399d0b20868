//! Command handlers
//!
//! Thin entry points for a host application: plain values in, structured
//! `ErrorResponse` out.

pub mod export;
pub mod recording;
