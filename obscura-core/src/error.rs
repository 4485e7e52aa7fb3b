//! Typed errors for the detection pipeline.
//!
//! Invalid caller input and model acquisition failures get dedicated
//! types so front ends can distinguish "retry with a different model"
//! from "this run was fed garbage". Everything else flows through
//! `anyhow` with context strings.

use thiserror::Error;

/// Fatal-to-this-run input problems. The process stays healthy; the
/// current operation is rejected with no partial result.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InputError {
    #[error("image dimensions must be non-zero (got {width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("unsupported output tensor shape {shape:?}; expected rank 2 or 3")]
    UnsupportedShape { shape: Vec<usize> },
}

/// Model payload acquisition or parse failure. Recoverable: the caller
/// may retry with a different source.
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model payload from {source_name} is too small to be a valid ONNX graph ({size} bytes)")]
    TooSmall { source_name: String, size: usize },
    #[error("failed to parse ONNX graph from {source_name}: {reason}")]
    Parse { source_name: String, reason: String },
}
