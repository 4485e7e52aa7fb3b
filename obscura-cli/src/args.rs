//! Command-line argument definitions for obscura-cli.

use clap::{ArgAction, Parser};
use std::path::PathBuf;

use obscura_utils::config::RedactionMode;

/// Detect faces and license plates in images and redact them.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct RedactArgs {
    /// Path to an image file or a directory containing images.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Directory to write redacted images into.
    #[arg(short, long, default_value = "redacted")]
    pub output: PathBuf,

    /// Path to the face detection ONNX model (overrides the settings
    /// file; defaults to models/face_detection_640.onnx).
    #[arg(long)]
    pub face_model: Option<PathBuf>,

    /// Path to the license plate detection ONNX model (overrides the
    /// settings file; defaults to models/plate_detection_640.onnx).
    #[arg(long)]
    pub plate_model: Option<PathBuf>,

    /// Skip face detection entirely.
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_faces: bool,

    /// Skip license plate detection entirely.
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_plates: bool,

    /// Optional settings JSON (defaults to built-in parameters).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the square model input size (pixels).
    #[arg(long)]
    pub model_size: Option<u32>,

    /// Override the confidence threshold for both detectors.
    #[arg(long)]
    pub confidence: Option<f32>,

    /// Override the NMS IoU threshold.
    #[arg(long)]
    pub iou: Option<f32>,

    /// Redaction mode: blur, pixelate, or fill.
    #[arg(long)]
    pub mode: Option<RedactionMode>,

    /// Override the blur radius in pixels.
    #[arg(long)]
    pub blur_radius: Option<f32>,

    /// Override the feather radius in pixels.
    #[arg(long)]
    pub feather_radius: Option<f32>,

    /// Override the pixelate mosaic cell size in pixels.
    #[arg(long)]
    pub pixelate_cell: Option<u32>,

    /// Fill color as a hex string (e.g. #000000) for fill mode.
    #[arg(long)]
    pub fill_color: Option<String>,

    /// Write a JSON report of detections to this path instead of stdout.
    #[arg(long)]
    pub json: Option<PathBuf>,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,
}
