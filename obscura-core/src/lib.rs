//! Detection core: letterbox preprocessing, ONNX inference, tensor
//! decoding, and detection deduplication for the obscura redaction
//! pipeline.

/// Raw output tensor decoding into candidate boxes.
pub mod decode;
/// Detection orchestration and request coalescing.
pub mod detector;
/// Typed pipeline errors.
pub mod error;
/// Candidate deduplication (cluster fusion plus NMS).
pub mod fusion;
/// Square-input letterbox transform and tensor construction.
pub mod letterbox;
/// ONNX session loading and the memoizing registry.
pub mod model;

pub use decode::{decode_output, DecodeConfig, DecodeOutput, DecodeStats, Detection};
pub use detector::{
    DetectionRun, Detector, DetectorKind, DetectorParams, PerformanceReport, RegionDetector,
    RunCoalescer, RunTicket,
};
pub use error::{InputError, ModelLoadError};
pub use fusion::{fuse_detections, FusionConfig};
pub use letterbox::{letterbox_image, Letterbox, LetterboxOutput};
pub use model::{DetectorModel, ModelKey, ModelRegistry, SessionRegistry};
