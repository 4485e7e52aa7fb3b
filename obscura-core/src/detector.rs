//! Detection orchestration: letterbox, inference, decode, fusion.
//!
//! One `Detector` wraps one model session (shared through the registry)
//! plus the decode and fusion policy for a detector kind. Faces and
//! license plates run as independent detectors so one failing model
//! never takes down the other.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

use anyhow::{Context, Result};
use image::{DynamicImage, GenericImageView};
use log::Level;

use obscura_utils::timing_guard;

use crate::{
    decode::{decode_output, DecodeConfig, DecodeStats, Detection},
    fusion::{fuse_detections, FusionConfig},
    letterbox::letterbox_image,
    model::{DetectorModel, ModelKey, ModelRegistry},
};

/// What a detector looks for. Only affects policy defaults and labels;
/// the pipeline is identical for every kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorKind {
    Face,
    Plate,
}

impl DetectorKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Face => "face",
            Self::Plate => "plate",
        }
    }
}

/// Everything needed to construct (or fetch from cache) a detector.
#[derive(Debug, Clone)]
pub struct DetectorParams {
    pub kind: DetectorKind,
    pub model_path: String,
    /// Square model input side in pixels.
    pub input_size: u32,
    pub decode: DecodeConfig,
    pub fusion: FusionConfig,
    /// Box growth applied by the redaction stage, carried here because
    /// it participates in the session cache key.
    pub pad_ratio: f32,
    pub vertical_shift_ratio: f32,
}

impl DetectorParams {
    /// Face policy: slightly higher confidence bar, generous padding
    /// shifted upward to cover hair and forehead.
    pub fn face(model_path: impl Into<String>, input_size: u32) -> Self {
        Self {
            kind: DetectorKind::Face,
            model_path: model_path.into(),
            input_size,
            decode: DecodeConfig {
                confidence_threshold: 0.35,
                force_normalized: false,
            },
            fusion: FusionConfig::default(),
            pad_ratio: 0.08,
            vertical_shift_ratio: 0.10,
        }
    }

    /// Plate policy: lower confidence bar (plates are small and often
    /// oblique), symmetric padding.
    pub fn plate(model_path: impl Into<String>, input_size: u32) -> Self {
        Self {
            kind: DetectorKind::Plate,
            model_path: model_path.into(),
            input_size,
            decode: DecodeConfig {
                confidence_threshold: 0.30,
                force_normalized: false,
            },
            fusion: FusionConfig::default(),
            pad_ratio: 0.05,
            vertical_shift_ratio: 0.0,
        }
    }

    pub fn model_key(&self) -> ModelKey {
        ModelKey::new(
            &self.model_path,
            self.input_size,
            self.decode.confidence_threshold,
            self.fusion.final_iou,
            self.pad_ratio,
        )
    }
}

/// Per-stage wall-clock timings for one detection run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceReport {
    pub count: usize,
    pub preprocess_ms: f64,
    pub infer_ms: f64,
    pub postprocess_ms: f64,
    pub total_ms: f64,
}

/// Result of a detection run: final boxes plus observability data.
#[derive(Debug, Clone, Default)]
pub struct DetectionRun {
    pub detections: Vec<Detection>,
    pub stats: DecodeStats,
    pub report: PerformanceReport,
}

/// Anything that can produce redaction candidates for an image. Lets
/// callers mix model-backed detectors with other box sources (manual
/// regions, OCR) without the compositor caring.
pub trait RegionDetector {
    fn kind(&self) -> DetectorKind;
    fn detect_image(&self, image: &DynamicImage) -> Result<DetectionRun>;
}

/// Model-backed detector for one kind.
#[derive(Debug)]
pub struct Detector {
    params: DetectorParams,
    model: Arc<DetectorModel>,
}

impl Detector {
    /// Build a detector, sharing the model session through `registry`.
    pub fn new(registry: &ModelRegistry, params: DetectorParams) -> Result<Self> {
        let key = params.model_key();
        let model = registry
            .get_or_load(&key, || {
                DetectorModel::load_path(&params.model_path, params.input_size)
            })
            .with_context(|| format!("failed to load {} model", params.kind.label()))?;
        Ok(Self { params, model })
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }
}

impl RegionDetector for Detector {
    fn kind(&self) -> DetectorKind {
        self.params.kind
    }

    /// Run the full pipeline on one image. An empty result is a valid,
    /// common outcome, not an error.
    fn detect_image(&self, image: &DynamicImage) -> Result<DetectionRun> {
        let _guard = timing_guard("obscura_core::detect_image", Level::Debug);
        let total_start = Instant::now();
        let (orig_w, orig_h) = image.dimensions();

        let preprocess_start = Instant::now();
        let preprocessed = letterbox_image(image, self.params.input_size)
            .with_context(|| format!("{} preprocessing failed", self.params.kind.label()))?;
        let preprocess_ms = preprocess_start.elapsed().as_secs_f64() * 1000.0;

        let infer_start = Instant::now();
        let output = self
            .model
            .run(preprocessed.tensor)
            .with_context(|| format!("{} inference failed", self.params.kind.label()))?;
        let infer_ms = infer_start.elapsed().as_secs_f64() * 1000.0;

        let postprocess_start = Instant::now();
        let decoded = decode_output(
            &output,
            &preprocessed.letterbox,
            orig_w,
            orig_h,
            &self.params.decode,
        )?;
        let detections = fuse_detections(&decoded.detections, orig_w, orig_h, &self.params.fusion);
        let postprocess_ms = postprocess_start.elapsed().as_secs_f64() * 1000.0;

        let report = PerformanceReport {
            count: detections.len(),
            preprocess_ms,
            infer_ms,
            postprocess_ms,
            total_ms: total_start.elapsed().as_secs_f64() * 1000.0,
        };
        log::debug!(
            "{}: {} detections ({} candidates, {} non-finite dropped) in {:.1}ms",
            self.params.kind.label(),
            report.count,
            decoded.stats.candidates,
            decoded.stats.non_finite_dropped,
            report.total_ms
        );

        Ok(DetectionRun {
            detections,
            stats: decoded.stats,
            report,
        })
    }
}

/// Coalesces overlapping detection requests: each new request takes a
/// ticket, and a completed run is applied only if its ticket is still
/// the newest. In-flight work is allowed to finish; its result is
/// simply discarded when superseded.
#[derive(Debug, Default)]
pub struct RunCoalescer {
    generation: AtomicU64,
}

/// Marker for one scheduled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTicket {
    generation: u64,
}

impl RunCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request, superseding all earlier tickets.
    pub fn begin(&self) -> RunTicket {
        RunTicket {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    /// Whether `ticket` is still the most recent request.
    pub fn is_current(&self, ticket: RunTicket) -> bool {
        self.generation.load(Ordering::SeqCst) == ticket.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_ticket_supersedes_older_runs() {
        let coalescer = RunCoalescer::new();
        let first = coalescer.begin();
        assert!(coalescer.is_current(first));

        let second = coalescer.begin();
        assert!(!coalescer.is_current(first));
        assert!(coalescer.is_current(second));
    }

    #[test]
    fn face_and_plate_policies_differ() {
        let face = DetectorParams::face("face.onnx", 640);
        let plate = DetectorParams::plate("plate.onnx", 640);
        assert_eq!(face.kind.label(), "face");
        assert_eq!(plate.kind.label(), "plate");
        assert!(face.decode.confidence_threshold > plate.decode.confidence_threshold);
        assert!(face.vertical_shift_ratio > 0.0);
        assert_eq!(plate.vertical_shift_ratio, 0.0);
    }

    #[test]
    fn model_key_reflects_decode_and_fusion_policy() {
        let a = DetectorParams::face("face.onnx", 640).model_key();
        let mut params = DetectorParams::face("face.onnx", 640);
        params.decode.confidence_threshold = 0.5;
        let b = params.model_key();
        assert_ne!(a, b);

        // Same policy, same key, regardless of float noise.
        let mut noisy = DetectorParams::face("face.onnx", 640);
        noisy.decode.confidence_threshold = 0.35 + 1e-7;
        assert_eq!(a, noisy.model_key());
    }

    #[test]
    fn missing_model_reports_detector_kind() {
        let registry = ModelRegistry::new();
        let err = Detector::new(&registry, DetectorParams::face("missing.onnx", 640))
            .expect_err("missing model");
        assert!(format!("{err}").contains("face"));
    }
}
