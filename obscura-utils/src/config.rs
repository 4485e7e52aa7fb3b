//! Shared configuration types consumed across the obscura workspace.
//!
//! These structures carry every tunable the detection and redaction
//! pipeline recognizes. Defaults live here as a policy layer; the decode,
//! fusion, and compositing algorithms themselves take explicit parameters
//! and bake in no magic values.

use crate::color::RgbaColor;

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Parameters controlling how raw detector output is filtered and fused.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectionSettings {
    /// Square model input resolution in pixels.
    pub model_size: u32,
    /// Minimum confidence for a candidate to survive decoding. Applied
    /// inclusively: values exactly at the threshold are kept.
    pub confidence_threshold: f32,
    /// IoU threshold for the final non-maximum suppression stage.
    pub iou_threshold: f32,
    /// Containment ratio at which a box nested inside another is dropped.
    pub containment_threshold: f32,
    /// Normalized center distance below which two boxes count as duplicates.
    pub center_distance_threshold: f32,
    /// Maximum number of detections returned per run.
    pub max_detections: usize,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            model_size: 640,
            confidence_threshold: 0.35,
            iou_threshold: 0.45,
            containment_threshold: 0.8,
            center_distance_threshold: 0.2,
            max_detections: 64,
        }
    }
}

/// How a detected region is obscured.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedactionMode {
    /// Feathered elliptical blur.
    #[default]
    Blur,
    /// Coarse rectangular mosaic.
    Pixelate,
    /// Solid rectangular fill.
    Fill,
}

impl fmt::Display for RedactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                RedactionMode::Blur => "blur",
                RedactionMode::Pixelate => "pixelate",
                RedactionMode::Fill => "fill",
            }
        )
    }
}

impl FromStr for RedactionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blur" => Ok(RedactionMode::Blur),
            "pixelate" | "mosaic" => Ok(RedactionMode::Pixelate),
            "fill" | "solid" => Ok(RedactionMode::Fill),
            other => Err(format!(
                "invalid redaction mode '{other}'; expected 'blur', 'pixelate', or 'fill'"
            )),
        }
    }
}

/// Parameters for the redaction compositor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedactionSettings {
    /// Which obscuring treatment to apply.
    pub mode: RedactionMode,
    /// Blur strength in pixels (split into multiple passes internally).
    pub blur_radius: f32,
    /// Width of the soft alpha falloff beyond the elliptical mask, in pixels.
    pub feather_radius: f32,
    /// Mosaic cell edge length in pixels for pixelate mode.
    pub pixelate_cell_size: u32,
    /// Fill color for solid mode.
    pub fill_color: RgbaColor,
    /// Grow each region by this fraction of its own size before redacting.
    pub pad_ratio: f32,
    /// Shift each grown region upward by this fraction of its height
    /// (covers hair and forehead above a detected face box).
    pub vertical_shift_ratio: f32,
}

impl Default for RedactionSettings {
    fn default() -> Self {
        Self {
            mode: RedactionMode::Blur,
            blur_radius: 12.0,
            feather_radius: 8.0,
            pixelate_cell_size: 12,
            fill_color: RgbaColor::default(),
            pad_ratio: 0.08,
            vertical_shift_ratio: 0.1,
        }
    }
}

impl RedactionSettings {
    /// Clamp values into sensible ranges.
    pub fn sanitize(&mut self) {
        self.blur_radius = self.blur_radius.clamp(0.0, 100.0);
        self.feather_radius = self.feather_radius.clamp(0.0, 100.0);
        self.pixelate_cell_size = self.pixelate_cell_size.clamp(2, 256);
        self.pad_ratio = self.pad_ratio.clamp(0.0, 1.0);
        self.vertical_shift_ratio = self.vertical_shift_ratio.clamp(-1.0, 1.0);
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether telemetry timing logs are enabled.
    pub enabled: bool,
    /// Logging level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Debug,
        }
    }

    /// Update the level string from a `LevelFilter` value.
    pub fn set_level(&mut self, level: LevelFilter) {
        let label = match level {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };
        self.level = label.to_string();
    }
}

/// Persistent application settings consumed by the CLI front end.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppSettings {
    /// Optional override for the face detection ONNX model path.
    pub face_model: Option<String>,
    /// Optional override for the license plate detection ONNX model path.
    pub plate_model: Option<String>,
    /// Shared detection parameters.
    pub detection: DetectionSettings,
    /// Face-specific confidence override (faces and plates want different
    /// operating points while sharing one pipeline).
    pub face_confidence: Option<f32>,
    /// Plate-specific confidence override.
    pub plate_confidence: Option<f32>,
    /// Redaction compositor parameters.
    pub redaction: RedactionSettings,
    /// Telemetry and diagnostics preferences.
    pub telemetry: TelemetrySettings,
}

impl AppSettings {
    /// Load settings from a JSON file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let mut settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings.redaction.sanitize();
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }
}

/// Returns the default path for persisted application settings.
pub fn default_settings_path() -> PathBuf {
    std::env::current_dir()
        .map(|dir| dir.join("config/obscura_settings.json"))
        .unwrap_or_else(|_| PathBuf::from("config/obscura_settings.json"))
}
