use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use serde::Serialize;
use walkdir::WalkDir;

use obscura_core::{
    Detection, Detector, DetectorKind, DetectorParams, FusionConfig, ModelRegistry, RegionDetector,
};
use obscura_utils::{
    config::AppSettings, configure_telemetry, geometry::Region, init_logging, load_image,
    normalize_path, parse_hex_color, redact_regions, RedactionSettings,
};

mod args;

use args::RedactArgs;

const DEFAULT_FACE_MODEL: &str = "models/face_detection_640.onnx";
const DEFAULT_PLATE_MODEL: &str = "models/plate_detection_640.onnx";

#[derive(Debug, Serialize)]
struct DetectionRecord {
    confidence: f32,
    bbox: [f32; 4],
}

impl From<&Detection> for DetectionRecord {
    fn from(detection: &Detection) -> Self {
        let region = detection.region;
        Self {
            confidence: detection.confidence,
            bbox: [region.x, region.y, region.width, region.height],
        }
    }
}

#[derive(Debug, Serialize)]
struct ImageReport {
    image: String,
    output: String,
    faces: Vec<DetectionRecord>,
    plates: Vec<DetectionRecord>,
}

fn main() -> Result<()> {
    init_logging(log::LevelFilter::Info)?;
    let args = RedactArgs::parse();

    let input_path = normalize_path(&args.input)?;
    fs::create_dir_all(&args.output).with_context(|| {
        format!("failed to create output directory {}", args.output.display())
    })?;
    let output_dir = normalize_path(&args.output)?;

    let mut settings = load_settings(args.config.as_ref())?;
    apply_cli_overrides(&mut settings, &args)?;
    settings.redaction.sanitize();
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );

    let registry = ModelRegistry::new();
    let detectors = build_detectors(&registry, &settings, &args);
    anyhow::ensure!(
        !detectors.is_empty(),
        "no detector could be loaded; nothing to do"
    );

    let images = collect_images(&input_path)?;
    if images.is_empty() {
        anyhow::bail!(
            "no images found at {} (supported extensions: jpg, jpeg, png, bmp, webp)",
            input_path.display()
        );
    }

    info!("Processing {} image(s)...", images.len());
    let mut reports = Vec::with_capacity(images.len());
    for image_path in images {
        match process_image(&image_path, &output_dir, &detectors, &settings) {
            Ok(report) => {
                info!(
                    "{} -> {} face(s), {} plate(s)",
                    image_path.display(),
                    report.faces.len(),
                    report.plates.len()
                );
                reports.push(report);
            }
            Err(err) => {
                warn!("Failed to process {}: {err}", image_path.display());
            }
        }
    }

    if reports.is_empty() {
        anyhow::bail!("all images failed; no output produced");
    }

    if let Some(json_path) = args.json.as_ref() {
        if let Some(dir) = json_path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        let file = File::create(json_path)
            .with_context(|| format!("failed to create {}", json_path.display()))?;
        serde_json::to_writer_pretty(file, &reports)
            .with_context(|| format!("failed to write report JSON to {}", json_path.display()))?;
        info!("Wrote report to {}", json_path.display());
    } else {
        let json = serde_json::to_string_pretty(&reports).context("failed to serialize report")?;
        println!("{json}");
    }

    Ok(())
}

fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        AppSettings::load_from_path(&resolved)
    } else {
        Ok(AppSettings::default())
    }
}

fn apply_cli_overrides(settings: &mut AppSettings, args: &RedactArgs) -> Result<()> {
    if let Some(size) = args.model_size {
        settings.detection.model_size = size;
    }
    if let Some(confidence) = args.confidence {
        settings.detection.confidence_threshold = confidence;
        settings.face_confidence = Some(confidence);
        settings.plate_confidence = Some(confidence);
    }
    if let Some(iou) = args.iou {
        settings.detection.iou_threshold = iou;
    }
    if let Some(mode) = args.mode {
        settings.redaction.mode = mode;
    }
    if let Some(radius) = args.blur_radius {
        settings.redaction.blur_radius = radius;
    }
    if let Some(radius) = args.feather_radius {
        settings.redaction.feather_radius = radius;
    }
    if let Some(cell) = args.pixelate_cell {
        settings.redaction.pixelate_cell_size = cell;
    }
    if let Some(hex) = args.fill_color.as_ref() {
        settings.redaction.fill_color =
            parse_hex_color(hex).with_context(|| format!("invalid --fill-color '{hex}'"))?;
    }
    if args.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = args.telemetry_level.as_ref() {
        settings.telemetry.level = level.clone();
    }
    Ok(())
}

/// Construct the enabled detectors. A detector whose model fails to
/// load is logged and skipped so the other kind keeps working.
fn build_detectors(
    registry: &ModelRegistry,
    settings: &AppSettings,
    args: &RedactArgs,
) -> Vec<Detector> {
    let specs = [
        (
            DetectorKind::Face,
            args.no_faces,
            args.face_model.as_ref(),
            settings.face_model.as_deref(),
            DEFAULT_FACE_MODEL,
        ),
        (
            DetectorKind::Plate,
            args.no_plates,
            args.plate_model.as_ref(),
            settings.plate_model.as_deref(),
            DEFAULT_PLATE_MODEL,
        ),
    ];

    let mut detectors = Vec::new();
    for (kind, disabled, cli_path, settings_path, default) in specs {
        if disabled {
            continue;
        }
        let path = resolve_model_path(cli_path, settings_path, default);
        match build_detector(registry, settings, kind, &path) {
            Ok(detector) => detectors.push(detector),
            Err(err) => {
                warn!("Skipping {} detection: {err:#}", kind.label());
            }
        }
    }
    detectors
}

/// Model path precedence: explicit CLI flag, then the settings file,
/// then the built-in default.
fn resolve_model_path(
    cli_path: Option<&PathBuf>,
    settings_path: Option<&str>,
    default: &str,
) -> String {
    if let Some(path) = cli_path {
        return path.display().to_string();
    }
    if let Some(path) = settings_path {
        return path.to_string();
    }
    default.to_string()
}

fn build_detector(
    registry: &ModelRegistry,
    settings: &AppSettings,
    kind: DetectorKind,
    model_path: &str,
) -> Result<Detector> {
    let size = settings.detection.model_size;
    let mut params = match kind {
        DetectorKind::Face => DetectorParams::face(model_path, size),
        DetectorKind::Plate => DetectorParams::plate(model_path, size),
    };
    params.decode.confidence_threshold = match kind {
        DetectorKind::Face => settings
            .face_confidence
            .unwrap_or(settings.detection.confidence_threshold),
        DetectorKind::Plate => settings
            .plate_confidence
            .unwrap_or(settings.detection.confidence_threshold),
    };
    params.fusion = FusionConfig::from(&settings.detection);
    params.pad_ratio = settings.redaction.pad_ratio;
    Detector::new(registry, params)
}

/// Detect and redact one image. Plates are redacted before faces so a
/// face overlapping a plate region still reads from pristine source
/// pixels for its own target rect.
fn process_image(
    image_path: &Path,
    output_dir: &Path,
    detectors: &[Detector],
    settings: &AppSettings,
) -> Result<ImageReport> {
    let image = load_image(image_path)?;
    let source = image.to_rgba8();
    let mut dest = source.clone();

    let mut faces = Vec::new();
    let mut plates = Vec::new();

    // One failing detector kind must not take down the other: log and
    // carry on with whatever the healthy detectors found.
    for detector in detectors.iter() {
        match detector.detect_image(&image) {
            Ok(run) => match detector.kind() {
                DetectorKind::Face => faces = run.detections,
                DetectorKind::Plate => plates = run.detections,
            },
            Err(err) => {
                warn!(
                    "{} detection failed on {}: {err:#}",
                    detector.kind().label(),
                    image_path.display()
                );
            }
        }
    }

    for (kind, detections) in [(DetectorKind::Plate, &plates), (DetectorKind::Face, &faces)] {
        if detections.is_empty() {
            continue;
        }
        let regions: Vec<Region> = detections.iter().map(|d| d.region).collect();
        let pass_settings = redaction_for_kind(kind, settings, detectors);
        redact_regions(&mut dest, &source, &regions, &pass_settings)
            .with_context(|| format!("{} redaction failed", kind.label()))?;
        debug!("redacted {} {} region(s)", regions.len(), kind.label());
    }

    let file_name = image_path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("image.png"));
    let output_path = output_dir.join(file_name);
    dest.save(&output_path)
        .with_context(|| format!("failed to save {}", output_path.display()))?;

    Ok(ImageReport {
        image: image_path.display().to_string(),
        output: output_path.display().to_string(),
        faces: faces.iter().map(DetectionRecord::from).collect(),
        plates: plates.iter().map(DetectionRecord::from).collect(),
    })
}

/// Redaction settings for one pass, with the per-kind box growth policy
/// taken from the matching detector.
fn redaction_for_kind(
    kind: DetectorKind,
    settings: &AppSettings,
    detectors: &[Detector],
) -> RedactionSettings {
    let mut pass = settings.redaction.clone();
    if let Some(detector) = detectors.iter().find(|d| d.kind() == kind) {
        pass.pad_ratio = detector.params().pad_ratio;
        pass.vertical_shift_ratio = detector.params().vertical_shift_ratio;
    }
    pass
}

fn collect_images(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    if !path.is_dir() {
        anyhow::bail!(
            "input path is neither file nor directory: {}",
            path.display()
        );
    }

    let exts = ["jpg", "jpeg", "png", "bmp", "webp"];
    let mut images = Vec::new();
    for entry in WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if let Some(ext) = entry.path().extension().and_then(|e| e.to_str()) {
            let ext_lower = ext.to_ascii_lowercase();
            if exts.contains(&ext_lower.as_str()) {
                images.push(entry.path().to_path_buf());
            } else {
                debug!("Skipping non-image file {}", entry.path().display());
            }
        }
    }
    images.sort();
    Ok(images)
}
