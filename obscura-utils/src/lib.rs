//! Common helpers shared across obscura crates.

/// Basic color types and hex parsing.
pub mod color;
/// Redaction compositing (blur, pixelate, fill with feathered masks).
pub mod compositor;
/// Application configuration and settings management.
pub mod config;
/// Axis-aligned box geometry (IoU, containment, center distance).
pub mod geometry;
/// Image loading and resizing helpers.
pub mod image_utils;
/// Instrumentation helpers for optional performance tracing.
pub mod telemetry;

use anyhow::Result;
use log::LevelFilter;
use std::path::Path;

pub use color::{parse_hex_color, RgbaColor};
pub use compositor::redact_regions;
pub use config::{
    default_settings_path, AppSettings, DetectionSettings, RedactionMode, RedactionSettings,
    TelemetrySettings,
};
pub use geometry::{clamp, Region};
pub use image_utils::{load_image, resize_image};
pub use telemetry::{
    configure as configure_telemetry, telemetry_allows, telemetry_enabled, timing_guard,
    TimingGuard,
};

/// Initialize logging once for CLI environments.
///
/// Respects the `RUST_LOG` environment variable when set; otherwise falls
/// back to the provided default filter level.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module("obscura::telemetry", LevelFilter::Trace);

    if builder.try_init().is_err() {
        // Logger already initialized; nothing to do.
    }
    Ok(())
}

/// Validate that a path exists and resolve it to an absolute path.
pub fn normalize_path<P: AsRef<Path>>(path: P) -> Result<std::path::PathBuf> {
    let path = path.as_ref();
    anyhow::ensure!(path.exists(), "path does not exist: {}", path.display());
    Ok(path.canonicalize()?)
}
