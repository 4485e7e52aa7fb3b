//! ONNX model loading and the shared session registry.
//!
//! Sessions are memoized per model identity plus the parameters that
//! affect the compiled graph, so repeated detector construction with the
//! same settings shares one load. Parameter values are rounded before
//! key construction so floating point representation noise cannot split
//! the cache.

use std::{
    collections::HashMap,
    fmt::Write,
    io::Cursor,
    path::Path,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use log::{debug, warn};
use tract_onnx::prelude::{
    tvec, Framework, Graph, InferenceModelExt, IntoTensor, SimplePlan, Tensor, TypedFact, TypedOp,
};

use crate::error::ModelLoadError;

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Smallest byte count that could plausibly hold an ONNX graph.
const MIN_MODEL_BYTES: usize = 1024;

/// A loaded, runnable detection model.
#[derive(Debug)]
pub struct DetectorModel {
    runnable: RunnableModel,
    input_size: u32,
}

impl DetectorModel {
    /// Load a model from disk. `input_size` is the square side the
    /// caller will letterbox inputs to; the graph itself declares its
    /// own input shape.
    pub fn load_path<P: AsRef<Path>>(path: P, input_size: u32) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read model file {}", path.display()))?;
        Self::load_bytes(&bytes, &path.display().to_string(), input_size)
    }

    /// Load a model from an in-memory payload. `source` labels the
    /// payload origin in errors and logs.
    pub fn load_bytes(bytes: &[u8], source: &str, input_size: u32) -> Result<Self> {
        if bytes.len() < MIN_MODEL_BYTES {
            return Err(ModelLoadError::TooSmall {
                source_name: source.to_string(),
                size: bytes.len(),
            }
            .into());
        }

        let runnable = match make_runnable(bytes, source, true) {
            Ok(model) => {
                debug!("model {source} optimized successfully (input {input_size})");
                model
            }
            Err(opt_err) => {
                let optimize_msg = format!("{opt_err}");
                let mut chain_msg = String::new();
                for cause in opt_err.chain() {
                    let _ = writeln!(&mut chain_msg, "  - {cause}");
                }
                warn!(
                    "model {source} failed optimized load ({optimize_msg}); falling back to \
                     decluttered graph (~2x slower).\nError chain:\n{}",
                    chain_msg.trim_end()
                );
                let decluttered = make_runnable(bytes, source, false).with_context(|| {
                    format!("fallback to decluttered graph failed after optimize error: {optimize_msg}")
                })?;
                debug!("model {source} running in decluttered mode");
                decluttered
            }
        };

        Ok(Self {
            runnable,
            input_size,
        })
    }

    /// Execute the model on a preprocessed input tensor and return the
    /// first output.
    pub fn run(&self, input: Tensor) -> Result<Tensor> {
        let outputs = self
            .runnable
            .run(tvec![input.into()])
            .map_err(|e| anyhow::anyhow!("model execution failed: {e}"))?;
        anyhow::ensure!(!outputs.is_empty(), "model produced no outputs");
        if outputs.len() > 1 {
            debug!(
                "model produced {} outputs; decoding the first",
                outputs.len()
            );
        }
        let mut iter = outputs.into_iter();
        let first = iter
            .next()
            .ok_or_else(|| anyhow::anyhow!("model produced no outputs"))?;
        Ok(first.into_tensor())
    }

    pub fn input_size(&self) -> u32 {
        self.input_size
    }
}

fn make_runnable(bytes: &[u8], source: &str, optimized: bool) -> Result<RunnableModel> {
    let model = tract_onnx::onnx()
        .model_for_read(&mut Cursor::new(bytes))
        .map_err(|e| ModelLoadError::Parse {
            source_name: source.to_string(),
            reason: format!("{e}"),
        })?;

    if optimized {
        model
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("unable to optimize graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    } else {
        model
            .into_typed()
            .map_err(|e| anyhow::anyhow!("unable to type-check graph: {e}"))?
            .into_decluttered()
            .map_err(|e| anyhow::anyhow!("unable to declutter graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make graph runnable: {e}"))
    }
}

/// Registry cache key: model identity plus the parameters a cached
/// session was built around. Float parameters are rounded to 3 decimals
/// so representation noise maps to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey(String);

impl ModelKey {
    pub fn new(source: &str, input_size: u32, confidence: f32, iou: f32, pad_ratio: f32) -> Self {
        Self(format!(
            "{source}|{input_size}|{confidence:.3}|{iou:.3}|{pad_ratio:.3}"
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Memoizing session cache, generic over the session type so the
/// sharing behavior is testable without a real model.
#[derive(Debug, Default)]
pub struct SessionRegistry<T> {
    sessions: Mutex<HashMap<ModelKey, Arc<T>>>,
}

/// The registry the detection pipeline uses.
pub type ModelRegistry = SessionRegistry<DetectorModel>;

impl<T> SessionRegistry<T> {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached session for `key`, loading it with `loader`
    /// when absent. The loaded session is shared with every later
    /// request for the same key.
    pub fn get_or_load<F>(&self, key: &ModelKey, loader: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("session registry lock poisoned"))?;
        if let Some(session) = sessions.get(key) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(loader()?);
        sessions.insert(key.clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Drop the cached session for `key`, forcing the next request to
    /// reload.
    pub fn invalidate(&self, key: &ModelKey) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(key);
        }
    }

    /// Drop every cached session.
    pub fn clear(&self) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as IoWrite;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    #[test]
    fn key_rounds_floats_to_three_decimals() {
        let a = ModelKey::new("face.onnx", 640, 0.123456, 0.45, 0.08);
        let b = ModelKey::new("face.onnx", 640, 0.123449, 0.45, 0.08);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "face.onnx|640|0.123|0.450|0.080");

        let c = ModelKey::new("face.onnx", 640, 0.124, 0.45, 0.08);
        assert_ne!(a, c);
    }

    #[test]
    fn registry_loads_once_per_key() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let key = ModelKey::new("m.onnx", 640, 0.35, 0.45, 0.08);
        let loads = AtomicUsize::new(0);

        let first = registry
            .get_or_load(&key, || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            })
            .expect("load");
        let second = registry
            .get_or_load(&key, || {
                loads.fetch_add(1, Ordering::SeqCst);
                Ok(8)
            })
            .expect("cached");

        assert_eq!(*first, 7);
        assert_eq!(*second, 7);
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalidate_forces_reload() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let key = ModelKey::new("m.onnx", 640, 0.35, 0.45, 0.08);

        let first = registry.get_or_load(&key, || Ok(1)).expect("load");
        registry.invalidate(&key);
        let second = registry.get_or_load(&key, || Ok(2)).expect("reload");

        assert_eq!(*first, 1);
        assert_eq!(*second, 2);
    }

    #[test]
    fn failed_load_is_not_cached() {
        let registry: SessionRegistry<u32> = SessionRegistry::new();
        let key = ModelKey::new("m.onnx", 640, 0.35, 0.45, 0.08);

        let err = registry.get_or_load(&key, || anyhow::bail!("boom"));
        assert!(err.is_err());
        let ok = registry.get_or_load(&key, || Ok(3)).expect("retry");
        assert_eq!(*ok, 3);
    }

    #[test]
    fn tiny_payload_is_rejected_before_parsing() {
        let err =
            DetectorModel::load_bytes(b"tiny", "mock.onnx", 640).expect_err("too small");
        let message = format!("{err}");
        assert!(message.contains("too small"), "unexpected: {message}");
        assert!(message.contains("mock.onnx"));
    }

    #[test]
    fn invalid_model_produces_useful_error() {
        let mut temp = NamedTempFile::new().expect("temp file");
        let junk = vec![0x42u8; 4096];
        temp.write_all(&junk).expect("write mock model");

        let err =
            DetectorModel::load_path(temp.path(), 640).expect_err("invalid ONNX should fail");
        let message = format!("{err}");
        assert!(
            message.contains("failed to parse ONNX") || message.contains("unable to optimize"),
            "unexpected error message: {message}"
        );
    }

    #[test]
    fn missing_model_file_fails() {
        let result = DetectorModel::load_path("missing.onnx", 640);
        assert!(result.is_err());
    }
}
