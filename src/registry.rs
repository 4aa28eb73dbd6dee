//! Backend registry: name -> (extractor, matcher) implementations
//!
//! The registry is process-wide state seeded exactly once with the built-in
//! backends; callers can register additional implementations under their own
//! names. Lookup is case-insensitive and falls back to the
//! `FINGERMATCH_BACKEND` environment variable when no name is given.

use anyhow::{bail, Context, Result};
use candle_core::Device;
use ndarray::ArrayD;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::debug;

use crate::backend::candle::CandleVerifyNet;
use crate::backend::reference::ReferenceVerifyNet;
use crate::backend::{parse_precision, Extraction, Extractor, InputShape, Matcher};
use crate::{BACKEND_ENV_VAR, DEFAULT_FEATURES};

/// Name of the backend used when neither an argument nor the environment
/// variable selects one
pub const DEFAULT_BACKEND: &str = "reference";

/// Construction parameters handed to backend factories
#[derive(Debug, Clone)]
pub struct BackendOptions {
    /// Path to the backend's weight file
    pub weights_path: PathBuf,
    /// Architecture precision variant
    pub precision: String,
    /// Device to run on (ignored by CPU-only backends)
    pub device: Device,
}

impl BackendOptions {
    /// Options for a weights file with the default float32 variant on CPU
    pub fn new<P: Into<PathBuf>>(weights_path: P) -> Self {
        Self {
            weights_path: weights_path.into(),
            precision: "float32".to_string(),
            device: Device::Cpu,
        }
    }

    fn input_shape(&self) -> Result<InputShape> {
        Ok(InputShape::new(
            parse_precision(&self.precision)?,
            DEFAULT_FEATURES,
        ))
    }
}

type ExtractorFactory = Arc<dyn Fn(&BackendOptions) -> Result<Box<dyn Extractor>> + Send + Sync>;
type MatcherFactory = Arc<dyn Fn(&BackendOptions) -> Result<Box<dyn Matcher>> + Send + Sync>;

/// A registered backend: a name plus factories for its two implementations
#[derive(Clone)]
pub struct Backend {
    name: String,
    extractor: ExtractorFactory,
    matcher: MatcherFactory,
}

impl Backend {
    /// Describe a backend by its factories
    pub fn new(name: &str, extractor: ExtractorFactory, matcher: MatcherFactory) -> Self {
        Self {
            name: name.to_string(),
            extractor,
            matcher,
        }
    }

    /// Canonical (lowercase) backend name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Construct this backend's extractor
    pub fn extractor(&self, options: &BackendOptions) -> Result<Box<dyn Extractor>> {
        (self.extractor)(options)
    }

    /// Construct this backend's matcher
    pub fn matcher(&self, options: &BackendOptions) -> Result<Box<dyn Matcher>> {
        (self.matcher)(options)
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend").field("name", &self.name).finish()
    }
}

/// Extractor whose decode stage is not available; the pipeline boundary is
/// bounding boxes and scores, and neither built-in backend ships decode
/// weights with this crate.
struct UnavailableExtractor {
    backend: &'static str,
}

impl Extractor for UnavailableExtractor {
    fn extract_minutiae(&self, _image: &ArrayD<f32>) -> Result<Extraction> {
        bail!(
            "Minutiae extraction is not available for the {} backend: the decode stage requires coarse-net weights that are distributed separately",
            self.backend
        )
    }
}

fn builtin_backends() -> HashMap<String, Backend> {
    let reference = Backend::new(
        "reference",
        Arc::new(|_options| {
            Ok(Box::new(UnavailableExtractor {
                backend: "reference",
            }) as Box<dyn Extractor>)
        }),
        Arc::new(|options| {
            let shape = options.input_shape()?;
            let model = ReferenceVerifyNet::from_safetensors(&options.weights_path, shape)?;
            Ok(Box::new(model) as Box<dyn Matcher>)
        }),
    );
    let candle = Backend::new(
        "candle",
        Arc::new(|_options| {
            Ok(Box::new(UnavailableExtractor { backend: "candle" }) as Box<dyn Extractor>)
        }),
        Arc::new(|options| {
            let shape = options.input_shape()?;
            let model = CandleVerifyNet::load(&options.weights_path, shape, &options.device)?;
            Ok(Box::new(model) as Box<dyn Matcher>)
        }),
    );
    HashMap::from([
        ("reference".to_string(), reference),
        ("candle".to_string(), candle),
    ])
}

fn registry() -> &'static Mutex<HashMap<String, Backend>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, Backend>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(builtin_backends()))
}

/// Resolve a backend by name.
///
/// `None` falls back to the `FINGERMATCH_BACKEND` environment variable, then
/// to [`DEFAULT_BACKEND`]. Lookup is case-insensitive.
pub fn get_backend(name: Option<&str>) -> Result<Backend> {
    let resolved = match name {
        Some(name) => name.to_string(),
        None => std::env::var(BACKEND_ENV_VAR).unwrap_or_else(|_| DEFAULT_BACKEND.to_string()),
    };
    let key = resolved.to_lowercase();
    let backends = registry().lock().unwrap();
    backends
        .get(&key)
        .cloned()
        .with_context(|| format!("Unknown backend {resolved:?}; available: {:?}", sorted_names(&backends)))
}

/// Register a backend under its name.
///
/// Registering over an existing name requires `overwrite`; the collision is
/// otherwise an error so two components cannot silently fight over a name.
pub fn register_backend(backend: Backend, overwrite: bool) -> Result<()> {
    let key = backend.name().to_lowercase();
    let mut backends = registry().lock().unwrap();
    if backends.contains_key(&key) && !overwrite {
        bail!("Backend {key:?} is already registered; pass overwrite to replace it");
    }
    debug!(backend = %key, overwrite, "registering backend");
    backends.insert(
        key.clone(),
        Backend {
            name: key,
            ..backend
        },
    );
    Ok(())
}

/// Remove a backend; unknown names are an error
pub fn unregister_backend(name: &str) -> Result<()> {
    let key = name.to_lowercase();
    let mut backends = registry().lock().unwrap();
    if backends.remove(&key).is_none() {
        bail!("Cannot unregister unknown backend {name:?}");
    }
    Ok(())
}

/// Sorted list of registered backend names
pub fn available_backends() -> Vec<String> {
    let backends = registry().lock().unwrap();
    sorted_names(&backends)
}

fn sorted_names(backends: &HashMap<String, Backend>) -> Vec<String> {
    let mut names: Vec<String> = backends.keys().cloned().collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    struct DummyExtractor;
    impl Extractor for DummyExtractor {
        fn extract_minutiae(&self, _image: &ArrayD<f32>) -> Result<Extraction> {
            Ok(Extraction::default())
        }
    }

    struct DummyMatcher;
    impl Matcher for DummyMatcher {
        fn verify(&self, _anchor: &Array3<f32>, _sample: &Array3<f32>) -> Result<f32> {
            Ok(0.5)
        }
        fn verify_batch(&self, pairs: &[(Array3<f32>, Array3<f32>)]) -> Result<Vec<f32>> {
            Ok(vec![0.5; pairs.len()])
        }
    }

    fn dummy(name: &str) -> Backend {
        Backend::new(
            name,
            Arc::new(|_| Ok(Box::new(DummyExtractor) as Box<dyn Extractor>)),
            Arc::new(|_| Ok(Box::new(DummyMatcher) as Box<dyn Matcher>)),
        )
    }

    #[test]
    fn test_builtins_available() {
        let names = available_backends();
        assert!(names.contains(&"reference".to_string()));
        assert!(names.contains(&"candle".to_string()));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        register_backend(dummy("CaseTest"), false).unwrap();
        assert!(get_backend(Some("casetest")).is_ok());
        assert!(get_backend(Some("CASETEST")).is_ok());
        unregister_backend("casetest").unwrap();
    }

    #[test]
    fn test_unknown_backend_is_error() {
        let err = get_backend(Some("no-such-backend")).unwrap_err();
        assert!(err.to_string().contains("no-such-backend"));
    }

    #[test]
    fn test_unregister_unknown_is_error() {
        assert!(unregister_backend("never-registered").is_err());
    }
}
