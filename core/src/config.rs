//! Configuration types for infero-rs.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{InferoError, Result};
use crate::inference::{yaml_scalar, ModelSpec, ModelType};
use crate::tensor::TensorLayout;

/// Environment variable that overrides the native library location.
pub const LIBRARY_ENV: &str = "INFERO_LIB";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Native library configuration.
    #[serde(default)]
    pub library: LibraryConfig,

    /// Model configuration.
    #[serde(default)]
    pub model: ModelConfig,

    /// Inference configuration.
    #[serde(default)]
    pub inference: InferenceConfig,
}

/// Where to find `libinferoapi`.
#[derive(Debug, Default, Deserialize)]
pub struct LibraryConfig {
    /// Path (or bare file name resolved by the dynamic loader).
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl LibraryConfig {
    /// Resolve the library path.
    ///
    /// Precedence: explicit override, then `INFERO_LIB`, then this config,
    /// then the platform default name.
    pub fn resolve(&self, explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(path) = std::env::var_os(LIBRARY_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(path);
        }
        self.path
            .clone()
            .unwrap_or_else(|| PathBuf::from(default_library_name()))
    }
}

/// Platform file name of the Infero C API library.
pub fn default_library_name() -> &'static str {
    if cfg!(target_os = "macos") {
        "libinferoapi.dylib"
    } else {
        "libinferoapi.so"
    }
}

/// Model configuration.
#[derive(Debug, Default, Deserialize)]
pub struct ModelConfig {
    /// Path to the model artifact.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Backend tag (tflite, onnx, tf_c, trt). Guessed from the extension if absent.
    #[serde(default, rename = "type")]
    pub model_type: Option<String>,

    /// Extra backend parameters forwarded to the native configuration.
    #[serde(default)]
    pub params: BTreeMap<String, serde_yaml::Value>,
}

impl ModelConfig {
    /// Build a model spec, letting `path` and `model_type` override the file.
    pub fn to_spec(&self, path: Option<&Path>, model_type: Option<&str>) -> Result<ModelSpec> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| self.path.clone())
            .ok_or_else(|| InferoError::config("no model path given"))?;

        let model_type = match model_type.or(self.model_type.as_deref()) {
            Some(tag) => tag.parse()?,
            None => ModelType::from_path(&path).ok_or_else(|| {
                InferoError::config(format!(
                    "cannot infer model type from {}; pass it explicitly",
                    path.display()
                ))
            })?,
        };

        let mut spec = ModelSpec::new(path, model_type);
        for (key, value) in &self.params {
            spec = spec.with_param(key, yaml_scalar(value)?);
        }
        Ok(spec)
    }
}

/// Inference configuration.
#[derive(Debug, Deserialize)]
pub struct InferenceConfig {
    /// Memory layout of tensors handed to the native library.
    #[serde(default)]
    pub layout: TensorLayout,

    /// Number of times each inference is repeated by the runner.
    #[serde(default = "default_repetitions")]
    pub repetitions: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            layout: TensorLayout::default(),
            repetitions: default_repetitions(),
        }
    }
}

fn default_repetitions() -> usize {
    1
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        if config.inference.repetitions == 0 {
            return Err(InferoError::config("inference.repetitions must be at least 1"));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.library.path.is_none());
        assert_eq!(config.inference.layout, TensorLayout::C);
        assert_eq!(config.inference.repetitions, 1);
    }

    #[test]
    fn test_from_yaml_str() {
        let config = Config::from_yaml_str(
            r#"
library:
  path: /opt/infero/lib/libinferoapi.so
model:
  path: cyclone.onnx
  params:
    num_threads: 4
inference:
  layout: fortran
  repetitions: 10
"#,
        )
        .unwrap();

        assert_eq!(
            config.library.resolve(Some(Path::new("/tmp/explicit.so"))),
            PathBuf::from("/tmp/explicit.so")
        );
        assert_eq!(config.inference.layout, TensorLayout::Fortran);
        assert_eq!(config.inference.repetitions, 10);

        let spec = config.model.to_spec(None, None).unwrap();
        assert_eq!(spec.model_type(), ModelType::Onnx);
        assert_eq!(spec.params(), &[("numThreads".to_string(), "4".to_string())]);
    }

    #[test]
    fn test_zero_repetitions_rejected() {
        let err = Config::from_yaml_str("inference:\n  repetitions: 0\n").unwrap_err();
        assert!(matches!(err, InferoError::Config(_)));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let model = ModelConfig {
            path: Some(PathBuf::from("m.bin")),
            model_type: Some("caffe".into()),
            params: BTreeMap::new(),
        };
        assert!(matches!(
            model.to_spec(None, None),
            Err(InferoError::UnknownModelType(tag)) if tag == "caffe"
        ));
    }

    #[test]
    fn test_missing_path_rejected() {
        let err = ModelConfig::default().to_spec(None, Some("tflite")).unwrap_err();
        assert!(matches!(err, InferoError::Config(_)));
    }
}
