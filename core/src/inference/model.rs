//! Safe, scoped model handles.
//!
//! This module provides the typed model description ([`ModelType`],
//! [`ModelSpec`]) and the [`Infero`] handle that drives a [`Runtime`]
//! through the create/initialise/infer/finalise lifecycle.

use ndarray::{ArrayBase, ArrayD, ArrayViewD, Data, Dimension};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::runtime::{NativeRuntime, Runtime, TensorIn, TensorOut};
use crate::error::{InferoError, Result};
use crate::tensor::{self, TensorLayout};

/// Inference backend selected by the model type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// TensorFlow Lite flatbuffer.
    Tflite,
    /// ONNX Runtime.
    Onnx,
    /// TensorFlow C API (saved model).
    TfCApi,
    /// TensorRT engine.
    TensorRt,
}

impl ModelType {
    /// Every supported backend.
    pub const ALL: [ModelType; 4] = [Self::Tflite, Self::Onnx, Self::TfCApi, Self::TensorRt];

    /// The tag understood by the native library.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Tflite => "tflite",
            Self::Onnx => "onnx",
            Self::TfCApi => "tf_c",
            Self::TensorRt => "trt",
        }
    }

    /// Guess the backend from a model file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "tflite" => Some(Self::Tflite),
            "onnx" => Some(Self::Onnx),
            "pb" => Some(Self::TfCApi),
            "trt" | "engine" => Some(Self::TensorRt),
            _ => None,
        }
    }
}

impl FromStr for ModelType {
    type Err = InferoError;

    /// Parse a model type tag like "tflite", "onnx", "tf_c", "trt".
    fn from_str(s: &str) -> Result<Self> {
        let tag = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.tag() == tag)
            .ok_or_else(|| InferoError::UnknownModelType(s.trim().to_string()))
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Convert a snake_case parameter name to the camelCase the native side expects.
pub fn clike_param_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) fn yaml_scalar(value: &serde_yaml::Value) -> Result<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s.clone()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        other => Ok(serde_yaml::to_string(other)?.trim_end().to_string()),
    }
}

/// A model artifact: path, backend and extra backend parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    path: PathBuf,
    model_type: ModelType,
    params: Vec<(String, String)>,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>, model_type: ModelType) -> Self {
        Self {
            path: path.into(),
            model_type,
            params: Vec::new(),
        }
    }

    /// Add a backend parameter. The name is converted to camelCase and
    /// replaces an earlier value of the same name.
    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Self {
        let name = clike_param_name(name);
        let value = value.into();
        match self.params.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.params.push((name, value)),
        }
        self
    }

    /// Read a flat native configuration file (`path`, `type`, then parameters).
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let mut entries: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(&content)?;

        let model_path = entries
            .remove("path")
            .and_then(|v| v.as_str().map(PathBuf::from))
            .ok_or_else(|| {
                InferoError::config(format!("{} has no string 'path' entry", path.display()))
            })?;
        let model_type = entries
            .remove("type")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| {
                InferoError::config(format!("{} has no string 'type' entry", path.display()))
            })?
            .parse()?;

        let mut spec = Self::new(model_path, model_type);
        for (name, value) in &entries {
            spec = spec.with_param(name, yaml_scalar(value)?);
        }
        Ok(spec)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn model_type(&self) -> ModelType {
        self.model_type
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Render the `key: value` configuration string handed to the native library.
    pub fn to_yaml(&self) -> Result<String> {
        let path = self.path.to_string_lossy();
        let entries = [("path", path.as_ref()), ("type", self.model_type.tag())]
            .into_iter()
            .chain(self.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let mut lines = Vec::new();
        for (key, value) in entries {
            if key.contains(['\n', ':']) || value.contains('\n') {
                return Err(InferoError::config(format!(
                    "parameter {:?} cannot be rendered on one line",
                    key
                )));
            }
            lines.push(format!("{}: {}", key, value));
        }
        Ok(lines.join("\n"))
    }
}

/// Lifecycle state of an [`Infero`] handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Native handle built, not yet opened.
    Created,
    /// Opened and ready for inference.
    Open,
    /// Closed and deleted.
    Finalised,
}

/// Timing of the inference calls made through one handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceStats {
    /// Number of successful inference calls.
    pub calls: u64,
    /// Total wall-clock time spent in successful calls.
    pub total: Duration,
    /// Duration of the most recent successful call.
    pub last: Option<Duration>,
}

impl InferenceStats {
    fn record(&mut self, elapsed: Duration) {
        self.calls += 1;
        self.total += elapsed;
        self.last = Some(elapsed);
    }

    /// Mean latency, if any call was made.
    pub fn mean(&self) -> Option<Duration> {
        u32::try_from(self.calls)
            .ok()
            .filter(|&n| n > 0)
            .map(|n| self.total / n)
    }
}

impl fmt::Display for InferenceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mean() {
            Some(mean) => write!(
                f,
                "{} inference calls, total {:.2}ms, mean {:.2}ms",
                self.calls,
                self.total.as_secs_f64() * 1e3,
                mean.as_secs_f64() * 1e3
            ),
            None => write!(f, "no inference calls"),
        }
    }
}

/// A model handle bound to an Infero runtime.
///
/// Lifecycle: [`Infero::new`] -> [`Infero::initialise`] ->
/// [`Infero::infer`]* -> [`Infero::finalise`]. Misuse is reported as
/// [`InferoError::NotInitialised`] or [`InferoError::Finalised`].
/// Dropping a handle that was not finalised releases it.
///
/// # Example
///
/// ```ignore
/// use infero_rs::inference::{Infero, ModelSpec, ModelType, NativeRuntime};
///
/// let runtime = NativeRuntime::load("libinferoapi.so")?;
/// let spec = ModelSpec::new("cyclone_model_200x200.tflite", ModelType::Tflite);
/// let mut infero = Infero::new(runtime, spec)?;
/// infero.initialise()?;
/// let output = infero.infer(&input, &[1, 200, 200, 1])?;
/// infero.finalise()?;
/// ```
pub struct Infero<R: Runtime = NativeRuntime> {
    runtime: Arc<R>,
    handle: Option<R::Handle>,
    state: HandleState,
    spec: ModelSpec,
    layout: TensorLayout,
    stats: InferenceStats,
}

impl<R: Runtime> Infero<R> {
    /// Build a handle for `spec`.
    ///
    /// # Errors
    ///
    /// Returns [`InferoError::ModelNotFound`] if the model path does not exist,
    /// before anything is asked of the native library.
    pub fn new(runtime: Arc<R>, spec: ModelSpec) -> Result<Self> {
        if !spec.path().exists() {
            return Err(InferoError::ModelNotFound(spec.path().to_path_buf()));
        }
        let config = spec.to_yaml()?;
        debug!("Model configuration:\n{}", config);

        let handle = runtime.create_handle(&config)?;
        info!("Created {} handle for {}", spec.model_type(), spec.path().display());
        Ok(Self::with_handle(runtime, handle, spec))
    }

    /// Build a handle from a native YAML configuration file.
    pub fn from_yaml_file(runtime: Arc<R>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let spec = ModelSpec::from_yaml_file(path)?;
        if !spec.path().exists() {
            return Err(InferoError::ModelNotFound(spec.path().to_path_buf()));
        }

        let handle = runtime.create_handle_from_file(path)?;
        info!(
            "Created {} handle for {} from {}",
            spec.model_type(),
            spec.path().display(),
            path.display()
        );
        Ok(Self::with_handle(runtime, handle, spec))
    }

    fn with_handle(runtime: Arc<R>, handle: R::Handle, spec: ModelSpec) -> Self {
        Self {
            runtime,
            handle: Some(handle),
            state: HandleState::Created,
            spec,
            layout: TensorLayout::default(),
            stats: InferenceStats::default(),
        }
    }

    /// Set the memory layout used for tensors crossing the C boundary.
    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn layout(&self) -> TensorLayout {
        self.layout
    }

    pub fn statistics(&self) -> &InferenceStats {
        &self.stats
    }

    /// Open the native handle. Calling it again on an open handle is a no-op.
    pub fn initialise(&mut self) -> Result<()> {
        match self.state {
            HandleState::Open => {
                debug!("Handle already initialised");
                Ok(())
            }
            HandleState::Finalised => Err(InferoError::Finalised),
            HandleState::Created => {
                let handle = self.handle.as_mut().ok_or(InferoError::Finalised)?;
                self.runtime.open_handle(handle)?;
                self.state = HandleState::Open;
                info!("Handle initialised");
                Ok(())
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            HandleState::Open => Ok(()),
            HandleState::Created => Err(InferoError::NotInitialised),
            HandleState::Finalised => Err(InferoError::Finalised),
        }
    }

    /// Run one inference. The output has exactly `output_shape`.
    ///
    /// # Errors
    ///
    /// Lifecycle errors if the handle is not open, [`InferoError::Tensor`] for
    /// an invalid declared shape, [`InferoError::ShapeMismatch`] if the backend
    /// produces a different shape, and [`InferoError::Native`] otherwise.
    pub fn infer<S, D>(
        &mut self,
        input: &ArrayBase<S, D>,
        output_shape: &[usize],
    ) -> Result<ArrayD<f32>>
    where
        S: Data<Elem = f32>,
        D: Dimension,
    {
        self.ensure_open()?;
        tensor::to_c_shape(input.shape())?;
        tensor::to_c_shape(output_shape)?;

        let layout = self.layout;
        let input_buf = tensor::contiguous(input.view().into_dyn(), layout);
        let input_data = input_buf
            .as_slice()
            .ok_or_else(|| InferoError::tensor("input is not contiguous"))?;

        let mut output = tensor::zeros(output_shape, layout);
        let output_data = output
            .as_slice_memory_order_mut()
            .ok_or_else(|| InferoError::tensor("output is not contiguous"))?;

        debug!(
            "Inference: input {:?} -> output {:?} ({:?} layout)",
            input.shape(),
            output_shape,
            layout
        );

        let handle = self.handle.as_mut().ok_or(InferoError::Finalised)?;
        let start = Instant::now();
        self.runtime.infer(
            handle,
            &TensorIn {
                name: "input",
                shape: input.shape(),
                data: input_data,
            },
            &mut TensorOut {
                name: "output",
                shape: output_shape,
                data: output_data,
            },
            layout,
        )?;
        let elapsed = start.elapsed();
        self.stats.record(elapsed);
        debug!("Inference took {:.2}ms", elapsed.as_secs_f64() * 1e3);

        Ok(output)
    }

    /// Run multi-input, multi-output inference.
    ///
    /// Inputs and outputs are matched to the model by name; the returned
    /// outputs keep the order and shapes given in `outputs`.
    pub fn infer_mimo(
        &mut self,
        inputs: &[(&str, ArrayViewD<'_, f32>)],
        outputs: &[(&str, &[usize])],
    ) -> Result<Vec<(String, ArrayD<f32>)>> {
        self.ensure_open()?;
        if inputs.is_empty() || outputs.is_empty() {
            return Err(InferoError::tensor(
                "at least one input and one output are required",
            ));
        }
        check_unique(inputs.iter().map(|(name, _)| *name), "input")?;
        check_unique(outputs.iter().map(|(name, _)| *name), "output")?;
        for (_, shape) in outputs {
            tensor::to_c_shape(shape)?;
        }

        let layout = self.layout;
        let input_bufs: Vec<_> = inputs
            .iter()
            .map(|(_, view)| tensor::contiguous(view.view(), layout))
            .collect();
        let input_args = inputs
            .iter()
            .zip(&input_bufs)
            .map(|((name, view), buf)| {
                let data = buf.as_slice().ok_or_else(|| {
                    InferoError::tensor(format!("input '{}' is not contiguous", name))
                })?;
                Ok::<_, InferoError>(TensorIn {
                    name: *name,
                    shape: view.shape(),
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut output_arrays: Vec<ArrayD<f32>> = outputs
            .iter()
            .map(|(_, shape)| tensor::zeros(shape, layout))
            .collect();
        let mut output_args = output_arrays
            .iter_mut()
            .zip(outputs)
            .map(|(array, (name, shape))| {
                let data = array.as_slice_memory_order_mut().ok_or_else(|| {
                    InferoError::tensor(format!("output '{}' is not contiguous", name))
                })?;
                Ok::<_, InferoError>(TensorOut {
                    name: *name,
                    shape: *shape,
                    data,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            "MIMO inference: {} inputs -> {} outputs",
            input_args.len(),
            output_args.len()
        );

        let handle = self.handle.as_mut().ok_or(InferoError::Finalised)?;
        let start = Instant::now();
        self.runtime
            .infer_mimo(handle, &input_args, &mut output_args, layout)?;
        self.stats.record(start.elapsed());
        drop(output_args);

        Ok(outputs
            .iter()
            .map(|(name, _)| name.to_string())
            .zip(output_arrays)
            .collect())
    }

    /// Ask the native library to print the model configuration.
    pub fn print_config(&self) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(InferoError::Finalised)?;
        self.runtime.print_config(handle)
    }

    /// Ask the native library to print its statistics.
    pub fn print_statistics(&self) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(InferoError::Finalised)?;
        self.runtime.print_statistics(handle)
    }

    /// Close and delete the native handle. Calling it again is a no-op.
    ///
    /// The handle is released even if closing fails; the first error is returned.
    pub fn finalise(&mut self) -> Result<()> {
        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };
        let was_open = self.state == HandleState::Open;
        self.state = HandleState::Finalised;

        let closed = if was_open {
            self.runtime.close_handle(&mut handle)
        } else {
            Ok(())
        };
        let deleted = self.runtime.delete_handle(handle);
        info!("Handle finalised ({})", self.stats);
        closed.and(deleted)
    }
}

fn check_unique<'a>(names: impl Iterator<Item = &'a str>, kind: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(InferoError::tensor(format!(
                "duplicate {} name '{}'",
                kind, name
            )));
        }
    }
    Ok(())
}

impl<R: Runtime> Drop for Infero<R> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!("Releasing handle that was not finalised");
            if let Err(e) = self.finalise() {
                warn!("Failed to release Infero handle: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_type_from_str() {
        assert_eq!("tflite".parse::<ModelType>().unwrap(), ModelType::Tflite);
        assert_eq!(" ONNX ".parse::<ModelType>().unwrap(), ModelType::Onnx);
        assert_eq!("tf_c".parse::<ModelType>().unwrap(), ModelType::TfCApi);
        assert_eq!("trt".parse::<ModelType>().unwrap(), ModelType::TensorRt);
        assert!(matches!(
            "pytorch".parse::<ModelType>(),
            Err(InferoError::UnknownModelType(tag)) if tag == "pytorch"
        ));
    }

    #[test]
    fn test_model_type_display_roundtrip() {
        for t in ModelType::ALL {
            assert_eq!(t.to_string().parse::<ModelType>().unwrap(), t);
        }
    }

    #[test]
    fn test_model_type_from_path() {
        assert_eq!(
            ModelType::from_path(Path::new("cyclone_model_200x200.tflite")),
            Some(ModelType::Tflite)
        );
        assert_eq!(ModelType::from_path(Path::new("m.ONNX")), Some(ModelType::Onnx));
        assert_eq!(ModelType::from_path(Path::new("m.engine")), Some(ModelType::TensorRt));
        assert_eq!(ModelType::from_path(Path::new("model")), None);
    }

    #[test]
    fn test_clike_param_name() {
        assert_eq!(clike_param_name("num_threads"), "numThreads");
        assert_eq!(clike_param_name("device"), "device");
        assert_eq!(clike_param_name("input_layer_name"), "inputLayerName");
    }

    #[test]
    fn test_spec_to_yaml() {
        let spec = ModelSpec::new("/data/cyclone.tflite", ModelType::Tflite)
            .with_param("num_threads", "4")
            .with_param("numThreads", "8");
        assert_eq!(
            spec.to_yaml().unwrap(),
            "path: /data/cyclone.tflite\ntype: tflite\nnumThreads: 8"
        );

        let bad = ModelSpec::new("m.onnx", ModelType::Onnx).with_param("x", "a\nb");
        assert!(matches!(bad.to_yaml(), Err(InferoError::Config(_))));
    }

    #[test]
    fn test_spec_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.yaml");
        std::fs::write(&path, "path: /m/model.onnx\ntype: onnx\nnumThreads: 2\n").unwrap();

        let spec = ModelSpec::from_yaml_file(&path).unwrap();
        assert_eq!(spec.path(), Path::new("/m/model.onnx"));
        assert_eq!(spec.model_type(), ModelType::Onnx);
        assert_eq!(spec.params(), &[("numThreads".to_string(), "2".to_string())]);

        std::fs::write(&path, "path: /m/model.bin\ntype: caffe\n").unwrap();
        assert!(matches!(
            ModelSpec::from_yaml_file(&path),
            Err(InferoError::UnknownModelType(_))
        ));
    }

    #[test]
    fn test_stats() {
        let mut stats = InferenceStats::default();
        assert_eq!(stats.mean(), None);
        assert_eq!(stats.to_string(), "no inference calls");

        stats.record(Duration::from_millis(2));
        stats.record(Duration::from_millis(4));
        assert_eq!(stats.calls, 2);
        assert_eq!(stats.mean(), Some(Duration::from_millis(3)));
        assert_eq!(stats.last, Some(Duration::from_millis(4)));
    }
}
