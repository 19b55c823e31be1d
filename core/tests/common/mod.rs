//! A recording `Runtime` used to exercise handle lifecycles without the native library.

use infero_rs::inference::{classify_inference_failure, Runtime, TensorIn, TensorOut};
use infero_rs::{InferoError, Result, TensorLayout};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct Calls {
    pub created: usize,
    pub opened: usize,
    pub closed: usize,
    pub deleted: usize,
    pub inferred: usize,
    pub configs: Vec<String>,
    pub layouts: Vec<TensorLayout>,
}

#[derive(Debug)]
pub struct FakeHandle(u32);

/// Doubles its (first) input into every output whose shape matches `natural_shape`.
#[derive(Default)]
pub struct FakeRuntime {
    pub natural_shape: Option<Vec<usize>>,
    pub fail_open: bool,
    calls: Mutex<Calls>,
    live: Mutex<HashSet<u32>>,
    next_id: Mutex<u32>,
}

impl FakeRuntime {
    pub fn with_natural_shape(shape: &[usize]) -> Self {
        Self {
            natural_shape: Some(shape.to_vec()),
            ..Self::default()
        }
    }

    pub fn failing_open() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Calls {
        self.calls.lock().clone()
    }

    pub fn live_handles(&self) -> usize {
        self.live.lock().len()
    }

    fn new_handle(&self, config: String) -> FakeHandle {
        let mut next = self.next_id.lock();
        *next += 1;
        self.live.lock().insert(*next);
        let mut calls = self.calls.lock();
        calls.created += 1;
        calls.configs.push(config);
        FakeHandle(*next)
    }

    fn assert_live(&self, handle: &FakeHandle) {
        assert!(
            self.live.lock().contains(&handle.0),
            "handle {} used after delete",
            handle.0
        );
    }
}

impl Runtime for FakeRuntime {
    type Handle = FakeHandle;

    fn create_handle(&self, config_yaml: &str) -> Result<FakeHandle> {
        Ok(self.new_handle(config_yaml.to_string()))
    }

    fn create_handle_from_file(&self, path: &Path) -> Result<FakeHandle> {
        Ok(self.new_handle(std::fs::read_to_string(path)?))
    }

    fn open_handle(&self, handle: &mut FakeHandle) -> Result<()> {
        self.assert_live(handle);
        if self.fail_open {
            return Err(InferoError::native(
                "infero_open_handle",
                1,
                "cannot build interpreter",
            ));
        }
        self.calls.lock().opened += 1;
        Ok(())
    }

    fn close_handle(&self, handle: &mut FakeHandle) -> Result<()> {
        self.assert_live(handle);
        self.calls.lock().closed += 1;
        Ok(())
    }

    fn delete_handle(&self, handle: FakeHandle) -> Result<()> {
        assert!(self.live.lock().remove(&handle.0), "handle {} deleted twice", handle.0);
        self.calls.lock().deleted += 1;
        Ok(())
    }

    fn infer(
        &self,
        handle: &mut FakeHandle,
        input: &TensorIn<'_>,
        output: &mut TensorOut<'_>,
        layout: TensorLayout,
    ) -> Result<()> {
        self.assert_live(handle);
        if let Some(natural) = &self.natural_shape {
            if output.shape != natural.as_slice() {
                let err = InferoError::native(
                    "infero_inference_float",
                    1,
                    "Assertion failed: tOut.shape() == out_shape in infer",
                );
                return Err(classify_inference_failure(err, output.shape));
            }
        }
        for (o, i) in output.data.iter_mut().zip(input.data.iter().cycle()) {
            *o = i * 2.0;
        }
        let mut calls = self.calls.lock();
        calls.inferred += 1;
        calls.layouts.push(layout);
        Ok(())
    }

    fn infer_mimo(
        &self,
        handle: &mut FakeHandle,
        inputs: &[TensorIn<'_>],
        outputs: &mut [TensorOut<'_>],
        layout: TensorLayout,
    ) -> Result<()> {
        self.assert_live(handle);
        let total: f32 = inputs.iter().flat_map(|t| t.data.iter()).sum();
        for (k, output) in outputs.iter_mut().enumerate() {
            output.data.fill(total + k as f32);
        }
        let mut calls = self.calls.lock();
        calls.inferred += 1;
        calls.layouts.push(layout);
        Ok(())
    }

    fn print_config(&self, handle: &FakeHandle) -> Result<()> {
        self.assert_live(handle);
        Ok(())
    }

    fn print_statistics(&self, handle: &FakeHandle) -> Result<()> {
        self.assert_live(handle);
        Ok(())
    }
}

/// Write an empty model file and return its directory guard and path.
pub fn model_file(name: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    std::fs::write(&path, b"model").expect("write model");
    (dir, path)
}
