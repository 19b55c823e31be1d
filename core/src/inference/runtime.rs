//! The native-library seam.
//!
//! [`Runtime`] is the Infero C contract expressed as a safe trait, and
//! [`NativeRuntime`] implements it on top of a dynamically loaded
//! `libinferoapi`.

use dlopen::wrapper::Container;
use parking_lot::{const_mutex, Condvar, Mutex};
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use super::ffi;
use crate::error::{InferoError, Result};
use crate::tensor::{to_c_shape, TensorLayout};

/// A read-only tensor argument. `data` is contiguous in the call's layout.
#[derive(Debug, Clone, Copy)]
pub struct TensorIn<'a> {
    pub name: &'a str,
    pub shape: &'a [usize],
    pub data: &'a [f32],
}

/// A writable tensor argument. `data` is contiguous in the call's layout.
#[derive(Debug)]
pub struct TensorOut<'a> {
    pub name: &'a str,
    pub shape: &'a [usize],
    pub data: &'a mut [f32],
}

/// Operations of the Infero C API, one method per native entry point.
///
/// Handles are created, opened, used, closed and deleted in that order;
/// enforcing the order is the caller's job (see [`super::Infero`]).
pub trait Runtime: Send + Sync {
    /// Native handle type.
    type Handle: Send;

    /// Build a model handle from a YAML configuration string.
    fn create_handle(&self, config_yaml: &str) -> Result<Self::Handle>;

    /// Build a model handle from a YAML configuration file.
    fn create_handle_from_file(&self, path: &Path) -> Result<Self::Handle>;

    fn open_handle(&self, handle: &mut Self::Handle) -> Result<()>;

    fn close_handle(&self, handle: &mut Self::Handle) -> Result<()>;

    fn delete_handle(&self, handle: Self::Handle) -> Result<()>;

    /// Single input, single output inference.
    fn infer(
        &self,
        handle: &mut Self::Handle,
        input: &TensorIn<'_>,
        output: &mut TensorOut<'_>,
        layout: TensorLayout,
    ) -> Result<()>;

    /// Multi-input, multi-output inference with named tensors.
    fn infer_mimo(
        &self,
        handle: &mut Self::Handle,
        inputs: &[TensorIn<'_>],
        outputs: &mut [TensorOut<'_>],
        layout: TensorLayout,
    ) -> Result<()>;

    fn print_config(&self, handle: &Self::Handle) -> Result<()>;

    fn print_statistics(&self, handle: &Self::Handle) -> Result<()>;
}

/// Assertion the backend raises when the model's output shape differs from
/// the declared one.
pub const OUTPUT_SHAPE_ASSERTION: &str = "tOut.shape() == out_shape";

/// Turn a failed output shape assertion into a `ShapeMismatch`.
///
/// Every other failure, including input reshape errors raised by a backend,
/// is returned unchanged.
pub fn classify_inference_failure(err: InferoError, declared: &[usize]) -> InferoError {
    match err {
        InferoError::Native { message, .. } if message.contains(OUTPUT_SHAPE_ASSERTION) => {
            InferoError::ShapeMismatch {
                declared: declared.to_vec(),
                message,
            }
        }
        other => other,
    }
}

fn check_len(name: &str, shape: &[usize], len: usize) -> Result<Vec<c_int>> {
    let c_shape = to_c_shape(shape)?;
    let expected: usize = shape.iter().product();
    if expected != len {
        return Err(InferoError::tensor(format!(
            "tensor '{}' has {} elements but shape {:?} needs {}",
            name, len, shape, expected
        )));
    }
    Ok(c_shape)
}

fn c_string(s: &str, what: &str) -> Result<CString> {
    CString::new(s).map_err(|_| InferoError::config(format!("{} contains a NUL byte", what)))
}

fn c_len(n: usize) -> Result<c_int> {
    c_int::try_from(n).map_err(|_| InferoError::tensor(format!("{} does not fit a C int", n)))
}

/// Owned native model handle.
#[derive(Debug)]
pub struct NativeHandle(NonNull<ffi::infero_handle_t>);

// SAFETY: a handle is only used through `&mut` or by value, never concurrently.
unsafe impl Send for NativeHandle {}

impl NativeHandle {
    fn as_ptr(&self) -> *mut ffi::infero_handle_t {
        self.0.as_ptr()
    }
}

static LOADED: Mutex<Option<Weak<NativeRuntime>>> = const_mutex(None);
// notified once a dropped instance has finalised and cleared `LOADED`
static UNLOADED: Condvar = Condvar::new();

/// A loaded and initialised `libinferoapi`.
///
/// The library may only be initialised once per process at a time, so
/// [`NativeRuntime::load`] hands out a shared instance. `infero_finalise`
/// runs when the last reference is dropped.
pub struct NativeRuntime {
    api: Container<ffi::InferoApi>,
    path: PathBuf,
    // the error string buffer on the native side is process-global
    call_lock: Mutex<()>,
    // argv handed to infero_initialise must outlive the library
    _arg0: CString,
    _argv: Box<[*mut c_char]>,
}

// SAFETY: every native call goes through `call_lock`; `_argv` is never read.
unsafe impl Send for NativeRuntime {}
unsafe impl Sync for NativeRuntime {}

impl NativeRuntime {
    /// Load and initialise the library at `path`, or return the live instance.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let mut slot = LOADED.lock();

        loop {
            let live = slot.as_ref().map(Weak::upgrade);
            match live {
                Some(Some(runtime)) => {
                    if runtime.path != path {
                        warn!(
                            "Infero already loaded from {}; ignoring {}",
                            runtime.path.display(),
                            path.display()
                        );
                    }
                    return Ok(runtime);
                }
                // last reference dropped, finalise still pending
                Some(None) => UNLOADED.wait(&mut slot),
                None => break,
            }
        }

        info!("Loading Infero library: {}", path.display());
        let api = unsafe { Container::<ffi::InferoApi>::load(path.as_os_str()) }.map_err(|e| {
            InferoError::LibraryLoad {
                path: path.to_path_buf(),
                message: e.to_string(),
            }
        })?;

        let arg0 = c_string(env!("CARGO_PKG_NAME"), "program name")?;
        let mut argv: Box<[*mut c_char]> =
            vec![arg0.as_ptr() as *mut c_char, ptr::null_mut()].into_boxed_slice();

        let code = unsafe { api.infero_initialise(1, argv.as_mut_ptr()) };
        check(&api, "infero_initialise", code)?;

        let runtime = Arc::new(Self {
            api,
            path: path.to_path_buf(),
            call_lock: const_mutex(()),
            _arg0: arg0,
            _argv: argv,
        });
        *slot = Some(Arc::downgrade(&runtime));
        info!("Infero library initialised");
        Ok(runtime)
    }

    /// Path the library was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map a native return code to a `Result`. Call with `call_lock` held.
    fn check(&self, call: &'static str, code: c_int) -> Result<()> {
        check(&self.api, call, code)
    }

    fn create_with(
        &self,
        call: &'static str,
        arg: &CStr,
        create: fn(&ffi::InferoApi, *const c_char, *mut *mut ffi::infero_handle_t) -> c_int,
    ) -> Result<NativeHandle> {
        let _guard = self.call_lock.lock();
        let mut raw: *mut ffi::infero_handle_t = ptr::null_mut();
        let code = create(&self.api, arg.as_ptr(), &mut raw);
        self.check(call, code)?;
        NonNull::new(raw)
            .map(NativeHandle)
            .ok_or_else(|| InferoError::native(call, code, "library returned a null handle"))
    }
}

fn error_string(api: &ffi::InferoApi, code: c_int) -> String {
    unsafe {
        let msg = api.infero_error_string(code);
        if msg.is_null() {
            "Unknown error".to_string()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        }
    }
}

fn check(api: &ffi::InferoApi, call: &'static str, code: c_int) -> Result<()> {
    match code {
        ffi::INFERO_SUCCESS => Ok(()),
        ffi::INFERO_ERROR_GENERAL_EXCEPTION | ffi::INFERO_ERROR_UNKNOWN_EXCEPTION => {
            Err(InferoError::native(call, code, error_string(api, code)))
        }
        // the error string is only set for the two exception codes
        _ => Err(InferoError::native(
            call,
            code,
            format!("unrecognised return code {}", code),
        )),
    }
}

impl Drop for NativeRuntime {
    fn drop(&mut self) {
        // loads that find this instance's dead `Weak` wait until the slot is cleared
        let mut slot = LOADED.lock();
        {
            let _guard = self.call_lock.lock();
            let code = unsafe { self.api.infero_finalise() };
            match self.check("infero_finalise", code) {
                Ok(()) => debug!("Infero library finalised"),
                Err(e) => warn!("{}", e),
            }
        }
        if slot.as_ref().map_or(false, |weak| ptr::eq(weak.as_ptr(), &*self)) {
            *slot = None;
        }
        UNLOADED.notify_all();
    }
}

impl Runtime for NativeRuntime {
    type Handle = NativeHandle;

    fn create_handle(&self, config_yaml: &str) -> Result<NativeHandle> {
        let cfg = c_string(config_yaml, "model configuration")?;
        self.create_with("infero_create_handle_from_yaml_str", &cfg, |api, s, h| unsafe {
            api.infero_create_handle_from_yaml_str(s, h)
        })
    }

    fn create_handle_from_file(&self, path: &Path) -> Result<NativeHandle> {
        let path = c_string(&path.to_string_lossy(), "configuration path")?;
        self.create_with("infero_create_handle_from_yaml_file", &path, |api, p, h| unsafe {
            api.infero_create_handle_from_yaml_file(p, h)
        })
    }

    fn open_handle(&self, handle: &mut NativeHandle) -> Result<()> {
        let _guard = self.call_lock.lock();
        let code = unsafe { self.api.infero_open_handle(handle.as_ptr()) };
        self.check("infero_open_handle", code)
    }

    fn close_handle(&self, handle: &mut NativeHandle) -> Result<()> {
        let _guard = self.call_lock.lock();
        let code = unsafe { self.api.infero_close_handle(handle.as_ptr()) };
        self.check("infero_close_handle", code)
    }

    fn delete_handle(&self, handle: NativeHandle) -> Result<()> {
        let _guard = self.call_lock.lock();
        let code = unsafe { self.api.infero_delete_handle(handle.as_ptr()) };
        self.check("infero_delete_handle", code)
    }

    fn infer(
        &self,
        handle: &mut NativeHandle,
        input: &TensorIn<'_>,
        output: &mut TensorOut<'_>,
        layout: TensorLayout,
    ) -> Result<()> {
        let ishape = check_len(input.name, input.shape, input.data.len())?;
        let oshape = check_len(output.name, output.shape, output.data.len())?;

        let _guard = self.call_lock.lock();
        let code = unsafe {
            self.api.infero_inference_float(
                handle.as_ptr(),
                c_len(ishape.len())?,
                input.data.as_ptr(),
                ishape.as_ptr(),
                layout.code(),
                c_len(oshape.len())?,
                output.data.as_mut_ptr(),
                oshape.as_ptr(),
                layout.code(),
            )
        };
        self.check("infero_inference_float", code)
            .map_err(|e| classify_inference_failure(e, output.shape))
    }

    fn infer_mimo(
        &self,
        handle: &mut NativeHandle,
        inputs: &[TensorIn<'_>],
        outputs: &mut [TensorOut<'_>],
        layout: TensorLayout,
    ) -> Result<()> {
        let i_names = inputs
            .iter()
            .map(|t| c_string(t.name, "input name"))
            .collect::<Result<Vec<_>>>()?;
        let i_shapes = inputs
            .iter()
            .map(|t| check_len(t.name, t.shape, t.data.len()))
            .collect::<Result<Vec<_>>>()?;
        let i_ranks = i_shapes
            .iter()
            .map(|s| c_len(s.len()))
            .collect::<Result<Vec<_>>>()?;
        let i_name_ptrs: Vec<*const c_char> = i_names.iter().map(|n| n.as_ptr()).collect();
        let i_shape_ptrs: Vec<*const c_int> = i_shapes.iter().map(|s| s.as_ptr()).collect();
        let i_data_ptrs: Vec<*const f32> = inputs.iter().map(|t| t.data.as_ptr()).collect();

        let o_names = outputs
            .iter()
            .map(|t| c_string(t.name, "output name"))
            .collect::<Result<Vec<_>>>()?;
        let o_shapes = outputs
            .iter()
            .map(|t| check_len(t.name, t.shape, t.data.len()))
            .collect::<Result<Vec<_>>>()?;
        let o_ranks = o_shapes
            .iter()
            .map(|s| c_len(s.len()))
            .collect::<Result<Vec<_>>>()?;
        let o_name_ptrs: Vec<*const c_char> = o_names.iter().map(|n| n.as_ptr()).collect();
        let o_shape_ptrs: Vec<*const c_int> = o_shapes.iter().map(|s| s.as_ptr()).collect();
        let o_data_ptrs: Vec<*mut f32> = outputs.iter_mut().map(|t| t.data.as_mut_ptr()).collect();

        let _guard = self.call_lock.lock();
        let code = unsafe {
            self.api.infero_inference_float_mimo(
                handle.as_ptr(),
                c_len(inputs.len())?,
                i_name_ptrs.as_ptr(),
                i_ranks.as_ptr(),
                i_shape_ptrs.as_ptr(),
                i_data_ptrs.as_ptr(),
                layout.code(),
                c_len(outputs.len())?,
                o_name_ptrs.as_ptr(),
                o_ranks.as_ptr(),
                o_shape_ptrs.as_ptr(),
                o_data_ptrs.as_ptr(),
                layout.code(),
            )
        };
        // backends do not assert MIMO output shapes, so failures stay `Native`
        self.check("infero_inference_float_mimo", code)
    }

    fn print_config(&self, handle: &NativeHandle) -> Result<()> {
        let _guard = self.call_lock.lock();
        let code = unsafe { self.api.infero_print_config(handle.as_ptr()) };
        self.check("infero_print_config", code)
    }

    fn print_statistics(&self, handle: &NativeHandle) -> Result<()> {
        let _guard = self.call_lock.lock();
        let code = unsafe { self.api.infero_print_statistics(handle.as_ptr()) };
        self.check("infero_print_statistics", code)
    }
}
