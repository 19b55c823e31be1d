//! Builds the `infero-stub` cdylib and reads its test hooks.

use dlopen::raw::Library;
use std::os::raw::c_int;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Path of the stub `libinferoapi`, built once per test binary.
pub fn library_path() -> &'static Path {
    static PATH: OnceLock<PathBuf> = OnceLock::new();
    PATH.get_or_init(|| {
        let messages = escargot::CargoBuild::new()
            .package("infero-stub")
            .current_release()
            .current_target()
            .exec()
            .expect("failed to build infero-stub");

        messages
            .filter_map(|message| {
                let message = message.expect("cargo message");
                let decoded = message.decode().expect("decode cargo message");
                match decoded {
                    escargot::format::Message::CompilerArtifact(art)
                        if !art.profile.test
                            && art.target.name == "inferoapi"
                            && art.target.crate_types == ["cdylib"] =>
                    {
                        Some(art.filenames.get(0).expect("files must exist").to_path_buf())
                    }
                    _ => None,
                }
            })
            .next()
            .expect("infero-stub produced no cdylib")
    })
}

/// Keeps the stub loaded and exposes its process state.
pub struct StubHooks {
    lib: Library,
}

impl StubHooks {
    pub fn open() -> Self {
        Self {
            lib: Library::open(library_path()).expect("open stub library"),
        }
    }

    fn call(&self, symbol: &str) -> c_int {
        unsafe {
            let hook: extern "C" fn() -> c_int = self.lib.symbol(symbol).expect("stub hook");
            hook()
        }
    }

    pub fn initialised(&self) -> bool {
        self.call("infero_stub_initialised") == 1
    }

    pub fn live_handles(&self) -> i32 {
        self.call("infero_stub_live_handles")
    }
}

/// Write a placeholder model file and return its directory guard and path.
pub fn model_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    std::fs::write(&path, b"model").expect("write model");
    (dir, path)
}
