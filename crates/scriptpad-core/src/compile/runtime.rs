//! The runtime rlib every script links against.
//!
//! Built once per toolchain version into `<build>/runtime/<hash>/` and shared
//! by all compiles, across processes, guarded by a file lock.

use std::fs::{self, File};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use rustc_hash::FxHasher;

use super::toolchain::Toolchain;
use crate::error::{Error, Result};

/// Crate name scripts use to reach the runtime.
pub const RUNTIME_CRATE: &str = "scriptpad_runtime";

const RUNTIME_SOURCE: &str = include_str!("../../../scriptpad-runtime/src/lib.rs");

/// Lazily built runtime library.
#[derive(Debug)]
pub struct RuntimeLibrary {
    dir: PathBuf,
    built: Mutex<Option<PathBuf>>,
}

impl RuntimeLibrary {
    pub fn new(build_dir: &Path) -> Self {
        Self {
            dir: build_dir.join("runtime"),
            built: Mutex::new(None),
        }
    }

    /// Path to the rlib, building it first if needed.
    pub fn ensure(&self, toolchain: &Toolchain) -> Result<PathBuf> {
        let mut built = self.built.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(path) = built.as_ref()
            && path.exists()
        {
            return Ok(path.clone());
        }

        let mut hasher = FxHasher::default();
        RUNTIME_SOURCE.hash(&mut hasher);
        toolchain.version().hash(&mut hasher);
        let out_dir = self.dir.join(format!("{:016x}", hasher.finish()));
        fs::create_dir_all(&out_dir)?;

        let rlib = out_dir.join(format!("lib{}.rlib", RUNTIME_CRATE));

        let lock = File::create(out_dir.join(".lock"))?;
        lock.lock_exclusive()?;
        let result = if rlib.exists() {
            Ok(())
        } else {
            Self::build(toolchain, &out_dir, &rlib)
        };
        let _ = FileExt::unlock(&lock);
        result?;

        *built = Some(rlib.clone());
        Ok(rlib)
    }

    fn build(toolchain: &Toolchain, out_dir: &Path, rlib: &Path) -> Result<()> {
        tracing::info!("Building script runtime with {}", toolchain.version());

        let src = out_dir.join("lib.rs");
        fs::write(&src, RUNTIME_SOURCE)?;

        let staging = out_dir.join(format!("lib{}.rlib.partial", RUNTIME_CRATE));
        let output = toolchain
            .command()
            .arg(&src)
            .arg(format!("--crate-name={}", RUNTIME_CRATE))
            .arg("--crate-type=rlib")
            .arg("--edition=2021")
            .arg("-Copt-level=2")
            .arg("-o")
            .arg(&staging)
            .output()
            .map_err(|e| Error::Toolchain(format!("Failed to run rustc: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Toolchain(format!(
                "Failed to build script runtime: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        fs::rename(&staging, rlib)?;
        Ok(())
    }
}
