//! Locating the rustc that compiles scripts.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Error, Result};

/// The Rust compiler used as the external compiler service.
#[derive(Debug, Clone)]
pub struct Toolchain {
    /// Path to rustc
    rustc_path: PathBuf,

    /// Toolchain version string
    version: String,
}

impl Toolchain {
    /// Detect rustc.
    ///
    /// `SCRIPTPAD_RUSTC` takes precedence over `rustc` on the PATH.
    pub fn detect() -> Result<Self> {
        let rustc_path = match std::env::var_os("SCRIPTPAD_RUSTC") {
            Some(path) => PathBuf::from(path),
            None => which::which("rustc")
                .map_err(|_| Error::Toolchain("rustc not found in PATH".to_string()))?,
        };
        Self::from_path(rustc_path)
    }

    /// Use a specific rustc binary.
    pub fn from_path(rustc_path: impl Into<PathBuf>) -> Result<Self> {
        let rustc_path = rustc_path.into();
        let version = Self::query(&rustc_path, &["--version"])?;
        tracing::debug!("Using {} at {}", version, rustc_path.display());
        Ok(Self {
            rustc_path,
            version,
        })
    }

    /// Get the rustc path.
    pub fn rustc_path(&self) -> &Path {
        &self.rustc_path
    }

    /// Get the toolchain version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get the sysroot, which holds the base runtime libraries.
    pub fn sysroot(&self) -> Result<PathBuf> {
        Self::query(&self.rustc_path, &["--print", "sysroot"]).map(PathBuf::from)
    }

    /// Start a rustc invocation.
    pub fn command(&self) -> Command {
        Command::new(&self.rustc_path)
    }

    fn query(rustc: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(rustc)
            .args(args)
            .output()
            .map_err(|e| Error::Toolchain(format!("Failed to run {}: {}", rustc.display(), e)))?;

        if !output.status.success() {
            return Err(Error::Toolchain(format!(
                "rustc {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
