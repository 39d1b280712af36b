//! Engine directory management.
//!
//! Keeps the same layout across the CLI, the script host, and tests.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Directory structure for engine artifacts.
///
/// ```text
/// <root>/
/// ├── build/   # Runtime rlib, compile scratch dirs
/// ├── arenas/  # Modules loaded by in-process arenas
/// └── hosts/   # Modules handed to script host processes
/// ```
#[derive(Debug, Clone)]
pub struct EngineDirs {
    /// The root directory itself.
    pub root: PathBuf,

    /// Build directory for compiled artifacts.
    pub build_dir: PathBuf,

    /// Per-arena load directories.
    pub arena_dir: PathBuf,

    /// Module files staged for script host processes.
    pub host_dir: PathBuf,
}

impl EngineDirs {
    /// Create the structure under `root`.
    ///
    /// # Errors
    /// Returns an error if directory creation fails.
    pub fn at(root: &Path) -> Result<Self> {
        let dirs = Self {
            root: root.to_path_buf(),
            build_dir: root.join("build"),
            arena_dir: root.join("arenas"),
            host_dir: root.join("hosts"),
        };
        dirs.create()?;
        Ok(dirs)
    }

    /// The per-user cache location, `<cache>/scriptpad`.
    pub fn user_default() -> Result<Self> {
        let cache = dirs::cache_dir()
            .ok_or_else(|| Error::InvalidOperation("No cache directory on this platform".into()))?;
        Self::at(&cache.join("scriptpad"))
    }

    /// Directories for a build directory taken from a compiler config.
    ///
    /// The arena and host dirs become siblings of `build_dir`.
    pub fn from_build_dir(build_dir: &Path) -> Result<Self> {
        let root = build_dir.parent().unwrap_or(Path::new("."));
        let dirs = Self {
            root: root.to_path_buf(),
            build_dir: build_dir.to_path_buf(),
            arena_dir: root.join("arenas"),
            host_dir: root.join("hosts"),
        };
        dirs.create()?;
        Ok(dirs)
    }

    /// Remove everything and recreate the structure.
    pub fn clean(&self) -> Result<()> {
        for dir in [&self.build_dir, &self.arena_dir, &self.host_dir] {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        self.create()
    }

    fn create(&self) -> Result<()> {
        fs::create_dir_all(&self.build_dir)?;
        fs::create_dir_all(&self.arena_dir)?;
        fs::create_dir_all(&self.host_dir)?;
        Ok(())
    }
}
