//! Common types for the compilation pipeline.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::diagnostics::{Diagnostic, Severity};
use crate::script::{Edition, Reference};
use crate::wrap::WrappedProgram;

/// Optimization profile for compiled scripts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationLevel {
    #[default]
    Debug,
    Release,
}

impl OptimizationLevel {
    /// The matching `-C opt-level` value.
    pub fn opt_level(&self) -> u8 {
        match self {
            OptimizationLevel::Debug => 0,
            OptimizationLevel::Release => 3,
        }
    }
}

/// What the compiler emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetKind {
    /// A loadable module exporting the script entry point.
    #[default]
    Module,
    /// An rlib other scripts can reference.
    Library,
}

impl TargetKind {
    pub fn crate_type(&self) -> &'static str {
        match self {
            TargetKind::Module => "cdylib",
            TargetKind::Library => "rlib",
        }
    }

    pub fn file_name(&self) -> String {
        match self {
            TargetKind::Module => format!("{}script.{}", dylib_prefix(), dylib_extension()),
            TargetKind::Library => "libscript.rlib".to_string(),
        }
    }
}

/// Configuration for the compiler service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompilerConfig {
    /// Directory for build artifacts
    pub build_dir: PathBuf,

    /// Embed debug info so panics and stack traces map to source
    pub debug_info: bool,

    /// Default optimization level for scripts
    pub optimization: OptimizationLevel,

    /// Additional rustc flags
    pub extra_rustc_flags: Vec<String>,

    /// Successful compiles kept in memory for identical inputs (0 disables)
    pub module_cache_size: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            build_dir: PathBuf::from(".scriptpad/build"),
            debug_info: true,
            optimization: OptimizationLevel::Debug,
            extra_rustc_flags: Vec::new(),
            module_cache_size: 32,
        }
    }
}

impl CompilerConfig {
    /// Create a config for development (fast compile, debug info).
    pub fn development() -> Self {
        Self::default()
    }

    /// Create a config for optimized scripts.
    pub fn production() -> Self {
        Self {
            debug_info: false,
            optimization: OptimizationLevel::Release,
            ..Self::default()
        }
    }

    pub fn with_build_dir(mut self, build_dir: impl Into<PathBuf>) -> Self {
        self.build_dir = build_dir.into();
        self
    }

    pub fn with_module_cache_size(mut self, size: usize) -> Self {
        self.module_cache_size = size;
        self
    }
}

/// Everything one compile needs. Built fresh per run.
#[derive(Debug, Clone, Default)]
pub struct CompilationInput {
    /// Complete source text.
    pub code: String,
    /// References on top of the base set, in priority order.
    pub references: Vec<Reference>,
    pub edition: Edition,
    pub target: TargetKind,
    pub optimization: OptimizationLevel,
    /// Lines of `code` that hold the user's snippet, for diagnostic mapping.
    pub user_lines: Option<Range<usize>>,
    /// Leading user lines placed verbatim at the top of `code`.
    pub lifted_lines: usize,
}

impl CompilationInput {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            ..Self::default()
        }
    }

    /// Build an input from wrapped source, keeping its line offsets.
    pub fn from_wrapped(program: &WrappedProgram) -> Self {
        let start = program.user_start_line;
        Self {
            code: program.source.clone(),
            user_lines: Some(start..start + program.user_line_count),
            lifted_lines: program.lifted_lines,
            ..Self::default()
        }
    }

    pub fn with_references(mut self, references: impl IntoIterator<Item = Reference>) -> Self {
        self.references.extend(references);
        self
    }

    pub fn with_edition(mut self, edition: Edition) -> Self {
        self.edition = edition;
        self
    }

    pub fn with_target(mut self, target: TargetKind) -> Self {
        self.target = target;
        self
    }

    pub fn with_optimization(mut self, optimization: OptimizationLevel) -> Self {
        self.optimization = optimization;
        self
    }
}

/// A compiled, loadable module.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    /// Identity derived from the compilation input, e.g. `script-00ff..`.
    pub name: String,
    pub bytes: Arc<Vec<u8>>,
    /// 1-based line the user's code starts on, for panic location mapping.
    pub user_start_line: Option<usize>,
}

/// Result of a compile. Diagnostics are present even on success.
#[derive(Debug, Clone)]
pub struct CompilationResult {
    pub success: bool,
    /// Present iff `success`.
    pub module: Option<CompiledModule>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilationResult {
    /// A failed compile carrying a single error.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            module: None,
            diagnostics: vec![Diagnostic::simple(Severity::Error, message)],
        }
    }

    /// Error-level diagnostics.
    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    /// Warning-level diagnostics.
    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }
}

/// Platform-specific dynamic library extension.
pub fn dylib_extension() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "dll"
    }
    #[cfg(target_os = "macos")]
    {
        "dylib"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "so"
    }
}

/// Platform-specific dynamic library prefix.
pub fn dylib_prefix() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        ""
    }
    #[cfg(not(target_os = "windows"))]
    {
        "lib"
    }
}
