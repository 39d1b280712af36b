//! Compilation pipeline for scripts.
//!
//! This module provides:
//! - Toolchain detection (rustc as the external compiler service)
//! - The runtime rlib every script links against
//! - Module compilation (wrapped source → cdylib bytes)
//! - Diagnostic mapping (rustc JSON → the user's line numbers)
//!
//! # Architecture
//!
//! ```text
//! CompilationInput
//!     │
//!     ├── references ──► dedup by path ──► --extern name=path
//!     │
//!     ├── runtime ──► RuntimeLibrary ──► libscriptpad_runtime.rlib (built once)
//!     │
//!     └── code ──► rustc --crate-type=cdylib ──► CompiledModule (bytes)
//!                        │
//!                        └── stderr JSON ──► DiagnosticMapper ──► Vec<Diagnostic>
//! ```

mod diagnostics;
mod runtime;
mod service;
mod toolchain;
mod types;

pub use diagnostics::{Diagnostic, DiagnosticMapper, DiagnosticSpan, Severity, SourceLocation};
pub use runtime::{RUNTIME_CRATE, RuntimeLibrary};
pub use service::{CompilerService, SOURCE_FILE};
pub use toolchain::Toolchain;
pub use types::{
    CompilationInput, CompilationResult, CompiledModule, CompilerConfig, OptimizationLevel,
    TargetKind, dylib_extension, dylib_prefix,
};
