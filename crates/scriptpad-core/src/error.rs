//! Error types for scriptpad-core.

use thiserror::Error;

use crate::script::ScriptKind;

/// Result type for scriptpad-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scriptpad-core.
///
/// Ordinary compile errors and user-code failures are not errors here: they
/// come back as diagnostics and [`RunResult`](crate::execute::RunResult)s.
#[derive(Debug, Error)]
pub enum Error {
    /// The snippet could not be turned into a program.
    #[error(transparent)]
    Wrap(#[from] WrapError),

    /// Compilation could not be attempted.
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// Failed to load dynamic library.
    #[error("failed to load library: {0}")]
    LibraryLoad(#[from] libloading::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// IPC communication error with the script host process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Toolchain error.
    #[error("toolchain error: {0}")]
    Toolchain(String),

    /// Execution error.
    #[error("execution error: {0}")]
    Execution(String),

    /// A run was requested while another one is in flight.
    #[error("script is already running")]
    AlreadyRunning,

    /// The environment has been disposed.
    #[error("script environment has been disposed")]
    Disposed,

    /// Invalid operation.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Errors raised while wrapping a snippet, before compilation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WrapError {
    /// The script kind has no wrapping strategy.
    #[error("script kind '{0}' is not supported")]
    NotSupportedKind(ScriptKind),

    /// A namespace entry is not a valid `use` path.
    #[error("invalid namespace '{0}'")]
    InvalidNamespace(String),
}
