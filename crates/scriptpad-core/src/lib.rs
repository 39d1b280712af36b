//! Script execution engine.
//!
//! This crate provides:
//! - Wrapping of raw snippets into complete programs
//! - Compilation to in-memory modules via rustc
//! - Isolated execution, in-process or in a subordinate host process
//! - Streaming of structured output over typed channels
//! - A per-script state machine enforcing single-flight runs and cancellation

pub mod compile;
pub mod config;
pub mod environment;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod output;
pub mod paths;
pub mod script;
pub mod session;
pub mod wrap;

pub use compile::{CompilationInput, CompilationResult, CompilerService, Diagnostic, Severity};
pub use config::{EngineConfig, HostConfig, HostKind, OutputConfig};
pub use environment::{EnvironmentCommand, EnvironmentEvent, ScriptEnvironment, Status};
pub use error::{Error, Result, WrapError};
pub use execute::{CancelHandle, ExecutionHost, ModuleRegistry, RunResult};
pub use output::{OutputChannel, OutputEvent, OutputHub, OutputPayload, OutputSubscription};
pub use paths::EngineDirs;
pub use script::{Edition, Reference, RunId, RunOptions, Script, ScriptConfig, ScriptId, ScriptKind};
pub use session::Session;
pub use wrap::{WrappedProgram, wrap};
