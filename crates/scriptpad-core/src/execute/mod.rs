//! Execution hosts for compiled modules.
//!
//! Two interchangeable strategies share one contract (`load`, `run`,
//! `unload`) through [`ExecutionHost`]:
//!
//! - **In-process** - the module is opened in a disposable [`ModuleArena`]
//!   and runs on a dedicated thread. Unloading closes the library and deletes
//!   the arena, so resident modules never accumulate across runs.
//! - **Out-of-process** - the module runs in a `scriptpad-host` child. Output
//!   streams back over IPC, and a run that ignores cancellation is ended by
//!   killing the child.
//!
//! # Architecture
//!
//! ```text
//! CompiledModule
//!     │
//!     ├── InProcessHost
//!     │       └── ModuleArena (libloading, unique file per load)
//!     │               └── runner thread → scriptpad_entry(&HostCallbacks)
//!     │                       └── PipelineSink → OutputPipeline
//!     │
//!     └── OutOfProcessHost
//!             └── HostProcess (scriptpad-host --parent <pid>)
//!                     ├── RunScript ──►
//!                     ◄── Output* ──── OutputPipeline
//!                     ◄── InputRequested / ProvideInput ──►
//!                     ◄── RunComplete
//! ```

mod arena;
mod context;
mod ffi;
mod host;
mod in_process;
mod input;
mod out_of_process;
mod result;

pub use arena::{ModuleArena, ModuleOutcome, ModuleRegistry, error_event};
pub use context::{CancelHandle, RunContext};
pub use ffi::{ExecutionStatus, OutputSink};
pub use host::{ExecutionHost, ModuleHandle};
pub use in_process::InProcessHost;
pub use input::{InputAnnouncer, InputBroker};
pub use out_of_process::{LifetimeCallback, OutOfProcessHost};
pub use result::RunResult;
