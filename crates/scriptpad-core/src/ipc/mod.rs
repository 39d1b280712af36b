//! Inter-process communication with `scriptpad-host` processes.

mod process;
pub mod protocol;

pub use process::{HostProcess, ScriptHostPool, find_host_binary};
pub use protocol::{HostCommand, HostMessage, RunRequest};
