//! Runtime support linked into every compiled script.
//!
//! Scripts never talk to the engine directly. The generated bootstrap hands
//! `run_entry` a table of C-ABI callbacks, and everything a script writes
//! (`dump`, console macros, html fragments) goes through that table while the
//! entry point is active. Writes made after the run has finished are dropped.
//!
//! The same source is compiled twice: once by cargo so the engine shares the
//! ABI types below, and once by the compiler service into an rlib that every
//! script module links against.

use std::any::{Any, type_name};
use std::ffi::c_void;
use std::fmt::Debug;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, RwLock};
use std::thread::{self, ThreadId};

/// Version of the callback table layout.
pub const ABI_VERSION: u32 = 2;

/// Symbol exported by every compiled script module.
pub const ENTRY_SYMBOL: &[u8] = b"scriptpad_entry\0";

/// Status codes returned by the entry point.
pub mod status {
    pub const SUCCESS: i32 = 0;
    /// User code returned an error.
    pub const SCRIPT_ERROR: i32 = -2;
    /// User code panicked.
    pub const PANIC: i32 = -4;
    /// User code observed cancellation and unwound.
    pub const CANCELLED: i32 = -5;
    /// Host and module disagree on the callback table layout.
    pub const ABI_MISMATCH: i32 = -6;
}

/// Well-known output channels.
pub mod channel {
    pub const RESULTS: u32 = 0;
    pub const LOG: u32 = 1;
}

/// Payload kinds carried by [`RawOutput`].
pub mod kind {
    pub const VALUE: u32 = 0;
    pub const TEXT: u32 = 1;
    pub const HTML: u32 = 2;
}

/// Borrowed UTF-8 string passed across the module boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawStr {
    pub ptr: *const u8,
    pub len: usize,
}

impl RawStr {
    pub const EMPTY: RawStr = RawStr {
        ptr: std::ptr::null(),
        len: 0,
    };

    pub fn new(text: &str) -> Self {
        Self {
            ptr: text.as_ptr(),
            len: text.len(),
        }
    }

    /// Copy the string out, replacing invalid UTF-8.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or point to `len` readable bytes.
    pub unsafe fn to_string_lossy(&self) -> String {
        if self.ptr.is_null() || self.len == 0 {
            return String::new();
        }
        let bytes = unsafe { std::slice::from_raw_parts(self.ptr, self.len) };
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// One write from user code.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawOutput {
    pub channel: u32,
    pub kind: u32,
    pub title: RawStr,
    pub type_name: RawStr,
    pub body: RawStr,
}

pub type WriteFn = unsafe extern "C" fn(context: *mut c_void, output: *const RawOutput) -> i32;
pub type ReportErrorFn = unsafe extern "C" fn(context: *mut c_void, message: RawStr);
pub type FlagFn = unsafe extern "C" fn(context: *mut c_void) -> i32;
pub type NotifyFn = unsafe extern "C" fn(context: *mut c_void);
/// Receives the line for a pending [`ReadLineFn`] call.
pub type AcceptLineFn = unsafe extern "C" fn(receiver: *mut c_void, line: RawStr);
/// Block until the user supplies a line. Returns 0 after calling `accept`
/// exactly once, or non-zero when no input is coming.
pub type ReadLineFn = unsafe extern "C" fn(
    context: *mut c_void,
    prompt: RawStr,
    receiver: *mut c_void,
    accept: AcceptLineFn,
) -> i32;

/// Callback table the host passes to the entry point.
#[repr(C)]
pub struct HostCallbacks {
    pub abi_version: u32,
    pub context: *mut c_void,
    pub write: WriteFn,
    pub report_error: ReportErrorFn,
    pub is_cancelled: FlagFn,
    pub request_restart: NotifyFn,
    pub read_line: ReadLineFn,
}

/// Signature of the exported entry point.
pub type EntryFn = unsafe extern "C" fn(host: *const HostCallbacks) -> i32;

struct HostRef(*const HostCallbacks);

// SAFETY: the table is only dereferenced while `run_entry` holds it installed,
// and the host keeps it alive and thread-safe for that whole window.
unsafe impl Send for HostRef {}
unsafe impl Sync for HostRef {}

static HOST: RwLock<Option<HostRef>> = RwLock::new(None);
static ENTRY_THREAD: Mutex<Option<ThreadId>> = Mutex::new(None);
static LAST_PANIC: Mutex<Option<String>> = Mutex::new(None);

fn with_host<R>(f: impl FnOnce(&HostCallbacks) -> R) -> Option<R> {
    let guard = HOST.read().unwrap_or_else(|e| e.into_inner());
    let host = guard.as_ref()?;
    // SAFETY: see `HostRef`.
    Some(f(unsafe { &*host.0 }))
}

fn set_host(host: Option<HostRef>) {
    *HOST.write().unwrap_or_else(|e| e.into_inner()) = host;
}

fn emit(channel: u32, kind: u32, title: &str, type_name: &str, body: &str) -> bool {
    with_host(|host| {
        let raw = RawOutput {
            channel,
            kind,
            title: RawStr::new(title),
            type_name: RawStr::new(type_name),
            body: RawStr::new(body),
        };
        unsafe { (host.write)(host.context, &raw) == 0 }
    })
    .unwrap_or(false)
}

/// Write a value to the results channel.
pub fn dump<T: Debug + ?Sized>(value: &T) {
    emit(
        channel::RESULTS,
        kind::VALUE,
        "",
        type_name::<T>(),
        &format!("{:#?}", value),
    );
}

/// Write a value to the results channel under a title.
pub fn dump_titled<T: Debug + ?Sized>(value: &T, title: &str) {
    emit(
        channel::RESULTS,
        kind::VALUE,
        title,
        type_name::<T>(),
        &format!("{:#?}", value),
    );
}

/// Write a pre-rendered HTML fragment to the results channel.
pub fn dump_html(fragment: &str) {
    emit(channel::RESULTS, kind::HTML, "", "", fragment);
}

/// Chainable dumping for any `Debug` value.
pub trait Dump: Debug + Sized {
    fn dump(self) -> Self {
        dump(&self);
        self
    }

    fn dump_titled(self, title: &str) -> Self {
        dump_titled(&self, title);
        self
    }
}

impl<T: Debug> Dump for T {}

/// Console text. The injected `println!` family lands here.
pub mod console {
    use std::ffi::c_void;

    use super::{RawStr, channel, emit, kind, with_host};

    pub fn write(text: &str) {
        emit(channel::LOG, kind::TEXT, "", "", text);
    }

    pub fn write_line(text: &str) {
        emit(channel::LOG, kind::TEXT, "", "", &format!("{}\n", text));
    }

    pub fn write_error(text: &str) {
        emit(channel::LOG, kind::TEXT, "stderr", "", text);
    }

    pub fn write_error_line(text: &str) {
        emit(channel::LOG, kind::TEXT, "stderr", "", &format!("{}\n", text));
    }

    /// Ask the user for a line of input.
    ///
    /// Blocks until the host answers. `None` once the run is cancelled or
    /// when nothing is attached to answer.
    pub fn read_line() -> Option<String> {
        prompt("")
    }

    /// [`read_line`] with a prompt shown to the user.
    pub fn prompt(message: &str) -> Option<String> {
        unsafe extern "C" fn accept(receiver: *mut c_void, line: RawStr) {
            let slot = unsafe { &mut *(receiver as *mut Option<String>) };
            *slot = Some(unsafe { line.to_string_lossy() });
        }

        let mut line: Option<String> = None;
        let receiver = &mut line as *mut Option<String> as *mut c_void;
        let code = with_host(|host| unsafe {
            (host.read_line)(host.context, RawStr::new(message), receiver, accept)
        })?;
        if code == 0 { line } else { None }
    }
}

/// Panic payload used to unwind out of a cancelled script.
#[derive(Debug)]
pub struct Cancelled;

/// Whether the host asked this run to stop.
pub fn is_cancelled() -> bool {
    with_host(|host| unsafe { (host.is_cancelled)(host.context) != 0 }).unwrap_or(false)
}

/// Unwind out of the script if the host asked it to stop.
pub fn check_cancelled() {
    if is_cancelled() {
        panic::resume_unwind(Box::new(Cancelled));
    }
}

/// Ask the host to start a fresh process before the next run.
pub fn restart_host_on_next_run() {
    with_host(|host| unsafe { (host.request_restart)(host.context) });
}

/// Everything a script usually wants in scope.
pub mod prelude {
    pub use crate::{
        Dump, check_cancelled, console, dump, dump_html, dump_titled, is_cancelled,
        restart_host_on_next_run,
    };
}

/// What a script's main function may return.
pub trait ScriptTermination {
    fn into_outcome(self) -> Result<(), String>;
}

impl ScriptTermination for () {
    fn into_outcome(self) -> Result<(), String> {
        Ok(())
    }
}

impl<E: Debug> ScriptTermination for Result<(), E> {
    fn into_outcome(self) -> Result<(), String> {
        self.map_err(|e| format!("{:?}", e))
    }
}

fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

fn report_error(message: &str) {
    with_host(|host| unsafe { (host.report_error)(host.context, RawStr::new(message)) });
}

/// Run a script's main function against the host callback table.
///
/// # Safety
///
/// `host` must be null or point to a table that stays valid, and whose
/// callbacks are safe to call from any thread, until this function returns.
pub unsafe fn run_entry<F, R>(host: *const HostCallbacks, f: F) -> i32
where
    F: FnOnce() -> R,
    R: ScriptTermination,
{
    if host.is_null() || unsafe { (*host).abi_version } != ABI_VERSION {
        return status::ABI_MISMATCH;
    }

    set_host(Some(HostRef(host)));
    *ENTRY_THREAD.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread::current().id());
    *LAST_PANIC.lock().unwrap_or_else(|e| e.into_inner()) = None;

    let previous_hook = panic::take_hook();
    panic::set_hook(Box::new(|info| {
        let message = payload_message(info.payload());
        let text = match info.location() {
            Some(loc) => format!(
                "panicked at {}:{}:{}:\n{}",
                loc.file(),
                loc.line(),
                loc.column(),
                message
            ),
            None => format!("panicked:\n{}", message),
        };
        let entry = *ENTRY_THREAD.lock().unwrap_or_else(|e| e.into_inner());
        if entry == Some(thread::current().id()) {
            *LAST_PANIC.lock().unwrap_or_else(|e| e.into_inner()) = Some(text);
        } else {
            let name = thread::current().name().unwrap_or("<unnamed>").to_string();
            console::write_error_line(&format!("thread '{}' {}", name, text));
        }
    }));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| f().into_outcome()));

    let code = match outcome {
        Ok(Ok(())) => status::SUCCESS,
        Ok(Err(message)) => {
            report_error(&format!("Error: {}", message));
            status::SCRIPT_ERROR
        }
        Err(payload) if payload.is::<Cancelled>() => status::CANCELLED,
        Err(payload) => {
            let message = LAST_PANIC
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
                .unwrap_or_else(|| payload_message(payload.as_ref()));
            report_error(&message);
            status::PANIC
        }
    };

    drop(panic::take_hook());
    panic::set_hook(previous_hook);
    *ENTRY_THREAD.lock().unwrap_or_else(|e| e.into_inner()) = None;
    set_host(None);

    code
}
