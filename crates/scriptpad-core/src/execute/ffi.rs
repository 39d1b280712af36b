//! The host side of the script callback table.
//!
//! A module calls back through `HostCallbacks` while it runs. The
//! trampolines here decode those calls into typed payloads and hand them to
//! an [`OutputSink`].

use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use scriptpad_runtime::{ABI_VERSION, AcceptLineFn, HostCallbacks, RawOutput, RawStr, kind};

use crate::output::{OutputChannel, OutputPayload};

/// Result code from a module's entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExecutionStatus {
    Success = 0,
    /// The script returned an error.
    ScriptError = -2,
    /// The script panicked.
    Panic = -4,
    /// The script stopped in response to cancellation.
    Cancelled = -5,
    /// The module was built against a different runtime ABI.
    AbiMismatch = -6,
}

impl From<i32> for ExecutionStatus {
    fn from(code: i32) -> Self {
        use scriptpad_runtime::status;
        match code {
            status::SUCCESS => Self::Success,
            status::PANIC => Self::Panic,
            status::CANCELLED => Self::Cancelled,
            status::ABI_MISMATCH => Self::AbiMismatch,
            _ => Self::ScriptError,
        }
    }
}

/// Where a running module's output goes.
///
/// Called from the module's own threads, never from an async context.
pub trait OutputSink: Send + Sync {
    fn write(&self, channel: OutputChannel, payload: OutputPayload);

    fn is_cancelled(&self) -> bool;

    /// The script asked for a fresh host before the next run.
    fn request_restart(&self) {}

    /// Block until the user supplies a line. `None` when no input is coming.
    fn read_line(&self, _prompt: &str) -> Option<String> {
        None
    }
}

/// State behind the `context` pointer of one callback table.
pub(crate) struct CallbackContext {
    sink: Arc<dyn OutputSink>,
    error: Mutex<Option<String>>,
    restart_requested: AtomicBool,
}

impl CallbackContext {
    pub(crate) fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            error: Mutex::new(None),
            restart_requested: AtomicBool::new(false),
        }
    }

    /// Build a table pointing at `self`. `self` must outlive every call.
    pub(crate) fn callbacks(&self) -> HostCallbacks {
        HostCallbacks {
            abi_version: ABI_VERSION,
            context: self as *const Self as *mut c_void,
            write: write_trampoline,
            report_error: report_error_trampoline,
            is_cancelled: is_cancelled_trampoline,
            request_restart: request_restart_trampoline,
            read_line: read_line_trampoline,
        }
    }

    pub(crate) fn take_error(&self) -> Option<String> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub(crate) fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::Acquire)
    }
}

/// Decode a raw record. `None` for unknown kinds.
///
/// # Safety
/// The strings in `raw` must be valid for the duration of the call.
pub(crate) unsafe fn decode_output(raw: &RawOutput) -> Option<(OutputChannel, OutputPayload)> {
    let title = unsafe { raw.title.to_string_lossy() };
    let body = unsafe { raw.body.to_string_lossy() };
    let payload = match raw.kind {
        kind::VALUE => OutputPayload::Value {
            type_name: unsafe { raw.type_name.to_string_lossy() },
            title: (!title.is_empty()).then_some(title),
            debug: body,
        },
        kind::TEXT => OutputPayload::Text {
            text: body,
            stderr: title == "stderr",
        },
        kind::HTML => OutputPayload::Html { fragment: body },
        _ => return None,
    };
    Some((OutputChannel(raw.channel), payload))
}

unsafe fn context<'a>(ptr: *mut c_void) -> Option<&'a CallbackContext> {
    unsafe { (ptr as *const CallbackContext).as_ref() }
}

unsafe extern "C" fn write_trampoline(ctx: *mut c_void, output: *const RawOutput) -> i32 {
    let (Some(ctx), Some(output)) = (unsafe { context(ctx) }, unsafe { output.as_ref() }) else {
        return -1;
    };
    let Some((channel, payload)) = (unsafe { decode_output(output) }) else {
        return -1;
    };
    match panic::catch_unwind(AssertUnwindSafe(|| ctx.sink.write(channel, payload))) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

unsafe extern "C" fn report_error_trampoline(ctx: *mut c_void, message: RawStr) {
    if let Some(ctx) = unsafe { context(ctx) } {
        let message = unsafe { message.to_string_lossy() };
        *ctx.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message);
    }
}

unsafe extern "C" fn is_cancelled_trampoline(ctx: *mut c_void) -> i32 {
    match unsafe { context(ctx) } {
        Some(ctx) => {
            panic::catch_unwind(AssertUnwindSafe(|| ctx.sink.is_cancelled())).unwrap_or(true) as i32
        }
        None => 0,
    }
}

unsafe extern "C" fn request_restart_trampoline(ctx: *mut c_void) {
    if let Some(ctx) = unsafe { context(ctx) } {
        ctx.restart_requested.store(true, Ordering::Release);
        let _ = panic::catch_unwind(AssertUnwindSafe(|| ctx.sink.request_restart()));
    }
}

unsafe extern "C" fn read_line_trampoline(
    ctx: *mut c_void,
    prompt: RawStr,
    receiver: *mut c_void,
    accept: AcceptLineFn,
) -> i32 {
    let Some(ctx) = (unsafe { context(ctx) }) else {
        return -1;
    };
    let prompt = unsafe { prompt.to_string_lossy() };
    match panic::catch_unwind(AssertUnwindSafe(|| ctx.sink.read_line(&prompt))) {
        Ok(Some(line)) => {
            unsafe { accept(receiver, RawStr::new(&line)) };
            0
        }
        _ => -1,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Sink that records everything in memory.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub events: Mutex<Vec<(OutputChannel, OutputPayload)>>,
        pub cancelled: AtomicBool,
        pub restart: AtomicBool,
        pub input: Mutex<Vec<String>>,
    }

    impl OutputSink for MemorySink {
        fn write(&self, channel: OutputChannel, payload: OutputPayload) {
            self.events.lock().unwrap().push((channel, payload));
        }

        fn is_cancelled(&self) -> bool {
            self.cancelled.load(Ordering::SeqCst)
        }

        fn request_restart(&self) {
            self.restart.store(true, Ordering::SeqCst);
        }

        fn read_line(&self, _prompt: &str) -> Option<String> {
            self.input.lock().unwrap().pop()
        }
    }

    #[test]
    fn test_execution_status_from_i32() {
        assert_eq!(ExecutionStatus::from(0), ExecutionStatus::Success);
        assert_eq!(ExecutionStatus::from(-2), ExecutionStatus::ScriptError);
        assert_eq!(ExecutionStatus::from(-4), ExecutionStatus::Panic);
        assert_eq!(ExecutionStatus::from(-5), ExecutionStatus::Cancelled);
        assert_eq!(ExecutionStatus::from(-6), ExecutionStatus::AbiMismatch);
        assert_eq!(ExecutionStatus::from(-99), ExecutionStatus::ScriptError);
    }

    #[test]
    fn test_trampolines_reach_sink() {
        let sink = Arc::new(MemorySink::default());
        let ctx = CallbackContext::new(sink.clone());
        let table = ctx.callbacks();

        let raw = RawOutput {
            channel: scriptpad_runtime::channel::RESULTS,
            kind: kind::VALUE,
            title: RawStr::new("answer"),
            type_name: RawStr::new("i32"),
            body: RawStr::new("42"),
        };
        assert_eq!(unsafe { (table.write)(table.context, &raw) }, 0);

        let text = RawOutput {
            channel: scriptpad_runtime::channel::LOG,
            kind: kind::TEXT,
            title: RawStr::new("stderr"),
            type_name: RawStr::EMPTY,
            body: RawStr::new("oops\n"),
        };
        assert_eq!(unsafe { (table.write)(table.context, &text) }, 0);

        let unknown = RawOutput { kind: 99, ..text };
        assert_eq!(unsafe { (table.write)(table.context, &unknown) }, -1);

        let events = sink.events.lock().unwrap();
        assert_eq!(
            events[0],
            (
                OutputChannel::RESULTS,
                OutputPayload::Value {
                    type_name: "i32".to_string(),
                    title: Some("answer".to_string()),
                    debug: "42".to_string(),
                }
            )
        );
        assert_eq!(
            events[1].1,
            OutputPayload::Text {
                text: "oops\n".to_string(),
                stderr: true
            }
        );
    }

    #[test]
    fn test_flags_and_error_slot() {
        let sink = Arc::new(MemorySink::default());
        let ctx = CallbackContext::new(sink.clone());
        let table = ctx.callbacks();

        assert_eq!(unsafe { (table.is_cancelled)(table.context) }, 0);
        sink.cancelled.store(true, Ordering::SeqCst);
        assert_eq!(unsafe { (table.is_cancelled)(table.context) }, 1);

        unsafe { (table.request_restart)(table.context) };
        assert!(ctx.restart_requested());
        assert!(sink.restart.load(Ordering::SeqCst));

        unsafe { (table.report_error)(table.context, RawStr::new("Error: bad")) };
        assert_eq!(ctx.take_error().as_deref(), Some("Error: bad"));
        assert_eq!(ctx.take_error(), None);
    }

    unsafe extern "C" fn store_line(receiver: *mut c_void, line: RawStr) {
        let slot = unsafe { &mut *(receiver as *mut Option<String>) };
        *slot = Some(unsafe { line.to_string_lossy() });
    }

    #[test]
    fn test_read_line_answers_from_sink() {
        let sink = Arc::new(MemorySink::default());
        sink.input.lock().unwrap().push("42".to_string());
        let ctx = CallbackContext::new(sink.clone());
        let table = ctx.callbacks();

        let mut line: Option<String> = None;
        let receiver = &mut line as *mut Option<String> as *mut c_void;
        let code = unsafe { (table.read_line)(table.context, RawStr::new("? "), receiver, store_line) };
        assert_eq!(code, 0);
        assert_eq!(line.as_deref(), Some("42"));

        let mut missing: Option<String> = None;
        let receiver = &mut missing as *mut Option<String> as *mut c_void;
        let code = unsafe { (table.read_line)(table.context, RawStr::EMPTY, receiver, store_line) };
        assert_eq!(code, -1);
        assert_eq!(missing, None);
    }
}
