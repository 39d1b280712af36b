//! Per-run context and cooperative cancellation.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

use super::input::InputBroker;
use crate::output::OutputPipeline;
use crate::script::{RunId, ScriptId};

/// Handle for cooperative cancellation of a run.
///
/// Clones share one flag. Scripts observe it through
/// `scriptpad_runtime::is_cancelled`; hosts await [`cancelled`](Self::cancelled)
/// to start the grace period.
///
/// ```
/// use scriptpad_core::execute::CancelHandle;
///
/// let handle = CancelHandle::new();
/// let clone = handle.clone();
/// assert!(!handle.is_cancelled());
///
/// clone.cancel();
/// assert!(handle.is_cancelled());
/// ```
#[derive(Clone, Default, Debug)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default, Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Request cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self) -> bool {
        let first = !self.inner.cancelled.swap(true, Ordering::AcqRel);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Everything a host needs to run one module, besides the module itself.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub script_id: ScriptId,
    pub script_name: String,
    pub script_path: Option<PathBuf>,
    pub is_dirty: bool,
    /// Directories whose dylibs are loaded ahead of the module.
    pub probing_paths: Vec<PathBuf>,
    /// Fingerprint of the settings a running host depends on; a change
    /// forces a fresh out-of-process host.
    pub host_fingerprint: u64,
    pub cancel: CancelHandle,
    pub output: Arc<OutputPipeline>,
    pub input: Arc<InputBroker>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = CancelHandle::new();
        assert!(handle.cancel());
        assert!(!handle.cancel());
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let handle = CancelHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_after_the_fact() {
        let handle = CancelHandle::new();
        handle.cancel();
        tokio::time::timeout(Duration::from_millis(100), handle.cancelled())
            .await
            .expect("already cancelled");
    }
}
