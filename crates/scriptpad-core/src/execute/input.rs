//! Interactive input for running scripts.
//!
//! A script thread blocked in `console::read_line` waits on the
//! [`InputBroker`] until the UI supplies a line, the run is cancelled, or the
//! broker is detached. Out-of-process runs attach a forwarding channel
//! instead; the line then travels to the host process over IPC.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

/// Called with the prompt whenever a script starts waiting for input.
pub type InputAnnouncer = Arc<dyn Fn(&str) + Send + Sync>;

const CANCEL_POLL: Duration = Duration::from_millis(25);

#[derive(Default)]
struct Slot {
    waiting: bool,
    answer: Option<String>,
    remote: Option<mpsc::UnboundedSender<String>>,
}

/// Matches input requests from a script with lines from the user.
#[derive(Default)]
pub struct InputBroker {
    slot: Mutex<Slot>,
    answered: Condvar,
    announcer: Mutex<Option<InputAnnouncer>>,
}

impl InputBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_announcer(&self, announcer: InputAnnouncer) {
        *self.announcer.lock().unwrap_or_else(|e| e.into_inner()) = Some(announcer);
    }

    /// Whether a script is blocked waiting for a line.
    pub fn is_waiting(&self) -> bool {
        self.lock().waiting
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn announce(&self, prompt: &str) {
        let announcer = self.announcer.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(announcer) = announcer {
            announcer(prompt);
        }
    }

    /// Block the calling thread until a line arrives.
    ///
    /// Returns `None` once `is_cancelled` reports true or the broker is
    /// detached.
    pub fn read_line(&self, prompt: &str, is_cancelled: impl Fn() -> bool) -> Option<String> {
        {
            let mut slot = self.lock();
            slot.waiting = true;
            slot.answer = None;
        }
        self.announce(prompt);

        let mut slot = self.lock();
        loop {
            if let Some(line) = slot.answer.take() {
                slot.waiting = false;
                return Some(line);
            }
            if !slot.waiting || is_cancelled() {
                slot.waiting = false;
                return None;
            }
            slot = self
                .answered
                .wait_timeout(slot, CANCEL_POLL)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Forward lines to a remote reader until [`detach`](Self::detach).
    pub fn attach_remote(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self.lock();
        slot.remote = Some(tx);
        slot.waiting = false;
        slot.answer = None;
        rx
    }

    /// A remote reader is waiting for a line.
    pub fn request_remote(&self, prompt: &str) {
        self.lock().waiting = true;
        self.announce(prompt);
    }

    /// Hand a line to the waiting reader. Returns `false` if nobody waits.
    pub fn provide(&self, line: String) -> bool {
        let mut guard = self.lock();
        let slot = &mut *guard;
        if !slot.waiting || slot.answer.is_some() {
            return false;
        }
        if let Some(remote) = &slot.remote {
            slot.waiting = false;
            return remote.send(line).is_ok();
        }
        slot.answer = Some(line);
        self.answered.notify_all();
        true
    }

    /// End any pending wait and drop the remote channel.
    pub fn detach(&self) {
        let mut slot = self.lock();
        slot.waiting = false;
        slot.answer = None;
        slot.remote = None;
        self.answered.notify_all();
    }
}

impl std::fmt::Debug for InputBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputBroker")
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition never held");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_line_reaches_reader() {
        let broker = Arc::new(InputBroker::new());
        let prompts = Arc::new(Mutex::new(Vec::new()));
        {
            let prompts = prompts.clone();
            broker.set_announcer(Arc::new(move |p: &str| prompts.lock().unwrap().push(p.to_string())));
        }
        assert!(!broker.provide("too early".to_string()));

        let reader = {
            let broker = broker.clone();
            thread::spawn(move || broker.read_line("name? ", || false))
        };
        wait_until(|| broker.is_waiting());

        assert!(broker.provide("Ada".to_string()));
        assert_eq!(reader.join().unwrap().as_deref(), Some("Ada"));
        assert_eq!(*prompts.lock().unwrap(), vec!["name? "]);
        assert!(!broker.is_waiting());
    }

    #[test]
    fn test_cancel_ends_wait() {
        let broker = Arc::new(InputBroker::new());
        let cancelled = Arc::new(AtomicBool::new(false));
        let reader = {
            let broker = broker.clone();
            let cancelled = cancelled.clone();
            thread::spawn(move || broker.read_line("", || cancelled.load(Ordering::SeqCst)))
        };
        wait_until(|| broker.is_waiting());

        cancelled.store(true, Ordering::SeqCst);
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn test_detach_ends_wait() {
        let broker = Arc::new(InputBroker::new());
        let reader = {
            let broker = broker.clone();
            thread::spawn(move || broker.read_line("", || false))
        };
        wait_until(|| broker.is_waiting());

        broker.detach();
        assert_eq!(reader.join().unwrap(), None);
        assert!(!broker.provide("late".to_string()));
    }

    #[tokio::test]
    async fn test_remote_forwards_one_line_per_request() {
        let broker = InputBroker::new();
        let mut rx = broker.attach_remote();

        assert!(!broker.provide("unrequested".to_string()));
        broker.request_remote("> ");
        assert!(broker.provide("first".to_string()));
        assert!(!broker.provide("second".to_string()));

        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        broker.detach();
        assert_eq!(rx.recv().await, None);
    }
}
