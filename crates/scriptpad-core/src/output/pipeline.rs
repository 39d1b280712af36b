//! Per-run output pipelines and the hub that feeds subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};

use super::event::{OutputChannel, OutputEvent, OutputPayload, now_ms};
use crate::config::OutputConfig;
use crate::script::RunId;

/// Subscriber registry for one environment.
///
/// Cloning is cheap and shares the same subscribers.
#[derive(Clone)]
pub struct OutputHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: OutputConfig,
    subscribers: Mutex<Vec<Subscriber>>,
    current: Mutex<Option<Arc<OutputPipeline>>>,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl HubInner {
    fn live_subscribers(&self) -> Vec<Subscriber> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.tx.is_closed());
        subscribers.clone()
    }
}

/// One subscriber queue plus the count of events it missed and has not
/// yet been warned about.
///
/// A subscriber that let a send time out is lagging: later writes skip it
/// without waiting until its queue is empty again.
#[derive(Clone)]
struct Subscriber {
    tx: mpsc::Sender<OutputEvent>,
    unreported: Arc<AtomicU64>,
    lagging: Arc<AtomicBool>,
}

impl Subscriber {
    fn new(tx: mpsc::Sender<OutputEvent>) -> Self {
        Self {
            tx,
            unreported: Arc::new(AtomicU64::new(0)),
            lagging: Arc::new(AtomicBool::new(false)),
        }
    }

    fn is_lagging(&self) -> bool {
        if !self.lagging.load(Ordering::Acquire) {
            return false;
        }
        if self.tx.capacity() == self.tx.max_capacity() {
            self.lagging.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Deliver `event`, handing it back if it had to be dropped.
    async fn deliver(
        &self,
        event: OutputEvent,
        lagging: bool,
        timeout: Duration,
    ) -> Option<OutputEvent> {
        if lagging {
            return match self.tx.try_send(event) {
                Err(TrySendError::Full(dropped)) => Some(dropped),
                _ => None,
            };
        }
        match self.tx.send_timeout(event, timeout).await {
            Err(SendTimeoutError::Timeout(dropped)) => {
                self.lagging.store(true, Ordering::Release);
                Some(dropped)
            }
            _ => None,
        }
    }
}

impl OutputHub {
    pub fn new(config: OutputConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                subscribers: Mutex::new(Vec::new()),
                current: Mutex::new(None),
                dropped: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Add a subscriber. It sees events from writes made after this call.
    pub fn subscribe(&self) -> OutputSubscription {
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_capacity.max(1));
        if !self.inner.closed.load(Ordering::Acquire) {
            self.inner
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Subscriber::new(tx));
        }
        OutputSubscription { receiver: rx }
    }

    /// Start the pipeline for a new run, retiring the previous one.
    pub fn begin_run(&self, run_id: RunId) -> Arc<OutputPipeline> {
        let pipeline = Arc::new(OutputPipeline {
            run_id,
            hub: Arc::downgrade(&self.inner),
            counters: tokio::sync::Mutex::new(FxHashMap::default()),
            closed: AtomicBool::new(false),
            runtime: Handle::try_current().ok(),
        });

        let previous = self
            .inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(pipeline.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        pipeline
    }

    /// The pipeline of the run currently in progress, if any.
    pub fn current_run(&self) -> Option<Arc<OutputPipeline>> {
        self.inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .filter(|p| !p.is_closed())
    }

    /// Close the current pipeline and every subscriber queue.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        if let Some(current) = self
            .inner
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            current.close();
        }
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Events dropped because a subscriber stayed full past the send timeout.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.live_subscribers().len()
    }
}

impl std::fmt::Debug for OutputHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputHub")
            .field("subscribers", &self.subscriber_count())
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

/// Output writer for exactly one run.
///
/// Writes after [`close`](Self::close) are discarded, which is how events
/// from a superseded run are kept out of the next run's stream.
pub struct OutputPipeline {
    run_id: RunId,
    hub: Weak<HubInner>,
    counters: tokio::sync::Mutex<FxHashMap<OutputChannel, u64>>,
    closed: AtomicBool,
    runtime: Option<Handle>,
}

impl OutputPipeline {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Publish `payload` on `channel`.
    ///
    /// Returns the assigned sequence number, or `None` if the pipeline is
    /// closed. The counter lock is held through delivery so events on one
    /// channel reach each subscriber in sequence order.
    pub async fn write(&self, channel: OutputChannel, payload: OutputPayload) -> Option<u64> {
        let mut counters = self.counters.lock().await;
        if self.is_closed() {
            tracing::trace!("Discarding write to closed pipeline for run {}", self.run_id);
            return None;
        }
        let hub = self.hub.upgrade()?;

        let subscribers = hub.live_subscribers();
        let lagging: Vec<bool> = subscribers.iter().map(Subscriber::is_lagging).collect();
        for subscriber in &subscribers {
            self.flush_warning(&mut counters, subscriber);
        }

        let sequence = next_sequence(&mut counters, channel);
        let event = OutputEvent {
            run_id: self.run_id,
            channel,
            sequence,
            payload,
            timestamp_ms: now_ms(),
        };

        let timeout = hub.config.send_timeout();
        let results = join_all(
            subscribers
                .iter()
                .zip(&lagging)
                .map(|(s, &lagging)| s.deliver(event.clone(), lagging, timeout)),
        )
        .await;

        for ((subscriber, was_lagging), dropped) in subscribers.iter().zip(lagging).zip(results) {
            let Some(dropped) = dropped else {
                continue;
            };
            hub.dropped.fetch_add(1, Ordering::Relaxed);
            subscriber.unreported.fetch_add(1, Ordering::Relaxed);
            if was_lagging {
                tracing::trace!(
                    "Subscriber still lagging; dropped {} event #{}",
                    dropped.channel,
                    dropped.sequence
                );
            } else {
                tracing::warn!(
                    "Subscriber full for {:?}; dropped {} event #{}",
                    timeout,
                    dropped.channel,
                    dropped.sequence
                );
            }
            self.flush_warning(&mut counters, subscriber);
        }

        Some(sequence)
    }

    /// Tell a subscriber about events it missed, if its queue has room.
    fn flush_warning(&self, counters: &mut FxHashMap<OutputChannel, u64>, subscriber: &Subscriber) {
        let missed = subscriber.unreported.load(Ordering::Relaxed);
        if missed == 0 {
            return;
        }
        let Ok(permit) = subscriber.tx.try_reserve() else {
            return;
        };
        subscriber.unreported.fetch_sub(missed, Ordering::Relaxed);
        permit.send(OutputEvent {
            run_id: self.run_id,
            channel: OutputChannel::LOG,
            sequence: next_sequence(counters, OutputChannel::LOG),
            payload: OutputPayload::warning(format!(
                "{} output event(s) dropped: subscriber did not keep up",
                missed
            )),
            timestamp_ms: now_ms(),
        });
    }

    /// [`write`](Self::write) for threads outside the async runtime.
    ///
    /// Must not be called from a runtime worker thread.
    pub fn write_blocking(&self, channel: OutputChannel, payload: OutputPayload) -> Option<u64> {
        match &self.runtime {
            Some(handle) => handle.block_on(self.write(channel, payload)),
            None => futures::executor::block_on(self.write(channel, payload)),
        }
    }
}

impl std::fmt::Debug for OutputPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPipeline")
            .field("run_id", &self.run_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn next_sequence(counters: &mut FxHashMap<OutputChannel, u64>, channel: OutputChannel) -> u64 {
    let counter = counters.entry(channel).or_insert(0);
    *counter += 1;
    *counter
}

/// Receiving end of one subscriber queue.
#[derive(Debug)]
pub struct OutputSubscription {
    receiver: mpsc::Receiver<OutputEvent>,
}

impl OutputSubscription {
    /// Next event, or `None` once the hub is closed and the queue drained.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutputEvent> {
        self.receiver.try_recv().ok()
    }

    /// Everything currently queued.
    pub fn drain(&mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_recv() {
            events.push(event);
        }
        events
    }
}
