//! Batch publisher: queue, background loop and lifecycle
//!
//! `publish` serializes an event and pushes it onto the queue without ever
//! touching the network. A single background task, spawned by `start` and
//! joined by `stop`, repeatedly collects a batch and flushes it:
//!
//! 1. Take up to `max_batch_size` events (and at most `max_batch_bytes`),
//!    waiting up to `linger_ms` for each one. The first timeout closes the
//!    batch, so a lone event waits at most one linger window.
//! 2. An empty batch loops straight back to collecting.
//! 3. Every member of a non-empty batch is sent concurrently and the
//!    acknowledgements are awaited together.
//! 4. A failed send is re-enqueued while it has retry budget and the queue
//!    has room, otherwise it is logged as lost and handed to the dead
//!    letter handler, if any.
//!
//! Ordering: the queue is FIFO, but batch members are sent concurrently, so
//! the broker may observe events in any order, even two events from the
//! same request. Callers must not rely on delivery order.

use crate::batch::Batcher;
use crate::broker::BrokerClient;
use crate::config::PublisherConfig;
use crate::dlq::{DeadLetter, DeadLetterHandler};
use crate::error::{ActionLogError, Result};
use crate::queue::EventQueue;
use crate::types::{ActionEvent, Batch, SerializedEvent};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublisherState {
    /// No broker connection; publishes buffer in the queue
    Stopped,
    /// `start` is opening the broker connection
    Connecting,
    /// Batch loop is running
    Running,
    /// `stop` is waiting for the loop to flush and exit
    Draining,
}

impl fmt::Display for PublisherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Connecting => "connecting",
            Self::Running => "running",
            Self::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Publisher events for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublisherEvent {
    /// Broker connected and batch loop spawned
    Started,
    /// One flush finished; `failed` includes sends queued for retry
    BatchFlushed {
        size: usize,
        sent: usize,
        failed: usize,
    },
    /// Loop drained and broker disconnected
    Stopped,
}

/// Snapshot of publisher counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    /// Events stored on the queue by `publish`
    pub enqueued: u64,
    /// Events discarded by the queue overflow policy
    pub dropped: u64,
    /// Sends acknowledged by the broker
    pub sent: u64,
    /// Events given up on after a failed send
    pub failed: u64,
    /// Failed sends put back on the queue
    pub retried: u64,
    /// Non-empty batches flushed
    pub batches: u64,
    /// Events currently waiting in the queue
    pub queued: usize,
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    batches: AtomicU64,
}

/// State shared between the publisher handle and its loop task
struct Shared {
    config: PublisherConfig,
    broker: Arc<dyn BrokerClient>,
    queue: EventQueue,
    counters: Counters,
    events: broadcast::Sender<PublisherEvent>,
    dead_letters: OnceLock<Arc<dyn DeadLetterHandler>>,
}

struct Worker {
    running: Arc<AtomicBool>,
    /// Set when the publisher is dropped without `stop`
    detached: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Batching publisher of action events
///
/// Share it behind an `Arc`; `publish` takes `&self` and is safe to call
/// from any number of request handlers at once.
///
/// Dropping a running publisher without `stop` lets the loop drain and
/// disconnect on its own, but nothing waits for it to finish.
pub struct BatchPublisher {
    shared: Arc<Shared>,
    state: watch::Sender<PublisherState>,
    /// Held across `start`/`stop` so at most one loop exists
    worker: Mutex<Option<Worker>>,
}

impl BatchPublisher {
    /// Create a stopped publisher over `broker`
    pub fn new(config: PublisherConfig, broker: impl BrokerClient + 'static) -> Result<Self> {
        config.validate()?;
        let queue = EventQueue::bounded(config.queue_capacity, config.overflow);
        let (events, _) = broadcast::channel(256);
        let (state, _) = watch::channel(PublisherState::Stopped);

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                broker: Arc::new(broker),
                queue,
                counters: Counters::default(),
                events,
                dead_letters: OnceLock::new(),
            }),
            state,
            worker: Mutex::new(None),
        })
    }

    /// Route events lost after failed sends to `handler`
    ///
    /// Only the first handler attached is kept.
    pub fn with_dead_letters(self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        if self.shared.dead_letters.set(handler).is_err() {
            tracing::warn!("Dead letter handler already set, ignoring replacement");
        }
        self
    }

    /// Serialize `event` and queue it for the next batch
    ///
    /// Never waits on the broker. Works in every state: while stopped the
    /// event simply buffers until `start`. Fails only when the event cannot
    /// be serialized (it is dropped) or the bounded queue rejects it.
    pub fn publish(&self, event: ActionEvent) -> Result<()> {
        let message = event.to_serialized().inspect_err(|e| {
            tracing::warn!(action = %event.action, error = %e, "Dropping action event");
        })?;
        if self.shared.queue.enqueue(message)? {
            self.shared.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Connect to the broker and spawn the batch loop
    ///
    /// Idempotent: a second call while running neither reconnects nor
    /// spawns another loop. On failure the publisher stays stopped and
    /// `start` may be retried.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            tracing::debug!("Publisher already running");
            return Ok(());
        }

        self.state.send_replace(PublisherState::Connecting);
        if let Err(e) = self.shared.broker.connect().await {
            self.state.send_replace(PublisherState::Stopped);
            tracing::warn!(
                broker = self.shared.broker.name(),
                url = %self.shared.config.broker_url,
                error = %e,
                "Broker connection failed"
            );
            return Err(into_connection_error(e));
        }

        let running = Arc::new(AtomicBool::new(true));
        let detached = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(
            self.shared
                .clone()
                .run(running.clone(), detached.clone()),
        );
        *worker = Some(Worker {
            running,
            detached,
            handle,
        });

        self.state.send_replace(PublisherState::Running);
        let _ = self.shared.events.send(PublisherEvent::Started);
        tracing::info!(
            broker = self.shared.broker.name(),
            topic = %self.shared.config.topic,
            linger_ms = self.shared.config.linger_ms,
            max_batch_size = self.shared.config.max_batch_size,
            queued = self.shared.queue.len(),
            "Action log publisher started"
        );
        Ok(())
    }

    /// Stop the loop, flush what it already holds, and disconnect
    ///
    /// Returns once the loop task has exited and the broker is closed; no
    /// send happens after that. Events queued before the call are flushed
    /// during the drain. Events published during or after the drain may
    /// stay queued until the next `start`. A no-op when not running.
    pub async fn stop(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        let Some(Worker {
            running, handle, ..
        }) = worker.take()
        else {
            return Ok(());
        };

        self.state.send_replace(PublisherState::Draining);
        running.store(false, Ordering::Release);

        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Batch loop task failed");
        }

        let disconnected = self.shared.broker.disconnect().await;
        self.state.send_replace(PublisherState::Stopped);
        let _ = self.shared.events.send(PublisherEvent::Stopped);

        let stats = self.stats();
        tracing::info!(
            sent = stats.sent,
            failed = stats.failed,
            queued = stats.queued,
            "Action log publisher stopped"
        );
        disconnected.map_err(into_connection_error)
    }

    /// Current lifecycle state
    pub fn state(&self) -> PublisherState {
        *self.state.borrow()
    }

    /// Observe lifecycle transitions
    pub fn watch_state(&self) -> watch::Receiver<PublisherState> {
        self.state.subscribe()
    }

    /// Subscribe to publisher events
    pub fn subscribe(&self) -> broadcast::Receiver<PublisherEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> PublisherStats {
        let c = &self.shared.counters;
        PublisherStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            dropped: self.shared.queue.dropped(),
            sent: c.sent.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            batches: c.batches.load(Ordering::Relaxed),
            queued: self.shared.queue.len(),
        }
    }

    /// Events waiting in the queue
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.shared.config
    }

    /// Name of the broker backend
    pub fn broker_name(&self) -> &str {
        self.shared.broker.name()
    }
}

impl Drop for BatchPublisher {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.detached.store(true, Ordering::Release);
            worker.running.store(false, Ordering::Release);
        }
    }
}

impl Shared {
    async fn run(self: Arc<Self>, running: Arc<AtomicBool>, detached: Arc<AtomicBool>) {
        let mut batcher = Batcher::new(self.config.max_batch_size, self.config.max_batch_bytes);

        while running.load(Ordering::Acquire) {
            let batch = self.collect(&mut batcher).await;
            if batch.is_empty() {
                continue;
            }
            self.flush(batch).await;
        }

        self.drain(&mut batcher).await;

        // Dropped without `stop`
        if detached.load(Ordering::Acquire) {
            match self.broker.disconnect().await {
                Ok(()) => tracing::info!(
                    broker = self.broker.name(),
                    "Publisher dropped, batch loop drained and disconnected"
                ),
                Err(e) => tracing::warn!(error = %e, "Disconnect after drop failed"),
            }
        }
    }

    /// One collection cycle, bounded by batch size or a single linger timeout
    async fn collect(&self, batcher: &mut Batcher) -> Batch {
        let mut wait = if batcher.is_empty() {
            self.config.first_item_wait()
        } else {
            self.config.linger()
        };

        while !batcher.is_full() {
            match self.queue.dequeue_timeout(wait).await {
                Some(message) => batcher.offer(message),
                None => break,
            }
            wait = self.config.linger();
        }

        batcher.take()
    }

    /// Flush everything that was queued when the drain began
    async fn drain(&self, batcher: &mut Batcher) {
        let mut remaining = self.queue.len();

        loop {
            while remaining > 0 && !batcher.is_full() {
                let Some(message) = self.queue.try_dequeue() else {
                    break;
                };
                remaining -= 1;
                batcher.offer(message);
            }

            let batch = batcher.take();
            if batch.is_empty() {
                break;
            }
            self.flush(batch).await;
        }
    }

    async fn flush(&self, batch: Batch) {
        let topic = self.config.topic.as_str();
        let size = batch.len();
        let bytes = batch.bytes();

        let results = join_all(
            batch
                .iter()
                .map(|message| self.broker.send_and_wait(topic, message)),
        )
        .await;

        let mut failed = 0;
        for (message, result) in batch.into_iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                self.handle_failure(message, e).await;
            }
        }
        let sent = size - failed;

        self.counters.sent.fetch_add(sent as u64, Ordering::Relaxed);
        self.counters.batches.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(topic, batch_size = size, bytes, sent, failed, "Batch flushed");
        let _ = self
            .events
            .send(PublisherEvent::BatchFlushed { size, sent, failed });
    }

    async fn handle_failure(&self, mut message: SerializedEvent, error: ActionLogError) {
        let topic = self.config.topic.as_str();
        message.record_failed_attempt();

        let reason = if message.attempts() <= self.config.max_send_retries {
            let message_id = message.id();
            let attempts = message.attempts();
            match self.queue.requeue(message) {
                Ok(()) => {
                    self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(%message_id, topic, attempts, error = %error, "Send failed, re-enqueued");
                    return;
                }
                Err(returned) => {
                    message = returned;
                    format!("{}; retry not queued, queue full", error)
                }
            }
        } else {
            error.to_string()
        };

        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            message_id = %message.id(),
            topic,
            attempts = message.attempts(),
            error = %reason,
            "Action event lost after failed send"
        );

        if let Some(dlq) = self.dead_letters.get() {
            let letter = DeadLetter::new(message, topic, reason);
            if let Err(e) = dlq.handle(letter).await {
                tracing::warn!(error = %e, "Dead letter handler failed");
            }
        }
    }
}

fn into_connection_error(e: ActionLogError) -> ActionLogError {
    match e {
        ActionLogError::Connection(_) => e,
        other => ActionLogError::Connection(other.to_string()),
    }
}
