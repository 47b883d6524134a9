//! In-process event queue between emitters and the batch loop
//!
//! Many producers push without blocking; a single consumer pops with a
//! timeout. FIFO: items come out in the order they went in. Unbounded by
//! default; a capacity turns on the configured [`OverflowPolicy`].

use crate::config::OverflowPolicy;
use crate::error::{ActionLogError, Result};
use crate::types::SerializedEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Thread-safe FIFO of serialized events
pub struct EventQueue {
    items: Mutex<VecDeque<SerializedEvent>>,

    /// Wakes the consumer; `notify_one` stores a permit when nobody waits
    available: Notify,

    /// Max queued items (0 = unbounded)
    capacity: usize,

    overflow: OverflowPolicy,

    dropped: AtomicU64,
}

impl EventQueue {
    /// Create an unbounded queue
    pub fn unbounded() -> Self {
        Self::bounded(0, OverflowPolicy::default())
    }

    /// Create a queue holding at most `capacity` items (0 = unbounded)
    pub fn bounded(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            capacity,
            overflow,
            dropped: AtomicU64::new(0),
        }
    }

    /// Push an item; never blocks
    ///
    /// Returns `false` when the item was discarded by `DropNewest`. Only
    /// fails when the queue is full and the policy is `Reject`.
    pub fn enqueue(&self, item: SerializedEvent) -> Result<bool> {
        {
            let mut items = self.lock();
            if self.capacity > 0 && items.len() >= self.capacity {
                match self.overflow {
                    OverflowPolicy::Reject => {
                        return Err(ActionLogError::QueueFull {
                            capacity: self.capacity,
                        });
                    }
                    OverflowPolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            message_id = %item.id(),
                            capacity = self.capacity,
                            "Event queue full, dropping newest event"
                        );
                        return Ok(false);
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(evicted) = items.pop_front() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                message_id = %evicted.id(),
                                capacity = self.capacity,
                                "Event queue full, dropping oldest event"
                            );
                        }
                    }
                }
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(true)
    }

    /// Put an item back for another attempt without evicting anything
    ///
    /// Ignores the overflow policy: a full queue hands the item back.
    pub(crate) fn requeue(&self, item: SerializedEvent) -> std::result::Result<(), SerializedEvent> {
        {
            let mut items = self.lock();
            if self.capacity > 0 && items.len() >= self.capacity {
                return Err(item);
            }
            items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Pop the head if one is present
    pub fn try_dequeue(&self) -> Option<SerializedEvent> {
        self.lock().pop_front()
    }

    /// Pop the head, waiting up to `timeout` for one to arrive
    ///
    /// Returns `None` on timeout. Intended for a single consumer.
    pub async fn dequeue_timeout(&self, timeout: Duration) -> Option<SerializedEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.try_dequeue();
            }
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Items discarded by the overflow policy so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<SerializedEvent>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}
