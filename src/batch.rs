//! Batch collection buffer
//!
//! Fills a batch until either the event count or the byte budget is hit.
//! An item that would overflow the byte budget is carried into the next
//! batch rather than pushed back onto the queue, so queue order is kept.

use crate::types::{Batch, SerializedEvent};

pub(crate) struct Batcher {
    /// Maximum events per batch
    max_events: usize,
    /// Maximum payload bytes per batch (0 = unlimited)
    max_bytes: usize,
    buffer: Vec<SerializedEvent>,
    bytes: usize,
    /// Item that did not fit; heads the next batch
    carry: Option<SerializedEvent>,
}

impl Batcher {
    pub(crate) fn new(max_events: usize, max_bytes: usize) -> Self {
        let max_events = max_events.max(1);
        Self {
            max_events,
            max_bytes,
            buffer: Vec::with_capacity(max_events),
            bytes: 0,
            carry: None,
        }
    }

    /// Add an item to the current batch, or carry it if it would not fit
    pub(crate) fn offer(&mut self, item: SerializedEvent) {
        debug_assert!(self.carry.is_none(), "offer on a full batcher");
        let over_budget = self.max_bytes > 0
            && !self.buffer.is_empty()
            && self.bytes + item.len() > self.max_bytes;
        if over_budget {
            self.carry = Some(item);
        } else {
            self.bytes += item.len();
            self.buffer.push(item);
        }
    }

    /// No more items may be offered before `take`
    pub(crate) fn is_full(&self) -> bool {
        self.carry.is_some()
            || self.buffer.len() >= self.max_events
            || (self.max_bytes > 0 && self.bytes >= self.max_bytes)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.carry.is_none()
    }

    /// Drain the current batch; a carried item starts the next one
    pub(crate) fn take(&mut self) -> Batch {
        let items = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.max_events));
        self.bytes = 0;
        if let Some(item) = self.carry.take() {
            self.offer(item);
        }
        Batch::from_items(items)
    }
}
