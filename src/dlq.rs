//! Dead letters: events whose send failed with no retry budget left
//!
//! The publisher never blocks emitters on broker trouble, so a lost event
//! is logged and, when a `DeadLetterHandler` is attached, handed to it for
//! inspection or later replay.

use crate::error::Result;
use crate::types::SerializedEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed send with context about why it was given up on
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The event as it would have gone on the wire
    pub message: SerializedEvent,

    /// Topic the send targeted
    pub topic: String,

    /// Last transport failure
    pub reason: String,

    /// Unix timestamp in milliseconds when the event was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetter {
    pub fn new(message: SerializedEvent, topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            message,
            topic: topic.into(),
            reason: reason.into(),
            dead_lettered_at: now_millis(),
        }
    }
}

/// Trait for dead letter handlers
///
/// Called from the batch loop, so implementations should return quickly.
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    /// Handle a dead-lettered event
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Number of dead letters held
    async fn count(&self) -> Result<usize>;

    /// Most recent dead letters, newest first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory dead letter store with a capacity cap (oldest evicted first)
pub struct MemoryDeadLetters {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    max_letters: usize,
}

impl MemoryDeadLetters {
    /// `max_letters` of 0 keeps everything
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            max_letters,
        }
    }
}

impl Default for MemoryDeadLetters {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DeadLetterHandler for MemoryDeadLetters {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.max_letters > 0 && letters.len() > self.max_letters {
            let excess = letters.len() - self.max_letters;
            letters.drain(..excess);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
