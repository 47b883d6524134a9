//! Error types for actionlog

use thiserror::Error;

/// Errors that can occur while logging actions
#[derive(Debug, Error)]
pub enum ActionLogError {
    /// Broker connection could not be opened or closed cleanly
    #[error("Connection error: {0}")]
    Connection(String),

    /// Broker rejected a payload or could not deliver it
    #[error("Failed to send to topic '{topic}': {reason}")]
    Transport {
        topic: String,
        reason: String,
    },

    /// Event could not be encoded to its wire form
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Event violates its invariants (e.g. empty action)
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Bounded queue is full and the overflow policy rejects new items
    #[error("Event queue is full (capacity {capacity})")]
    QueueFull {
        capacity: usize,
    },
}

impl ActionLogError {
    /// Shorthand for a transport failure on `topic`
    pub fn transport(topic: impl Into<String>, reason: impl ToString) -> Self {
        Self::Transport {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result type alias for actionlog operations
pub type Result<T> = std::result::Result<T, ActionLogError>;
