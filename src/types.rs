//! Core value types: the action event, its wire form, and a flush batch
//!
//! The wire form keeps snake_case field names so downstream consumers of
//! the action-log topic read the same JSON shape they always have.

use crate::error::{ActionLogError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One user action to be logged
///
/// Created by an emitter once the action has succeeded, then handed to
/// the publisher by value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionEvent {
    /// Identifier of the acting user, when the request carried one
    #[serde(default)]
    pub user_id: Option<String>,

    /// Action name (e.g. "post_rates"); never empty
    pub action: String,

    /// When the action happened
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ActionEvent {
    /// Create an event stamped with the current time
    pub fn new(action: impl Into<String>) -> Result<Self> {
        let event = Self {
            user_id: None,
            action: action.into(),
            timestamp: Utc::now(),
        };
        event.validate()?;
        Ok(event)
    }

    /// Attach the acting user
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Override the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Check the event invariants
    pub fn validate(&self) -> Result<()> {
        if self.action.trim().is_empty() {
            return Err(ActionLogError::InvalidEvent(
                "action must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Encode to the compact JSON wire form
    pub fn to_serialized(&self) -> Result<SerializedEvent> {
        self.validate()?;
        let payload = serde_json::to_vec(self)?;
        Ok(SerializedEvent::new(payload))
    }
}

/// Wire form of an [`ActionEvent`]
///
/// Immutable payload bytes plus delivery bookkeeping. The `id` is assigned
/// once at serialization and survives retries, so brokers that deduplicate
/// by message id can drop redeliveries.
#[derive(Debug, Clone)]
pub struct SerializedEvent {
    id: Uuid,
    payload: Bytes,
    attempts: u32,
}

impl SerializedEvent {
    /// Wrap already-encoded bytes
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload: payload.into(),
            attempts: 0,
        }
    }

    /// Stable message id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Payload bytes (cheap clone)
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// Payload size in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Number of failed send attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn record_failed_attempt(&mut self) {
        self.attempts += 1;
    }
}

/// An ordered set of serialized events flushed together
///
/// Exists for one flush only. Members are sent concurrently, so the order
/// here is collection order, not delivery order.
#[derive(Debug, Default)]
pub struct Batch {
    items: Vec<SerializedEvent>,
    bytes: usize,
}

impl Batch {
    pub(crate) fn from_items(items: Vec<SerializedEvent>) -> Self {
        let bytes = items.iter().map(SerializedEvent::len).sum();
        Self { items, bytes }
    }

    /// Number of events in the batch
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total payload bytes
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn iter(&self) -> std::slice::Iter<'_, SerializedEvent> {
        self.items.iter()
    }
}

impl IntoIterator for Batch {
    type Item = SerializedEvent;
    type IntoIter = std::vec::IntoIter<SerializedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
