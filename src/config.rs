//! Publisher configuration
//!
//! Loaded from `ACTIONLOG_*` environment variables via `envy`; every field
//! has a default so an empty environment yields a usable local setup.

use crate::error::{ActionLogError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable prefix for [`PublisherConfig::from_env`]
pub const ENV_PREFIX: &str = "ACTIONLOG_";

/// What the queue does when it is bounded and full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the incoming event
    #[default]
    DropNewest,
    /// Evict the oldest queued event to make room
    DropOldest,
    /// Refuse the event with `QueueFull`
    Reject,
}

/// Batch publisher configuration, fixed at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Broker network address (e.g. "localhost:9092" or "nats://127.0.0.1:4222")
    pub broker_url: String,

    /// Target topic / subject
    pub topic: String,

    /// Max time to wait for each further item while filling a batch
    pub linger_ms: u64,

    /// Max events per flush
    pub max_batch_size: usize,

    /// Max payload bytes per flush (0 = unlimited)
    pub max_batch_bytes: usize,

    /// Queue capacity (0 = unbounded)
    pub queue_capacity: usize,

    /// Overflow policy when `queue_capacity` is reached
    pub overflow: OverflowPolicy,

    /// Re-enqueue budget for a failed send (0 = a failed send is lost)
    pub max_send_retries: u32,

    /// First-item wait when `linger_ms` is 0, so an idle loop does not spin
    pub idle_poll_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            broker_url: "localhost:9092".to_string(),
            topic: "action_log".to_string(),
            linger_ms: 1000,
            max_batch_size: 100,
            max_batch_bytes: 0,
            queue_capacity: 0,
            overflow: OverflowPolicy::default(),
            max_send_retries: 0,
            idle_poll_ms: 100,
        }
    }
}

impl PublisherConfig {
    /// Load from `ACTIONLOG_*` environment variables and validate
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_env()
            .map_err(|e| ActionLogError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from explicit `(KEY, value)` pairs (keys carry the prefix)
    pub fn from_vars<I>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Self = envy::prefixed(ENV_PREFIX)
            .from_iter(vars)
            .map_err(|e| ActionLogError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        if self.broker_url.trim().is_empty() {
            return Err(ActionLogError::Config("broker_url must not be empty".into()));
        }
        if self.topic.trim().is_empty() {
            return Err(ActionLogError::Config("topic must not be empty".into()));
        }
        if self.max_batch_size == 0 {
            return Err(ActionLogError::Config(
                "max_batch_size must be at least 1".into(),
            ));
        }
        if self.linger_ms == 0 && self.idle_poll_ms == 0 {
            return Err(ActionLogError::Config(
                "idle_poll_ms must be non-zero when linger_ms is 0".into(),
            ));
        }
        Ok(())
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }

    /// Wait for the first item of a cycle
    pub fn first_item_wait(&self) -> Duration {
        if self.linger_ms == 0 {
            Duration::from_millis(self.idle_poll_ms)
        } else {
            self.linger()
        }
    }
}
