//! Broker client trait, the seam between batching policy and transport
//!
//! All backends (in-memory, NATS JetStream, Kafka) implement
//! `BrokerClient`. No batching or buffering lives here; the
//! `BatchPublisher` owns all of that and only asks a backend to connect,
//! disconnect, and deliver one payload at a time with acknowledgement.

use crate::error::Result;
use crate::types::SerializedEvent;
use async_trait::async_trait;

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;
pub mod nats;

/// Producer-side broker connection
///
/// Implementations must tolerate concurrent `send_and_wait` calls: the
/// publisher fires every member of a batch at once and awaits them as a
/// unit.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Open the connection
    ///
    /// Fails with `ActionLogError::Connection` when the broker is unreachable.
    async fn connect(&self) -> Result<()>;

    /// Flush outstanding work and close the connection
    async fn disconnect(&self) -> Result<()>;

    /// Send one payload to `topic` and wait for the broker acknowledgement
    ///
    /// At-least-once per call. Fails with `ActionLogError::Transport` on
    /// network failure or broker rejection.
    async fn send_and_wait(&self, topic: &str, message: &SerializedEvent) -> Result<()>;

    /// Backend name (e.g. "memory", "nats", "kafka")
    fn name(&self) -> &str;
}
