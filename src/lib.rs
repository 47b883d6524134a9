//! # actionlog
//!
//! Batching publisher for user-action events.
//!
//! ## Overview
//!
//! Request handlers record successful business actions ("post_rates",
//! "get_insurance", ...) with a synchronous, fire-and-forget `publish`. A
//! single background loop drains the queue into size- and time-bounded
//! batches and hands each batch to a pluggable broker backend, so the
//! request path never waits on, or fails because of, the broker.
//!
//! ## Quick Start
//!
//! ```rust
//! use actionlog::{ActionEvent, BatchPublisher, MemoryBroker, PublisherConfig};
//!
//! # async fn example() -> actionlog::Result<()> {
//! let publisher = BatchPublisher::new(PublisherConfig::default(), MemoryBroker::new())?;
//! publisher.start().await?;
//!
//! publisher.publish(ActionEvent::new("post_rates")?.with_user_id("u-42"))?;
//!
//! // On shutdown: drain what is queued, then disconnect
//! publisher.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Brokers
//!
//! - **memory** — records sends; for tests and single-process use
//! - **nats** — NATS JetStream, publish with acknowledgement
//! - **kafka** — rdkafka producer (cargo feature `kafka`)
//!
//! ## Architecture
//!
//! - **ActionEvent** — one user action; serialized once at `publish`
//! - **EventQueue** — many-writer, single-reader FIFO
//! - **BatchPublisher** — lifecycle (`start`/`stop`) and the batch loop
//! - **BrokerClient** trait — connect, disconnect, send-and-await-ack
//! - **http** — axum middleware that publishes on 2xx responses

mod batch;
pub mod broker;
pub mod config;
pub mod dlq;
pub mod error;
pub mod http;
pub mod publisher;
pub mod queue;
pub mod types;

// Re-export core types
pub use broker::BrokerClient;
pub use config::{OverflowPolicy, PublisherConfig};
pub use dlq::{DeadLetter, DeadLetterHandler, MemoryDeadLetters};
pub use error::{ActionLogError, Result};
pub use publisher::{BatchPublisher, PublisherEvent, PublisherState, PublisherStats};
pub use queue::EventQueue;
pub use types::{ActionEvent, Batch, SerializedEvent};

// Re-export brokers for convenience
#[cfg(feature = "kafka")]
pub use broker::kafka::{KafkaBroker, KafkaConfig};
pub use broker::memory::{BrokerOp, MemoryBroker, SentMessage};
pub use broker::nats::{NatsBroker, NatsConfig, StorageType};
