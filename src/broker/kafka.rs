//! Kafka broker backend (feature `kafka`)
//!
//! Thin wrapper over an rdkafka `FutureProducer`. librdkafka does its own
//! network batching; `linger_ms` and `batch_bytes` pass straight through as
//! `linger.ms` and `batch.size`, separate from the publisher's per-flush
//! event cap.

use super::BrokerClient;
use crate::config::PublisherConfig;
use crate::error::{ActionLogError, Result};
use crate::types::SerializedEvent;
use async_trait::async_trait;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tokio::sync::RwLock;

/// Kafka producer settings
#[derive(Debug, Clone)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers
    pub bootstrap_servers: String,
    pub linger_ms: u64,
    /// Max bytes per network batch
    pub batch_bytes: usize,
    /// Per-message delivery timeout
    pub message_timeout_ms: u64,
    /// Metadata probe timeout on connect; also bounds the flush on disconnect
    pub connect_timeout_ms: u64,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            linger_ms: 0,
            batch_bytes: 16384,
            message_timeout_ms: 5000,
            connect_timeout_ms: 5000,
        }
    }
}

impl KafkaConfig {
    /// Derive producer settings from the publisher configuration
    pub fn from_publisher(config: &PublisherConfig) -> Self {
        let defaults = Self::default();
        Self {
            bootstrap_servers: config.broker_url.clone(),
            linger_ms: config.linger_ms,
            batch_bytes: if config.max_batch_bytes == 0 {
                defaults.batch_bytes
            } else {
                config.max_batch_bytes
            },
            ..defaults
        }
    }
}

/// Kafka `BrokerClient`
pub struct KafkaBroker {
    config: KafkaConfig,
    producer: RwLock<Option<FutureProducer>>,
}

impl KafkaBroker {
    pub fn new(config: KafkaConfig) -> Self {
        Self {
            config,
            producer: RwLock::new(None),
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBroker {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.producer.write().await;
        if slot.is_some() {
            return Ok(());
        }

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("linger.ms", self.config.linger_ms.to_string())
            .set("batch.size", self.config.batch_bytes.to_string())
            .set("message.timeout.ms", self.config.message_timeout_ms.to_string())
            .create()
            .map_err(|e| ActionLogError::Connection(e.to_string()))?;

        // Producer creation is lazy; a metadata round-trip proves the brokers answer.
        let probe = producer.clone();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        tokio::task::spawn_blocking(move || probe.client().fetch_metadata(None, timeout))
            .await
            .map_err(|e| ActionLogError::Connection(e.to_string()))?
            .map_err(|e| {
                ActionLogError::Connection(format!("{}: {}", self.config.bootstrap_servers, e))
            })?;

        tracing::info!(servers = %self.config.bootstrap_servers, "Connected to Kafka");
        *slot = Some(producer);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(producer) = self.producer.write().await.take() else {
            return Ok(());
        };

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| ActionLogError::Connection(e.to_string()))?
            .map_err(|e| ActionLogError::Connection(format!("flush on disconnect: {}", e)))?;

        tracing::info!(servers = %self.config.bootstrap_servers, "Disconnected from Kafka");
        Ok(())
    }

    async fn send_and_wait(&self, topic: &str, message: &SerializedEvent) -> Result<()> {
        let producer = self
            .producer
            .read()
            .await
            .clone()
            .ok_or_else(|| ActionLogError::transport(topic, "not connected"))?;

        let key = message.id().to_string();
        let payload = message.payload();
        let record = FutureRecord::to(topic).key(&key).payload(payload.as_ref());
        let timeout = Timeout::After(Duration::from_millis(self.config.message_timeout_ms));

        let (partition, offset) = producer
            .send(record, timeout)
            .await
            .map_err(|(e, _)| ActionLogError::transport(topic, e))?;

        tracing::debug!(
            message_id = %message.id(),
            topic,
            partition,
            offset,
            "Action published"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "kafka"
    }
}
