//! NATS JetStream broker backend
//!
//! Publishes each payload to the topic as a JetStream subject and awaits
//! the stream acknowledgement. The message id goes out as `Nats-Msg-Id`
//! so JetStream deduplicates retried sends within its window.

mod config;

pub use config::{NatsConfig, StorageType};

use super::BrokerClient;
use crate::error::{ActionLogError, Result};
use crate::types::SerializedEvent;
use async_nats::jetstream;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Clone)]
struct Session {
    client: async_nats::Client,
    jetstream: jetstream::Context,
}

/// NATS JetStream `BrokerClient`
pub struct NatsBroker {
    config: NatsConfig,
    session: RwLock<Option<Session>>,
}

impl NatsBroker {
    pub fn new(config: NatsConfig) -> Self {
        Self {
            config,
            session: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &NatsConfig {
        &self.config
    }

    /// Whether a session is currently open
    pub async fn is_connected(&self) -> bool {
        self.session.read().await.is_some()
    }
}

#[async_trait]
impl BrokerClient for NatsBroker {
    async fn connect(&self) -> Result<()> {
        let mut session = self.session.write().await;
        if session.is_some() {
            return Ok(());
        }

        let client = build_connect_options(&self.config)
            .connect(&self.config.url)
            .await
            .map_err(|e| ActionLogError::Connection(format!("{}: {}", self.config.url, e)))?;

        tracing::info!(url = %self.config.url, "Connected to NATS");

        let jetstream = jetstream::new(client.clone());
        if let Some(stream_name) = &self.config.stream_name {
            ensure_stream(&jetstream, stream_name, &self.config).await?;
        }

        *session = Some(Session { client, jetstream });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };

        session
            .client
            .flush()
            .await
            .map_err(|e| ActionLogError::Connection(format!("flush on disconnect: {}", e)))?;

        tracing::info!(url = %self.config.url, "Disconnected from NATS");
        Ok(())
    }

    async fn send_and_wait(&self, topic: &str, message: &SerializedEvent) -> Result<()> {
        let jetstream = self
            .session
            .read()
            .await
            .as_ref()
            .map(|s| s.jetstream.clone())
            .ok_or_else(|| ActionLogError::transport(topic, "not connected"))?;

        let mut headers = async_nats::HeaderMap::new();
        headers.insert("Nats-Msg-Id", message.id().to_string().as_str());

        let ack_fut = jetstream
            .publish_with_headers(topic.to_string(), headers, message.payload())
            .await
            .map_err(|e| ActionLogError::transport(topic, e))?;

        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        let ack = tokio::time::timeout(timeout, ack_fut)
            .await
            .map_err(|_| {
                ActionLogError::transport(
                    topic,
                    format!("ack timed out after {}s", self.config.request_timeout_secs),
                )
            })?
            .map_err(|e| ActionLogError::transport(topic, format!("ack failed: {}", e)))?;

        tracing::debug!(
            message_id = %message.id(),
            subject = topic,
            sequence = ack.sequence,
            duplicate = ack.duplicate,
            "Action published"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Ensure the JetStream stream capturing the action subjects exists
async fn ensure_stream(
    js: &jetstream::Context,
    stream_name: &str,
    config: &NatsConfig,
) -> Result<()> {
    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let stream_config = jetstream::stream::Config {
        name: stream_name.to_string(),
        subjects: config.subjects.clone(),
        storage,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    };

    js.get_or_create_stream(stream_config).await.map_err(|e| {
        ActionLogError::Connection(format!(
            "Failed to create/get stream '{}': {}",
            stream_name, e
        ))
    })?;

    tracing::info!(
        stream = stream_name,
        subjects = ?config.subjects,
        "JetStream stream ready"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_before_connect_is_transport_error() {
        let broker = NatsBroker::new(NatsConfig::default());
        assert!(!broker.is_connected().await);

        let message = SerializedEvent::new(b"{}".to_vec());
        let err = broker.send_and_wait("action_log", &message).await.unwrap_err();
        assert!(matches!(err, ActionLogError::Transport { ref topic, .. } if topic == "action_log"));
    }

    #[tokio::test]
    async fn test_disconnect_without_session_is_noop() {
        let broker = NatsBroker::new(NatsConfig::default());
        assert!(broker.disconnect().await.is_ok());
        assert_eq!(broker.name(), "nats");
    }
}
