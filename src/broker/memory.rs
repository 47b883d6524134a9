//! In-memory broker for testing and single-process use
//!
//! Records every acknowledged send and every lifecycle call, and can be
//! told to refuse connections, fail selected payloads, or slow sends down.

use super::BrokerClient;
use crate::error::{ActionLogError, Result};
use crate::types::SerializedEvent;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use uuid::Uuid;

type FailFn = Arc<dyn Fn(&[u8]) -> bool + Send + Sync>;

/// A payload the broker acknowledged
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub topic: String,
    pub message_id: Uuid,
    pub payload: Bytes,
}

impl SentMessage {
    /// Decode the payload as JSON
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}

/// One call observed by the broker, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Connect,
    Send { topic: String, message_id: Uuid },
    SendFailed { topic: String, message_id: Uuid },
    Disconnect,
}

#[derive(Default)]
struct Recorded {
    connected: bool,
    connects: usize,
    disconnects: usize,
    sent: Vec<SentMessage>,
    ops: Vec<BrokerOp>,
}

#[derive(Default)]
struct Inner {
    recorded: Mutex<Recorded>,
    fail_when: RwLock<Option<FailFn>>,
    refuse_connections: AtomicBool,
    send_delay_ms: AtomicU64,
}

/// In-memory `BrokerClient`
///
/// Cheap to clone; clones share the same recorded state, so a test can keep
/// one handle while the publisher owns another.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect` fail until switched back off
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Fail every send whose payload matches `predicate`
    pub fn fail_when(&self, predicate: impl Fn(&[u8]) -> bool + Send + Sync + 'static) {
        *self
            .inner
            .fail_when
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(predicate));
    }

    /// Stop injecting send failures
    pub fn clear_failures(&self) {
        *self
            .inner
            .fail_when
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Delay every send by `delay` before acknowledging
    pub fn set_send_delay(&self, delay: Duration) {
        self.inner
            .send_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Acknowledged messages in acknowledgement order
    pub fn sent(&self) -> Vec<SentMessage> {
        self.recorded().sent.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.recorded().sent.len()
    }

    /// Successful `connect` calls
    pub fn connect_count(&self) -> usize {
        self.recorded().connects
    }

    pub fn disconnect_count(&self) -> usize {
        self.recorded().disconnects
    }

    pub fn is_connected(&self) -> bool {
        self.recorded().connected
    }

    /// Every lifecycle and send call in order
    pub fn operations(&self) -> Vec<BrokerOp> {
        self.recorded().ops.clone()
    }

    fn recorded(&self) -> MutexGuard<'_, Recorded> {
        self.inner
            .recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn should_fail(&self, payload: &[u8]) -> bool {
        let predicate = self
            .inner
            .fail_when
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        predicate.is_some_and(|f| f(payload))
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn connect(&self) -> Result<()> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(ActionLogError::Connection(
                "memory broker refusing connections".to_string(),
            ));
        }
        let mut recorded = self.recorded();
        recorded.connected = true;
        recorded.connects += 1;
        recorded.ops.push(BrokerOp::Connect);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut recorded = self.recorded();
        recorded.connected = false;
        recorded.disconnects += 1;
        recorded.ops.push(BrokerOp::Disconnect);
        Ok(())
    }

    async fn send_and_wait(&self, topic: &str, message: &SerializedEvent) -> Result<()> {
        let delay = self.inner.send_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let payload = message.payload();
        let failed = !self.recorded().connected || self.should_fail(&payload);

        let mut recorded = self.recorded();
        if failed {
            recorded.ops.push(BrokerOp::SendFailed {
                topic: topic.to_string(),
                message_id: message.id(),
            });
            let reason = if recorded.connected {
                "rejected by memory broker"
            } else {
                "not connected"
            };
            return Err(ActionLogError::transport(topic, reason));
        }

        recorded.ops.push(BrokerOp::Send {
            topic: topic.to_string(),
            message_id: message.id(),
        });
        recorded.sent.push(SentMessage {
            topic: topic.to_string(),
            message_id: message.id(),
            payload,
        });
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}
