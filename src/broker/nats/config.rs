//! NATS backend configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend for a provisioned stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// NATS JetStream connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NatsConfig {
    /// Server URL (e.g. "nats://127.0.0.1:4222")
    pub url: String,

    /// Auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Stream to create or reuse on connect; `None` assumes one already
    /// captures the target subjects
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_name: Option<String>,

    /// Subjects captured by the provisioned stream
    pub subjects: Vec<String>,

    pub storage: StorageType,

    pub connect_timeout_secs: u64,

    /// Also bounds each publish acknowledgement wait
    pub request_timeout_secs: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            token: None,
            stream_name: None,
            subjects: vec!["action_log".to_string()],
            storage: StorageType::File,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
        }
    }
}

impl NatsConfig {
    /// Point at `url` and provision `stream_name` capturing `topic`
    pub fn for_topic(
        url: impl Into<String>,
        stream_name: impl Into<String>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            stream_name: Some(stream_name.into()),
            subjects: vec![topic.into()],
            ..Default::default()
        }
    }
}
