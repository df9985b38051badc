//! Bus event types: inbound messages from a channel or cron, and the outbound replies they cause.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Who produced an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Origin {
    /// A user on an external channel.
    Channel,
    /// A scheduled job (system-originated turn).
    #[serde(rename_all = "camelCase")]
    Cron { job_id: String },
}

/// Media or file attached to an inbound message. Carried through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// "image", "audio", "file", ...
    pub kind: String,
    /// Platform URL or file reference (e.g. `telegram:file/<id>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A message from a channel (or cron) addressed to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub channel_id: String,
    /// Logical conversation thread; unit of ordering and of the memory window.
    pub session_id: String,
    /// Platform conversation to reply to (Telegram chat id, Discord channel id, ...).
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub received_at: DateTime<Utc>,
    pub origin: Origin,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Default session id for a channel conversation: `"{channel_id}:{chat_id}"`.
pub fn default_session_id(channel_id: &str, chat_id: &str) -> String {
    format!("{}:{}", channel_id, chat_id)
}

impl InboundMessage {
    /// New channel-originated message; the session id defaults to `channel:chat`.
    pub fn new(
        channel_id: impl Into<String>,
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let channel_id = channel_id.into();
        let chat_id = chat_id.into();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: default_session_id(&channel_id, &chat_id),
            channel_id,
            chat_id,
            sender_id: sender_id.into(),
            text: text.into(),
            attachments: Vec::new(),
            received_at: Utc::now(),
            origin: Origin::Channel,
            metadata: HashMap::new(),
        }
    }

    /// System-originated turn for a cron job.
    pub fn from_cron(
        job_id: impl Into<String>,
        channel_id: impl Into<String>,
        chat_id: impl Into<String>,
        session_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            session_id: session_id.into(),
            chat_id: chat_id.into(),
            sender_id: "cron".to_string(),
            text: text.into(),
            attachments: Vec::new(),
            received_at: Utc::now(),
            origin: Origin::Cron {
                job_id: job_id.into(),
            },
            metadata: HashMap::new(),
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_cron(&self) -> bool {
        matches!(self.origin, Origin::Cron { .. })
    }
}

/// A reply produced by the agent, always correlated to the inbound event that caused it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    /// Id of the `InboundMessage` this answers.
    pub in_reply_to: String,
    pub channel_id: String,
    pub session_id: String,
    pub chat_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl OutboundMessage {
    /// Reply to `inbound` on the same channel, chat, and session.
    pub fn reply_to(inbound: &InboundMessage, text: impl Into<String>) -> Self {
        Self {
            in_reply_to: inbound.id.clone(),
            channel_id: inbound.channel_id.clone(),
            session_id: inbound.session_id.clone(),
            chat_id: inbound.chat_id.clone(),
            text: text.into(),
            structured_payload: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.structured_payload = Some(payload);
        self
    }
}
