//! Slack channel over Socket Mode; replies via chat.postMessage.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::adapter::{split_message, Channel, ChannelError, DeliveryError, StopFlag};
use crate::bus::{InboundMessage, OutboundMessage};

const SLACK_API_BASE: &str = "https://slack.com/api";
const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
struct SlackApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    envelope_id: Option<String>,
    #[serde(default)]
    payload: Option<EventsPayload>,
}

#[derive(Debug, Deserialize)]
struct EventsPayload {
    #[serde(default)]
    event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
}

pub struct SlackChannel {
    id: String,
    bot_token: String,
    app_token: String,
    api_base: String,
    stop: StopFlag,
    client: reqwest::Client,
}

impl SlackChannel {
    pub fn new(bot_token: String, app_token: String) -> Self {
        Self {
            id: "slack".to_string(),
            bot_token,
            app_token,
            api_base: SLACK_API_BASE.to_string(),
            stop: StopFlag::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    async fn api_call(
        &self,
        method: &str,
        token: &str,
        body: &serde_json::Value,
    ) -> Result<SlackApiResponse, String> {
        let res = self
            .client
            .post(format!("{}/{}", self.api_base, method))
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let data: SlackApiResponse = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err(format!(
                "{} failed: {}",
                method,
                data.error.as_deref().unwrap_or("unknown error")
            ));
        }
        Ok(data)
    }

    /// Ask Slack for a Socket Mode WebSocket URL.
    async fn open_connection(&self) -> Result<String, ChannelError> {
        let data = self
            .api_call("apps.connections.open", &self.app_token, &serde_json::json!({}))
            .await
            .map_err(ChannelError::Connection)?;
        data.url
            .ok_or_else(|| ChannelError::Protocol("apps.connections.open returned no url".to_string()))
    }
}

/// Translate a message event. Bot messages and subtypes (edits, joins, ...) are skipped.
fn event_to_inbound(channel_id: &str, event: SlackEvent) -> Option<InboundMessage> {
    if event.kind != "message" || event.subtype.is_some() || event.bot_id.is_some() {
        return None;
    }
    let user = event.user?;
    let chat = event.channel?;
    let text = event.text.unwrap_or_default();
    if text.trim().is_empty() {
        return None;
    }
    let mut msg = InboundMessage::new(channel_id, chat, user, text);
    if let Some(ts) = event.ts {
        msg = msg.with_metadata("ts", serde_json::Value::String(ts));
    }
    if let Some(thread) = event.thread_ts {
        msg = msg.with_metadata("thread_ts", serde_json::Value::String(thread));
    }
    Some(msg)
}

fn ws_err(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Connection(e.to_string())
}

#[async_trait]
impl Channel for SlackChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        self.stop.reset();
        if self.bot_token.is_empty() || self.app_token.is_empty() {
            return Err(ChannelError::NotConfigured(
                "slack bot and app tokens are required".to_string(),
            ));
        }
        let url = self.open_connection().await?;
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(ws_err)?;
        let (mut write, mut read) = ws.split();
        log::info!("slack channel: socket mode connected");

        loop {
            let frame = tokio::select! {
                _ = self.stop.stopped() => {
                    let _ = write.send(Message::Close(None)).await;
                    log::info!("slack channel: socket mode stopped");
                    return Ok(());
                }
                f = read.next() => f,
            };
            let text = match frame {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(frame))) => {
                    return Err(ws_err(format!("socket closed: {:?}", frame)));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ws_err(e)),
                None => return Err(ws_err("socket stream ended")),
            };
            let envelope: Envelope = match serde_json::from_str(&text) {
                Ok(e) => e,
                Err(e) => {
                    log::debug!("slack channel: undecodable envelope: {}", e);
                    continue;
                }
            };
            if let Some(envelope_id) = &envelope.envelope_id {
                let ack = serde_json::json!({ "envelope_id": envelope_id });
                write
                    .send(Message::Text(ack.to_string()))
                    .await
                    .map_err(ws_err)?;
            }
            match envelope.kind.as_str() {
                "hello" => log::debug!("slack channel: hello received"),
                "disconnect" => {
                    return Err(ChannelError::Protocol("slack requested reconnect".to_string()));
                }
                "events_api" => {
                    let event = envelope.payload.and_then(|p| p.event);
                    if let Some(msg) = event.and_then(|e| event_to_inbound(&self.id, e)) {
                        inbound
                            .send(msg)
                            .await
                            .map_err(|_| ChannelError::InboundClosed)?;
                    }
                }
                other => log::debug!("slack channel: ignoring envelope type {}", other),
            }
        }
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), DeliveryError> {
        for chunk in split_message(&msg.text, MAX_MESSAGE_CHARS) {
            let body = serde_json::json!({ "channel": msg.chat_id, "text": chunk });
            self.api_call("chat.postMessage", &self.bot_token, &body)
                .await
                .map_err(DeliveryError::Rejected)?;
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop.stop();
    }

    async fn health_check(&self) -> bool {
        self.api_call("auth.test", &self.bot_token, &serde_json::json!({}))
            .await
            .is_ok()
    }
}
