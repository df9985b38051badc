//! Discord channel: Gateway WebSocket for MESSAGE_CREATE events, REST for replies.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::adapter::{split_message, Channel, ChannelError, DeliveryError, StopFlag};
use crate::bus::{Attachment, InboundMessage, OutboundMessage};

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";
const MAX_MESSAGE_CHARS: usize = 2000;

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: serde_json::Value,
    #[serde(default)]
    s: Option<i64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiscordMessage {
    id: String,
    channel_id: String,
    #[serde(default)]
    guild_id: Option<String>,
    author: DiscordAuthor,
    #[serde(default)]
    content: String,
    #[serde(default)]
    attachments: Vec<DiscordAttachment>,
}

#[derive(Debug, Deserialize)]
struct DiscordAuthor {
    id: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    bot: bool,
}

#[derive(Debug, Deserialize)]
struct DiscordAttachment {
    url: String,
    #[serde(default)]
    content_type: Option<String>,
}

pub struct DiscordChannel {
    id: String,
    token: String,
    gateway_url: String,
    api_base: String,
    intents: u64,
    stop: StopFlag,
    client: reqwest::Client,
}

impl DiscordChannel {
    pub fn new(token: String, gateway_url: String, intents: u64) -> Self {
        Self {
            id: "discord".to_string(),
            token,
            gateway_url,
            api_base: DISCORD_API_BASE.to_string(),
            intents,
            stop: StopFlag::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    fn auth_header(&self) -> String {
        format!("Bot {}", self.token)
    }

    fn identify_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": self.token,
                "intents": self.intents,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": "banobot",
                    "device": "banobot"
                }
            }
        })
    }
}

/// Translate a MESSAGE_CREATE payload. Bot authors and empty messages are skipped.
fn message_to_inbound(channel_id: &str, data: serde_json::Value) -> Option<InboundMessage> {
    let msg: DiscordMessage = match serde_json::from_value(data) {
        Ok(m) => m,
        Err(e) => {
            log::debug!("discord channel: undecodable MESSAGE_CREATE: {}", e);
            return None;
        }
    };
    if msg.author.bot {
        return None;
    }
    let attachments: Vec<Attachment> = msg
        .attachments
        .iter()
        .map(|a| Attachment {
            kind: attachment_kind(a.content_type.as_deref()).to_string(),
            url: Some(a.url.clone()),
            mime_type: a.content_type.clone(),
        })
        .collect();
    if msg.content.trim().is_empty() && attachments.is_empty() {
        return None;
    }
    let sender_id = match &msg.author.username {
        Some(name) => format!("{}|{}", msg.author.id, name),
        None => msg.author.id.clone(),
    };
    let mut inbound = InboundMessage::new(channel_id, msg.channel_id, sender_id, msg.content)
        .with_attachments(attachments)
        .with_metadata("message_id", serde_json::Value::String(msg.id));
    if let Some(guild) = msg.guild_id {
        inbound = inbound.with_metadata("guild_id", serde_json::Value::String(guild));
    }
    Some(inbound)
}

fn attachment_kind(content_type: Option<&str>) -> &'static str {
    match content_type {
        Some(ct) if ct.starts_with("image/") => "image",
        Some(ct) if ct.starts_with("audio/") => "audio",
        Some(ct) if ct.starts_with("video/") => "video",
        _ => "file",
    }
}

fn heartbeat(seq: Option<i64>) -> Message {
    Message::Text(serde_json::json!({ "op": OP_HEARTBEAT, "d": seq }).to_string())
}

fn ws_err(e: impl std::fmt::Display) -> ChannelError {
    ChannelError::Connection(e.to_string())
}

#[async_trait]
impl Channel for DiscordChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        self.stop.reset();
        if self.token.is_empty() {
            return Err(ChannelError::NotConfigured(
                "discord bot token not configured".to_string(),
            ));
        }
        let (ws, _) = tokio_tungstenite::connect_async(self.gateway_url.as_str())
            .await
            .map_err(ws_err)?;
        let (mut write, mut read) = ws.split();

        // First frame must be HELLO with the heartbeat interval.
        let interval_ms = loop {
            let frame = tokio::select! {
                _ = self.stop.stopped() => return Ok(()),
                f = read.next() => f,
            };
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let p: GatewayPayload = serde_json::from_str(&text)
                        .map_err(|e| ChannelError::Protocol(e.to_string()))?;
                    if p.op != OP_HELLO {
                        return Err(ChannelError::Protocol(format!(
                            "expected HELLO, got op {}",
                            p.op
                        )));
                    }
                    break p.d["heartbeat_interval"].as_u64().unwrap_or(41_250);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(ws_err(e)),
                None => return Err(ws_err("gateway closed before HELLO")),
            }
        };

        write
            .send(Message::Text(self.identify_payload().to_string()))
            .await
            .map_err(ws_err)?;
        log::info!(
            "discord channel: connected to gateway (heartbeat {} ms)",
            interval_ms
        );

        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms.max(1000)));
        ticker.tick().await;
        let mut seq: Option<i64> = None;
        let mut awaiting_ack = false;

        loop {
            tokio::select! {
                _ = self.stop.stopped() => {
                    let _ = write.send(Message::Close(None)).await;
                    log::info!("discord channel: gateway loop stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if awaiting_ack {
                        return Err(ws_err("heartbeat not acknowledged"));
                    }
                    write.send(heartbeat(seq)).await.map_err(ws_err)?;
                    awaiting_ack = true;
                }
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(frame))) => {
                            return Err(ws_err(format!("gateway closed: {:?}", frame)));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(ws_err(e)),
                        None => return Err(ws_err("gateway stream ended")),
                    };
                    let p: GatewayPayload = match serde_json::from_str(&text) {
                        Ok(p) => p,
                        Err(e) => {
                            log::debug!("discord channel: undecodable frame: {}", e);
                            continue;
                        }
                    };
                    if p.s.is_some() {
                        seq = p.s;
                    }
                    match p.op {
                        OP_DISPATCH => {
                            if p.t.as_deref() == Some("MESSAGE_CREATE") {
                                if let Some(msg) = message_to_inbound(&self.id, p.d) {
                                    inbound
                                        .send(msg)
                                        .await
                                        .map_err(|_| ChannelError::InboundClosed)?;
                                }
                            } else if p.t.as_deref() == Some("READY") {
                                log::info!("discord channel: session ready");
                            }
                        }
                        OP_HEARTBEAT => {
                            write.send(heartbeat(seq)).await.map_err(ws_err)?;
                        }
                        OP_HEARTBEAT_ACK => awaiting_ack = false,
                        OP_RECONNECT => {
                            return Err(ChannelError::Protocol("gateway requested reconnect".to_string()));
                        }
                        OP_INVALID_SESSION => {
                            return Err(ChannelError::Protocol("invalid session".to_string()));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), DeliveryError> {
        let url = format!("{}/channels/{}/messages", self.api_base, msg.chat_id);
        for chunk in split_message(&msg.text, MAX_MESSAGE_CHARS) {
            let res = self
                .client
                .post(&url)
                .header("Authorization", self.auth_header())
                .json(&serde_json::json!({ "content": chunk }))
                .send()
                .await?;
            if !res.status().is_success() {
                let status = res.status();
                let body = res.text().await.unwrap_or_default();
                return Err(DeliveryError::Rejected(format!(
                    "create message failed: {} {}",
                    status, body
                )));
            }
        }
        Ok(())
    }

    fn stop(&self) {
        self.stop.stop();
    }

    async fn health_check(&self) -> bool {
        let res = self
            .client
            .get(format!("{}/users/@me", self.api_base))
            .header("Authorization", self.auth_header())
            .send()
            .await;
        matches!(res, Ok(r) if r.status().is_success())
    }
}
