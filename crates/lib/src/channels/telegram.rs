//! Telegram channel: long-poll getUpdates (or webhook) and sendMessage via Bot API.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::adapter::{split_message, Channel, ChannelError, DeliveryError, StopFlag};
use crate::bus::{Attachment, InboundMessage, OutboundMessage};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
/// Telegram rejects longer message texts.
const MAX_MESSAGE_CHARS: usize = 4096;
/// Consecutive getUpdates failures before the receive loop reports a fault.
const MAX_POLL_FAILURES: u32 = 10;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub photo: Vec<TelegramFile>,
    #[serde(default)]
    pub document: Option<TelegramFile>,
    #[serde(default)]
    pub voice: Option<TelegramFile>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Deserialize)]
pub struct TelegramFile {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// How updates reach the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramMode {
    /// getUpdates long-poll loop.
    Poll,
    /// Telegram POSTs updates to `url`; the gateway hands them to [`TelegramChannel::accept_update`].
    Webhook { url: String, secret: Option<String> },
}

/// Telegram channel connector.
pub struct TelegramChannel {
    id: String,
    token: String,
    api_base: String,
    mode: TelegramMode,
    stop: StopFlag,
    /// Inbound sender while a webhook-mode run is active.
    webhook_sink: Mutex<Option<mpsc::Sender<InboundMessage>>>,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(token: String, mode: TelegramMode) -> Self {
        Self {
            id: "telegram".to_string(),
            token,
            api_base: telegram_api_base(),
            mode,
            stop: StopFlag::new(),
            webhook_sink: Mutex::new(None),
            client: reqwest::Client::new(),
        }
    }

    /// Point the connector at a different Bot API server (tests, local bot API).
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn mode(&self) -> &TelegramMode {
        &self.mode
    }

    /// Secret the webhook route must see in `X-Telegram-Bot-Api-Secret-Token`, if any.
    pub fn webhook_secret(&self) -> Option<&str> {
        match &self.mode {
            TelegramMode::Webhook { secret, .. } => secret.as_deref().filter(|s| !s.is_empty()),
            TelegramMode::Poll => None,
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: &serde_json::Value,
    ) -> Result<T, String> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = res.status();
        let data: ApiResponse<T> = res
            .json()
            .await
            .map_err(|e| format!("{} failed: {} (undecodable body: {})", method, status, e))?;
        if !data.ok {
            return Err(format!(
                "{} failed: {} {}",
                method,
                status,
                data.description.unwrap_or_default()
            ));
        }
        data.result
            .ok_or_else(|| format!("{} returned no result", method))
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(
        &self,
        offset: Option<i64>,
    ) -> Result<(Vec<TelegramUpdate>, Option<i64>), String> {
        let mut body = serde_json::json!({ "timeout": LONG_POLL_TIMEOUT });
        if let Some(off) = offset {
            body["offset"] = serde_json::Value::from(off);
        }
        let updates: Vec<TelegramUpdate> = self.call("getUpdates", &body).await?;
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }

    /// Set webhook URL (and optional secret). When set, Telegram POSTs updates to the URL instead of getUpdates.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), String> {
        let mut body = serde_json::json!({ "url": url });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        self.call::<bool>("setWebhook", &body).await.map(|_| ())
    }

    /// Remove webhook so the bot can use getUpdates again.
    pub async fn delete_webhook(&self) -> Result<(), String> {
        self.call::<bool>("deleteWebhook", &serde_json::json!({}))
            .await
            .map(|_| ())
    }

    /// Send a text message to a chat via sendMessage API.
    pub async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let body = serde_json::json!({ "chat_id": chat_id, "text": chunk });
            self.call::<serde_json::Value>("sendMessage", &body)
                .await
                .map_err(DeliveryError::Rejected)?;
        }
        Ok(())
    }

    /// Hand a webhook update to the running receive loop. Returns false when no webhook run is
    /// active or the update carries nothing to forward.
    pub async fn accept_update(&self, update: TelegramUpdate) -> bool {
        let sink = match self.webhook_sink.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        let Some(sink) = sink else {
            log::debug!("telegram channel: webhook update {} with no active run", update.update_id);
            return false;
        };
        match update_to_inbound(&self.id, &update) {
            Some(msg) => sink.send(msg).await.is_ok(),
            None => false,
        }
    }

    fn set_sink(&self, sink: Option<mpsc::Sender<InboundMessage>>) {
        if let Ok(mut guard) = self.webhook_sink.lock() {
            *guard = sink;
        }
    }

    async fn run_poll(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        if let Err(e) = self.delete_webhook().await {
            log::debug!("telegram channel: deleteWebhook before polling: {}", e);
        }
        log::info!("telegram channel: starting getUpdates long-poll loop");
        let mut offset: Option<i64> = None;
        let mut failures = 0u32;
        loop {
            let result = tokio::select! {
                _ = self.stop.stopped() => break,
                r = self.get_updates(offset) => r,
            };
            match result {
                Ok((updates, next)) => {
                    failures = 0;
                    offset = next.or(offset);
                    for u in &updates {
                        if let Some(msg) = update_to_inbound(&self.id, u) {
                            inbound
                                .send(msg)
                                .await
                                .map_err(|_| ChannelError::InboundClosed)?;
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    log::warn!("telegram channel: getUpdates error ({}): {}", failures, e);
                    if failures >= MAX_POLL_FAILURES {
                        return Err(ChannelError::Connection(e));
                    }
                    tokio::select! {
                        _ = self.stop.stopped() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(2)) => {}
                    }
                }
            }
        }
        log::info!("telegram channel: getUpdates loop stopped");
        Ok(())
    }

    async fn run_webhook(
        &self,
        url: &str,
        secret: Option<&str>,
        inbound: mpsc::Sender<InboundMessage>,
    ) -> Result<(), ChannelError> {
        self.set_webhook(url, secret)
            .await
            .map_err(ChannelError::Connection)?;
        log::info!("telegram channel: webhook set to {}", url);
        self.set_sink(Some(inbound));
        self.stop.stopped().await;
        self.set_sink(None);
        if let Err(e) = self.delete_webhook().await {
            log::warn!("telegram channel: deleteWebhook on stop: {}", e);
        }
        log::info!("telegram channel: webhook mode stopped");
        Ok(())
    }
}

/// Translate an update into an inbound message. Bot authors and empty messages are skipped.
fn update_to_inbound(channel_id: &str, update: &TelegramUpdate) -> Option<InboundMessage> {
    let msg = update.message.as_ref()?;
    let from = msg.from.as_ref();
    if from.is_some_and(|u| u.is_bot) {
        return None;
    }

    let mut attachments = Vec::new();
    // Telegram lists photo sizes ascending; keep the largest.
    if let Some(photo) = msg.photo.last() {
        attachments.push(file_attachment("image", photo));
    }
    if let Some(doc) = &msg.document {
        attachments.push(file_attachment("file", doc));
    }
    if let Some(voice) = &msg.voice {
        attachments.push(file_attachment("audio", voice));
    }

    let text = msg
        .text
        .clone()
        .or_else(|| msg.caption.clone())
        .unwrap_or_default();
    if text.trim().is_empty() && attachments.is_empty() {
        return None;
    }

    let sender_id = match from {
        Some(u) => match &u.username {
            Some(name) => format!("{}|{}", u.id, name),
            None => u.id.to_string(),
        },
        None => msg.chat.id.to_string(),
    };
    let is_group = msg.chat.kind.as_deref().is_some_and(|k| k != "private");

    Some(
        InboundMessage::new(channel_id, msg.chat.id.to_string(), sender_id, text)
            .with_attachments(attachments)
            .with_metadata("message_id", serde_json::Value::from(msg.message_id))
            .with_metadata("is_group", serde_json::Value::Bool(is_group)),
    )
}

fn file_attachment(kind: &str, file: &TelegramFile) -> Attachment {
    Attachment {
        kind: kind.to_string(),
        url: Some(format!("telegram:file/{}", file.file_id)),
        mime_type: file.mime_type.clone(),
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        self.stop.reset();
        if self.token.is_empty() {
            return Err(ChannelError::NotConfigured(
                "telegram bot token not configured".to_string(),
            ));
        }
        match &self.mode {
            TelegramMode::Poll => self.run_poll(inbound).await,
            TelegramMode::Webhook { url, secret } => {
                let secret = secret.as_deref().filter(|s| !s.is_empty());
                let result = self.run_webhook(url, secret, inbound).await;
                self.set_sink(None);
                result
            }
        }
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), DeliveryError> {
        self.send_message(&msg.chat_id, &msg.text).await
    }

    fn stop(&self) {
        self.stop.stop();
    }

    async fn health_check(&self) -> bool {
        self.call::<serde_json::Value>("getMe", &serde_json::json!({}))
            .await
            .is_ok()
    }
}

/// Resolve Telegram bot API base URL (for tests or custom endpoints).
pub fn telegram_api_base() -> String {
    std::env::var("TELEGRAM_API_BASE")
        .map(|s| s.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| TELEGRAM_API_BASE.to_string())
}
