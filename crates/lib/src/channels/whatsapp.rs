//! WhatsApp channel via a local bridge speaking JSON over WebSocket.
//!
//! The bridge sends `{"type":"message","sender","content",...}` frames and accepts
//! `{"type":"send","to","text"}` to reply.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use super::adapter::{Channel, ChannelError, DeliveryError, StopFlag};
use crate::bus::{InboundMessage, OutboundMessage};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum BridgeFrame {
    Message {
        sender: String,
        #[serde(default)]
        content: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default, rename = "isGroup")]
        is_group: bool,
    },
    Status {
        #[serde(default)]
        status: String,
    },
    Qr {},
    Error {
        #[serde(default)]
        error: String,
    },
    #[serde(other)]
    Other,
}

pub struct WhatsAppChannel {
    id: String,
    bridge_url: String,
    stop: StopFlag,
    /// Frames queued for the bridge while a run is connected.
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl WhatsAppChannel {
    pub fn new(bridge_url: String) -> Self {
        Self {
            id: "whatsapp".to_string(),
            bridge_url,
            stop: StopFlag::new(),
            outgoing: Mutex::new(None),
        }
    }

    fn set_outgoing(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        if let Ok(mut guard) = self.outgoing.lock() {
            *guard = tx;
        }
    }

    async fn connected_run(
        &self,
        inbound: mpsc::Sender<InboundMessage>,
        mut outgoing: mpsc::UnboundedReceiver<String>,
    ) -> Result<(), ChannelError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.bridge_url.as_str())
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        let (mut write, mut read) = ws.split();
        log::info!("whatsapp channel: connected to bridge {}", self.bridge_url);

        loop {
            tokio::select! {
                _ = self.stop.stopped() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                Some(frame) = outgoing.recv() => {
                    write
                        .send(Message::Text(frame))
                        .await
                        .map_err(|e| ChannelError::Connection(e.to_string()))?;
                }
                frame = read.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(ChannelError::Connection("bridge closed the connection".to_string()));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => return Err(ChannelError::Connection(e.to_string())),
                    };
                    if let Some(msg) = self.handle_frame(&text) {
                        inbound
                            .send(msg)
                            .await
                            .map_err(|_| ChannelError::InboundClosed)?;
                    }
                }
            }
        }
    }

    fn handle_frame(&self, text: &str) -> Option<InboundMessage> {
        match serde_json::from_str::<BridgeFrame>(text) {
            Ok(BridgeFrame::Message {
                sender,
                content,
                id,
                is_group,
            }) => frame_to_inbound(&self.id, sender, content, id, is_group),
            Ok(BridgeFrame::Status { status }) => {
                log::info!("whatsapp channel: bridge status {}", status);
                None
            }
            Ok(BridgeFrame::Qr {}) => {
                log::info!("whatsapp channel: scan the QR code shown by the bridge to log in");
                None
            }
            Ok(BridgeFrame::Error { error }) => {
                log::warn!("whatsapp channel: bridge error: {}", error);
                None
            }
            Ok(BridgeFrame::Other) => None,
            Err(e) => {
                log::debug!("whatsapp channel: undecodable frame: {}", e);
                None
            }
        }
    }
}

/// Sender JIDs look like `15551234567@s.whatsapp.net`; the number alone is the sender id.
fn frame_to_inbound(
    channel_id: &str,
    sender: String,
    content: String,
    id: Option<String>,
    is_group: bool,
) -> Option<InboundMessage> {
    if content.trim().is_empty() {
        return None;
    }
    let number = sender.split('@').next().unwrap_or(&sender).to_string();
    let sender_id = if number == sender {
        sender.clone()
    } else {
        format!("{}|{}", number, sender)
    };
    let mut msg = InboundMessage::new(channel_id, sender, sender_id, content)
        .with_metadata("is_group", serde_json::Value::Bool(is_group));
    if let Some(id) = id {
        msg = msg.with_metadata("message_id", serde_json::Value::String(id));
    }
    Some(msg)
}

#[async_trait]
impl Channel for WhatsAppChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        self.stop.reset();
        let (tx, rx) = mpsc::unbounded_channel();
        self.set_outgoing(Some(tx));
        let result = self.connected_run(inbound, rx).await;
        self.set_outgoing(None);
        result
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), DeliveryError> {
        let frame = serde_json::json!({ "type": "send", "to": msg.chat_id, "text": msg.text });
        let tx = self.outgoing.lock().ok().and_then(|g| g.clone());
        match tx {
            Some(tx) => tx
                .send(frame.to_string())
                .map_err(|_| DeliveryError::NotConnected(self.id.clone())),
            None => Err(DeliveryError::NotConnected(self.id.clone())),
        }
    }

    fn stop(&self) {
        self.stop.stop();
    }
}
