//! In-process loopback channel backed by tokio channels.
//!
//! The CLI `agent` command and tests inject inbound text through a [`LoopbackHandle`] and read
//! the replies the manager delivers back.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::adapter::{Channel, ChannelError, DeliveryError, StopFlag};
use crate::bus::{InboundMessage, OutboundMessage};

pub struct LoopbackChannel {
    id: String,
    stop: StopFlag,
    incoming: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    replies: mpsc::UnboundedSender<OutboundMessage>,
}

/// Caller's side of a loopback channel.
pub struct LoopbackHandle {
    channel_id: String,
    incoming: mpsc::UnboundedSender<InboundMessage>,
    replies: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl LoopbackChannel {
    pub fn new(id: impl Into<String>) -> (Arc<Self>, LoopbackHandle) {
        let id = id.into();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            id: id.clone(),
            stop: StopFlag::new(),
            incoming: Mutex::new(in_rx),
            replies: out_tx,
        });
        let handle = LoopbackHandle {
            channel_id: id,
            incoming: in_tx,
            replies: out_rx,
        };
        (channel, handle)
    }
}

impl LoopbackHandle {
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Queue a text message from `sender_id` in `chat_id`. Returns the inbound message id.
    pub fn send(
        &self,
        chat_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<String, ChannelError> {
        self.send_message(InboundMessage::new(
            self.channel_id.as_str(),
            chat_id,
            sender_id,
            text,
        ))
    }

    /// Queue a prepared message (custom session id, attachments, ...).
    pub fn send_message(&self, msg: InboundMessage) -> Result<String, ChannelError> {
        let id = msg.id.clone();
        self.incoming
            .send(msg)
            .map_err(|_| ChannelError::InboundClosed)?;
        Ok(id)
    }

    /// Next delivered reply. `None` once the channel is dropped.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.replies.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundMessage> {
        self.replies.try_recv().ok()
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        self.stop.reset();
        let mut incoming = self.incoming.lock().await;
        loop {
            tokio::select! {
                _ = self.stop.stopped() => return Ok(()),
                msg = incoming.recv() => match msg {
                    Some(msg) => inbound
                        .send(msg)
                        .await
                        .map_err(|_| ChannelError::InboundClosed)?,
                    None => {
                        self.stop.stopped().await;
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), DeliveryError> {
        self.replies
            .send(msg.clone())
            .map_err(|_| DeliveryError::NotConnected(self.id.clone()))
    }

    fn stop(&self) {
        self.stop.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn forwards_inbound_and_returns_replies() {
        let (channel, mut handle) = LoopbackChannel::new("loop");
        let (tx, mut rx) = mpsc::channel(4);
        let runner = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.run(tx).await })
        };

        handle.send("chat1", "alice", "hi").unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.channel_id, "loop");
        assert_eq!(msg.session_id, "loop:chat1");
        assert_eq!(msg.sender_id, "alice");

        channel
            .send(&OutboundMessage::reply_to(&msg, "hello"))
            .await
            .unwrap();
        assert_eq!(handle.recv().await.unwrap().text, "hello");

        channel.stop();
        assert!(runner.await.unwrap().is_ok());
    }
}
