//! Virtual channel for cron turns without a delivery target. Replies are logged and dropped.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::adapter::{Channel, ChannelError, DeliveryError, StopFlag};
use crate::bus::{InboundMessage, OutboundMessage};

pub struct SinkChannel {
    id: String,
    stop: StopFlag,
}

impl SinkChannel {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stop: StopFlag::new(),
        }
    }
}

#[async_trait]
impl Channel for SinkChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, _inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        self.stop.reset();
        self.stop.stopped().await;
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), DeliveryError> {
        log::info!(
            "{}: reply for session {} not delivered ({} chars)",
            self.id,
            msg.session_id,
            msg.text.chars().count()
        );
        log::debug!("{}: {}", self.id, msg.text);
        Ok(())
    }

    fn stop(&self) {
        self.stop.stop();
    }
}
