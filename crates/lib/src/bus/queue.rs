//! Bounded inbound/outbound queues with publish timeouts (the system's backpressure).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use super::dead_letter::DeadLetterQueue;
use super::events::{InboundMessage, OutboundMessage};
use crate::config::BusConfig;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Queue stayed saturated for the whole publish timeout.
    #[error("bus full: no capacity after {0:?}")]
    Full(Duration),
    #[error("bus closed")]
    Closed,
    /// No delivery task is subscribed for this channel.
    #[error("no outbound route for channel {0}")]
    NoRoute(String),
    #[error("outbound queue for channel {0} already has a subscriber")]
    AlreadySubscribed(String),
}

struct OutboundQueue {
    tx: mpsc::Sender<OutboundMessage>,
}

/// In-process bus. One inbound queue shared by all producers; one outbound queue per channel.
///
/// The inbound queue is FIFO, so per-session order is preserved as long as a single
/// dispatcher drains it (the agent's session dispatcher does).
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
    outbound: std::sync::Mutex<HashMap<String, OutboundQueue>>,
    outbound_capacity: usize,
    publish_timeout: Option<Duration>,
    dead_letters: DeadLetterQueue,
}

/// Shared handle on the inbound queue. Clones compete for messages.
#[derive(Clone)]
pub struct InboundSubscription {
    rx: Arc<Mutex<mpsc::Receiver<InboundMessage>>>,
}

impl InboundSubscription {
    /// Next inbound message in arrival order. `None` once every publisher is gone.
    pub async fn recv(&self) -> Option<InboundMessage> {
        self.rx.lock().await.recv().await
    }
}

impl MessageBus {
    /// `publish_timeout` of `None` blocks publishers until capacity frees up.
    pub fn new(
        inbound_capacity: usize,
        outbound_capacity: usize,
        publish_timeout: Option<Duration>,
        dead_letter_capacity: usize,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        Self {
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            outbound: std::sync::Mutex::new(HashMap::new()),
            outbound_capacity: outbound_capacity.max(1),
            publish_timeout,
            dead_letters: DeadLetterQueue::new(dead_letter_capacity),
        }
    }

    pub fn from_config(bus: &BusConfig, dead_letter_capacity: usize) -> Self {
        let timeout = if bus.publish_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(bus.publish_timeout_ms))
        };
        Self::new(
            bus.inbound_capacity,
            bus.outbound_capacity,
            timeout,
            dead_letter_capacity,
        )
    }

    /// Enqueue an inbound message. Fails with `BusError::Full` when the queue stays saturated past the timeout.
    pub async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), BusError> {
        log::debug!(
            "bus: inbound {} for session {} from {}",
            msg.id,
            msg.session_id,
            msg.channel_id
        );
        send_bounded(&self.inbound_tx, msg, self.publish_timeout).await
    }

    /// Enqueue a reply on its channel's outbound queue.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), BusError> {
        let tx = {
            let queues = self
                .outbound
                .lock()
                .map_err(|_| BusError::Closed)?;
            match queues.get(&msg.channel_id) {
                Some(q) if !q.tx.is_closed() => q.tx.clone(),
                _ => return Err(BusError::NoRoute(msg.channel_id.clone())),
            }
        };
        send_bounded(&tx, msg, self.publish_timeout).await
    }

    /// Handle for consuming inbound messages.
    pub fn subscribe_inbound(&self) -> InboundSubscription {
        InboundSubscription {
            rx: self.inbound_rx.clone(),
        }
    }

    /// Take the outbound queue for `channel_id`. One live subscriber per channel; a dropped
    /// subscriber frees the slot.
    pub fn subscribe_outbound(
        &self,
        channel_id: &str,
    ) -> Result<mpsc::Receiver<OutboundMessage>, BusError> {
        let mut queues = self.outbound.lock().map_err(|_| BusError::Closed)?;
        if let Some(q) = queues.get(channel_id) {
            if !q.tx.is_closed() {
                return Err(BusError::AlreadySubscribed(channel_id.to_string()));
            }
        }
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        queues.insert(channel_id.to_string(), OutboundQueue { tx });
        Ok(rx)
    }

    /// Drop the route for `channel_id`. Its subscriber still receives what was already queued,
    /// then sees the queue end; later publishes fail with `NoRoute`.
    pub fn close_outbound(&self, channel_id: &str) {
        if let Ok(mut queues) = self.outbound.lock() {
            queues.remove(channel_id);
        }
    }

    /// Messages waiting in the inbound queue.
    pub fn inbound_depth(&self) -> usize {
        self.inbound_tx.max_capacity() - self.inbound_tx.capacity()
    }

    /// Channels with a live outbound subscriber.
    pub fn routes(&self) -> Vec<String> {
        let Ok(queues) = self.outbound.lock() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = queues
            .iter()
            .filter(|(_, q)| !q.tx.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Record an undeliverable reply: logged with its full payload and retained for inspection.
    pub fn dead_letter(&self, msg: OutboundMessage, reason: impl Into<String>) {
        self.dead_letters.push(msg, reason.into());
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }
}

async fn send_bounded<T>(
    tx: &mpsc::Sender<T>,
    item: T,
    timeout: Option<Duration>,
) -> Result<(), BusError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, tx.send(item)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Full(limit)),
        },
        None => tx.send(item).await.map_err(|_| BusError::Closed),
    }
}
