//! Session-affine dispatch from the inbound queue to the agent.
//!
//! One worker task per active session drains that session's messages in order; a semaphore bounds
//! how many sessions run a turn at once. Messages in flight hold a permit from a second semaphore,
//! so the dispatcher stops draining the bus when too much work is queued and publishers see backpressure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};

use super::AgentLoop;
use crate::bus::{InboundMessage, MessageBus};

type Queued = (InboundMessage, OwnedSemaphorePermit);
type Workers = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Queued>>>>;

#[derive(Clone)]
pub struct SessionDispatcher {
    agent: Arc<AgentLoop>,
    bus: Arc<MessageBus>,
    turns: Arc<Semaphore>,
    pending: Arc<Semaphore>,
    workers: Workers,
}

impl SessionDispatcher {
    /// `max_concurrent_turns` sessions run at once; at most `max_pending` messages are taken off the bus
    /// and not yet answered.
    pub fn new(
        agent: Arc<AgentLoop>,
        bus: Arc<MessageBus>,
        max_concurrent_turns: usize,
        max_pending: usize,
    ) -> Self {
        Self {
            agent,
            bus,
            turns: Arc::new(Semaphore::new(max_concurrent_turns.max(1))),
            pending: Arc::new(Semaphore::new(max_pending.max(1))),
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Sessions with a live worker.
    pub fn active_sessions(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Consume the inbound queue until shutdown is signalled or the bus closes.
    /// Workers already running finish the messages they hold.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let inbound = self.bus.subscribe_inbound();
        log::info!("agent: dispatcher started");
        loop {
            let permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = self.pending.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            let msg = tokio::select! {
                _ = shutdown.changed() => break,
                msg = inbound.recv() => msg,
            };
            match msg {
                Some(msg) => self.dispatch(msg, permit),
                None => break,
            }
        }
        log::info!("agent: dispatcher stopped");
    }

    fn dispatch(&self, msg: InboundMessage, permit: OwnedSemaphorePermit) {
        let Ok(mut workers) = self.workers.lock() else {
            log::error!("agent: worker map poisoned; dropping message {}", msg.id);
            return;
        };
        let session_id = msg.session_id.clone();
        let item = match workers.get(&session_id) {
            Some(tx) => match tx.send((msg, permit)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(item)) => item,
            },
            None => (msg, permit),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        // Receiver is alive, so this cannot fail.
        let _ = tx.send(item);
        workers.insert(session_id.clone(), tx);
        drop(workers);

        let this = self.clone();
        tokio::spawn(async move { this.session_worker(session_id, rx).await });
    }

    /// Handle one session's messages strictly in order, then retire when its queue is empty.
    async fn session_worker(self, session_id: String, mut rx: mpsc::UnboundedReceiver<Queued>) {
        loop {
            let (msg, pending_permit) = match rx.try_recv() {
                Ok(item) => item,
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {
                    // Check again under the map lock so a concurrent dispatch is never lost.
                    let Ok(mut workers) = self.workers.lock() else {
                        return;
                    };
                    match rx.try_recv() {
                        Ok(item) => item,
                        Err(_) => {
                            workers.remove(&session_id);
                            return;
                        }
                    }
                }
            };

            let Ok(turn_permit) = self.turns.clone().acquire_owned().await else {
                return;
            };
            let reply = self.agent.handle(&msg).await;
            drop(turn_permit);

            if let Err(e) = self.bus.publish_outbound(reply.clone()).await {
                self.bus.dead_letter(reply, format!("publish failed: {}", e));
            }
            drop(pending_permit);
        }
    }
}
