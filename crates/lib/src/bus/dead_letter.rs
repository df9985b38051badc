//! Dead-letter queue: replies that could not be delivered, kept for inspection.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::events::OutboundMessage;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub message: OutboundMessage,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Bounded ring buffer; the oldest entry is evicted when full.
pub struct DeadLetterQueue {
    capacity: usize,
    entries: Mutex<VecDeque<DeadLetter>>,
}

impl DeadLetterQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, message: OutboundMessage, reason: String) {
        let payload = serde_json::to_string(&message).unwrap_or_default();
        log::warn!(
            "dead letter: channel {} session {}: {}; payload {}",
            message.channel_id,
            message.session_id,
            reason,
            payload
        );
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(DeadLetter {
            message,
            reason,
            at: Utc::now(),
        });
    }

    /// Snapshot, oldest first.
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries
            .lock()
            .map(|e| e.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
