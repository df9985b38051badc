//! Channel adapter capability plus helpers shared by the adapters.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::bus::{InboundMessage, OutboundMessage};

/// Fault in an adapter's receive loop. Recovered by the manager's restart policy.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel not configured: {0}")]
    NotConfigured(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The manager dropped the inbound side; the adapter cannot forward anything.
    #[error("inbound queue closed")]
    InboundClosed,
    #[error("unknown channel: {0}")]
    Unknown(String),
    #[error("channel already registered: {0}")]
    AlreadyRegistered(String),
    #[error("channel disabled: {0}")]
    Disabled(String),
}

/// Outbound send failed. The manager dead-letters the message.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("channel {0} is not connected")]
    NotConnected(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("rejected by platform: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        DeliveryError::Request(e.to_string())
    }
}

/// One external messaging surface.
///
/// `run` is the long-running receive loop: it forwards platform events as [`InboundMessage`]s
/// and returns `Ok(())` once [`Channel::stop`] is called, or `Err` on a fault. The manager may
/// call `run` again after it returns, so adapters must reset their stop state on entry.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel id (e.g. "telegram"). Also the `channel_id` of every message it produces.
    fn id(&self) -> &str;

    async fn run(&self, inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError>;

    /// Deliver one reply to `msg.chat_id`.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), DeliveryError>;

    /// Ask the receive loop to return.
    fn stop(&self);

    /// Periodic liveness probe. An unhealthy running adapter is stopped and restarted.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Stop signal for a receive loop that can be re-armed for the next run.
pub struct StopFlag {
    tx: watch::Sender<bool>,
}

impl Default for StopFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl StopFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `stop` has been called (immediately if it already was).
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

/// Sender allow list. Empty permits everyone.
///
/// Adapters may encode several identities in `sender_id` separated by `|`
/// (Telegram sends `"12345|alice"`); any one of them matching is enough.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    ids: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn permits(&self, sender_id: &str) -> bool {
        if self.ids.is_empty() || self.ids.contains(sender_id) {
            return true;
        }
        sender_id
            .split('|')
            .map(str::trim)
            .any(|part| !part.is_empty() && self.ids.contains(part))
    }
}

/// Split `text` into chunks of at most `limit` chars, preferring line breaks, then spaces.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.chars().count() > limit {
        // Byte offset just past the first `limit` chars.
        let hard = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..hard];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard);
        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].trim_start_matches(['\n', ' ']);
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_list_empty_permits_everyone() {
        let allow = AllowList::default();
        assert!(allow.permits("anyone"));
    }

    #[test]
    fn allow_list_matches_any_identity_part() {
        let allow = AllowList::new(["alice", "999"]);
        assert!(allow.permits("12345|alice"));
        assert!(allow.permits("999"));
        assert!(!allow.permits("12345|bob"));
        assert!(!allow.permits(""));
    }

    #[test]
    fn split_message_short_text_is_one_chunk() {
        assert_eq!(split_message("hello", 10), vec!["hello"]);
        assert_eq!(split_message("", 10), vec![""]);
    }

    #[test]
    fn split_message_prefers_newlines() {
        let chunks = split_message("first line\nsecond line", 15);
        assert_eq!(chunks, vec!["first line", "second line"]);
    }

    #[test]
    fn split_message_hard_splits_long_words() {
        let chunks = split_message("abcdefghij", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }

    #[test]
    fn split_message_counts_chars_not_bytes() {
        let text = "é".repeat(10);
        let chunks = split_message(&text, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), text);
    }

    #[tokio::test]
    async fn stop_flag_rearms() {
        let flag = StopFlag::new();
        flag.stop();
        flag.stopped().await;
        assert!(flag.is_stopped());
        flag.reset();
        assert!(!flag.is_stopped());
    }
}
