//! Conversation sessions: ordered message history keyed by session id.
//!
//! Held in memory and, when a directory is configured, appended to one JSONL file per session
//! so history survives restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::llm::{ChatMessage, ToolCall};

/// Unique session identifier (opaque string).
pub type SessionId = String;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session encoding: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A single stored message (role + content; assistant may have tool_calls, tool results have tool_name).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl From<&ChatMessage> for SessionMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role.clone(),
            content: m.content.clone(),
            tool_calls: m.tool_calls.clone(),
            tool_name: m.tool_name.clone(),
            tool_call_id: m.tool_call_id.clone(),
            timestamp: Utc::now(),
        }
    }
}

impl From<&SessionMessage> for ChatMessage {
    fn from(m: &SessionMessage) -> Self {
        ChatMessage {
            role: m.role.clone(),
            content: m.content.clone(),
            tool_calls: m.tool_calls.clone(),
            tool_name: m.tool_name.clone(),
            tool_call_id: m.tool_call_id.clone(),
        }
    }
}

/// A session: id and ordered message history.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub messages: Vec<SessionMessage>,
    pub updated_at: DateTime<Utc>,
}

/// Session store. The agent serializes turns per session, so a session is never appended to concurrently.
pub struct SessionStore {
    inner: RwLock<HashMap<SessionId, Session>>,
    dir: Option<PathBuf>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore {
    /// In-memory only.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            dir: None,
        }
    }

    /// Persist sessions as `<dir>/<id>.jsonl`.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
            dir: Some(dir.into()),
        }
    }

    fn file_for(&self, id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.jsonl", safe_file_stem(id))))
    }

    /// Load from disk on first access; empty session when there is no file.
    async fn ensure_loaded(&self, id: &str) -> Result<(), SessionError> {
        if self.inner.read().await.contains_key(id) {
            return Ok(());
        }
        let messages = match self.file_for(id) {
            Some(path) => read_jsonl(&path).await?,
            None => Vec::new(),
        };
        let updated_at = messages.last().map(|m| m.timestamp).unwrap_or_else(Utc::now);
        self.inner
            .write()
            .await
            .entry(id.to_string())
            .or_insert(Session {
                id: id.to_string(),
                messages,
                updated_at,
            });
        Ok(())
    }

    /// Return a clone of the session if it exists (in memory or on disk).
    pub async fn get(&self, id: &str) -> Result<Option<Session>, SessionError> {
        self.ensure_loaded(id).await?;
        Ok(self
            .inner
            .read()
            .await
            .get(id)
            .filter(|s| !s.messages.is_empty())
            .cloned())
    }

    /// Last `window` messages as model turns. The window never opens on a tool result or a
    /// dangling assistant tool call: leading messages before the first user turn are dropped.
    pub async fn history(&self, id: &str, window: usize) -> Result<Vec<ChatMessage>, SessionError> {
        self.ensure_loaded(id).await?;
        let guard = self.inner.read().await;
        let Some(session) = guard.get(id) else {
            return Ok(Vec::new());
        };
        let start = session.messages.len().saturating_sub(window);
        let tail = &session.messages[start..];
        let first_user = tail.iter().position(|m| m.role == "user").unwrap_or(tail.len());
        Ok(tail[first_user..].iter().map(ChatMessage::from).collect())
    }

    /// Append messages in order, persisting them when a directory is configured.
    pub async fn append(&self, id: &str, messages: &[ChatMessage]) -> Result<(), SessionError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.ensure_loaded(id).await?;
        let stored: Vec<SessionMessage> = messages.iter().map(SessionMessage::from).collect();
        if let Some(path) = self.file_for(id) {
            append_jsonl(&path, &stored).await?;
        }
        let mut guard = self.inner.write().await;
        if let Some(session) = guard.get_mut(id) {
            session.updated_at = Utc::now();
            session.messages.extend(stored);
        }
        Ok(())
    }

    /// Drop all history for the session (memory and disk).
    pub async fn clear(&self, id: &str) -> Result<(), SessionError> {
        self.inner.write().await.remove(id);
        if let Some(path) = self.file_for(id) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// File-system safe stem for a session id (`telegram:42` -> `telegram_3a42`). Every byte outside
/// `[A-Za-z0-9.-]`, `_` included, becomes `_` plus two hex digits, so distinct ids never share a file.
fn safe_file_stem(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}

async fn read_jsonl(path: &Path) -> Result<Vec<SessionMessage>, SessionError> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for (n, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<SessionMessage>(line) {
            Ok(m) => out.push(m),
            Err(e) => log::warn!("session: skipping bad line {} in {}: {}", n + 1, path.display(), e),
        }
    }
    Ok(out)
}

async fn append_jsonl(path: &Path, messages: &[SessionMessage]) -> Result<(), SessionError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut buf = String::new();
    for m in messages {
        buf.push_str(&serde_json::to_string(m)?);
        buf.push('\n');
    }
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(buf.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn history_is_windowed_and_starts_at_user_turn() {
        let store = SessionStore::new();
        let call = ToolCall::new("web_search", serde_json::json!({"query": "q"}));
        store
            .append(
                "s1",
                &[
                    ChatMessage::user("one"),
                    ChatMessage::assistant_with_calls("", vec![call.clone()]),
                    ChatMessage::tool_result(&call, "hits"),
                    ChatMessage::assistant("answer one"),
                    ChatMessage::user("two"),
                    ChatMessage::assistant("answer two"),
                ],
            )
            .await
            .unwrap();
        let all = store.history("s1", 50).await.unwrap();
        assert_eq!(all.len(), 6);
        // A window of 4 would open on the tool result; it is trimmed to the next user turn.
        let recent = store.history("s1", 4).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["two", "answer two"]);
        assert!(store.history("other", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persists_and_reloads_jsonl() {
        let dir = std::env::temp_dir().join(format!("banobot-sessions-{}", uuid::Uuid::new_v4()));
        {
            let store = SessionStore::with_dir(&dir);
            store
                .append("telegram:42", &[ChatMessage::user("hi"), ChatMessage::assistant("hello")])
                .await
                .unwrap();
        }
        assert!(dir.join("telegram_3a42.jsonl").exists());
        let reopened = SessionStore::with_dir(&dir);
        let history = reopened.history("telegram:42", 10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "hello");

        reopened.clear("telegram:42").await.unwrap();
        assert!(!dir.join("telegram_3a42.jsonl").exists());
        assert!(reopened.get("telegram:42").await.unwrap().is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
    #[test]
    fn file_stems_do_not_collide() {
        assert_eq!(safe_file_stem("telegram:42"), "telegram_3a42");
        assert_eq!(safe_file_stem("a_b"), "a_5fb");
        assert_ne!(safe_file_stem("a:b"), safe_file_stem("a_b"));
        assert_ne!(safe_file_stem("a/b"), safe_file_stem("a_2fb"));
        assert!(!safe_file_stem("../x").contains('/'));
    }

    #[tokio::test]
    async fn similar_ids_keep_separate_history_on_disk() {
        let dir = std::env::temp_dir().join(format!("banobot-sessions-{}", uuid::Uuid::new_v4()));
        {
            let store = SessionStore::with_dir(&dir);
            store.append("a:b", &[ChatMessage::user("colon")]).await.unwrap();
            store.append("a_b", &[ChatMessage::user("underscore")]).await.unwrap();
        }
        let reopened = SessionStore::with_dir(&dir);
        let colon = reopened.history("a:b", 10).await.unwrap();
        let underscore = reopened.history("a_b", 10).await.unwrap();
        assert_eq!(colon.len(), 1);
        assert_eq!(colon[0].content, "colon");
        assert_eq!(underscore.len(), 1);
        assert_eq!(underscore[0].content, "underscore");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
