//! Shared fixtures: temp config directories and in-process providers.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use banobot::config::Config;
use banobot::llm::{ChatMessage, ChatReply, Provider, ProviderError, ToolDefinition};

/// Temp dir with `skills/`, `workspace/`, and a `config.json`; config points sessions
/// in-memory and the cron store into the temp dir.
pub fn temp_setup(name: &str) -> (Config, PathBuf, PathBuf) {
    let dir = std::env::temp_dir().join(format!("banobot-{}-{}", name, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(dir.join("skills")).expect("create skills dir");
    std::fs::create_dir_all(dir.join("workspace")).expect("create workspace dir");
    let config_path = dir.join("config.json");
    std::fs::write(&config_path, "{}").expect("write config.json");

    let mut config = Config::default();
    config.agents.workspace = Some(dir.join("workspace"));
    config.agents.sessions_dir = Some(PathBuf::new());
    config.agents.turn_timeout_secs = 10;
    config.cron.store_path = Some(dir.join("cron").join("jobs.json"));
    (config, config_path, dir)
}

/// Replies from a script in order; the last reply repeats once the script runs out.
pub struct Scripted {
    replies: Mutex<VecDeque<ChatReply>>,
    pub seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl Scripted {
    pub fn new(replies: Vec<ChatReply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Provider for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatReply, ProviderError> {
        self.seen.lock().unwrap().push(messages.to_vec());
        let mut replies = self.replies.lock().unwrap();
        if replies.len() > 1 {
            Ok(replies.pop_front().unwrap())
        } else {
            replies
                .front()
                .cloned()
                .ok_or_else(|| ProviderError::Api("script exhausted".into()))
        }
    }
}

/// Answers with the user text and the number of earlier user turns it saw.
/// A user text of the form `sleep:<ms>:<label>` waits first.
pub struct Echo;

#[async_trait]
impl Provider for Echo {
    fn name(&self) -> &str {
        "echo"
    }

    async fn chat(
        &self,
        _model: &str,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ChatReply, ProviderError> {
        let users: Vec<&ChatMessage> = messages.iter().filter(|m| m.role == "user").collect();
        let last = users.last().map(|m| m.content.clone()).unwrap_or_default();
        let mut label = last.clone();
        if let Some(rest) = last.strip_prefix("sleep:") {
            if let Some((ms, l)) = rest.split_once(':') {
                let ms: u64 = ms.parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                label = l.to_string();
            }
        }
        Ok(ChatReply::text(format!("{} (after {})", label, users.len().saturating_sub(1))))
    }
}
