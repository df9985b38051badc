//! Ollama API client (http://127.0.0.1:11434 by default).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ChatReply, Provider, ProviderError, ToolCall, ToolDefinition};

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// Client for the Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    /// GET /api/tags: names of the locally available models.
    pub async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/api/tags", self.base_url);
        let res = self.client.get(&url).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{} {}", status, body)));
        }
        let data: TagsResponse = res.json().await?;
        Ok(data
            .models
            .unwrap_or_default()
            .into_iter()
            .map(|m| m.name)
            .collect())
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    /// POST /api/chat, non-streaming, with tools for function calling.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatReply, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model,
            messages: messages.iter().map(OllamaMessage::from).collect(),
            stream: false,
            tools: if tools.is_empty() { None } else { Some(tools) },
        };
        let res = self.client.post(&url).json(&body).send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{} {}", status, body)));
        }
        let data: ChatResponse = res
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(data.into_reply())
    }
}

/// Wire form of a message; Ollama keys tool results by `tool_name`, not call id.
#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_name: Option<String>,
}

impl From<&ChatMessage> for OllamaMessage {
    fn from(m: &ChatMessage) -> Self {
        Self {
            role: m.role.clone(),
            content: m.content.clone(),
            tool_calls: m.tool_calls.clone(),
            tool_name: m.tool_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Option<Vec<ModelEntry>>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [ToolDefinition]>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: Option<OllamaMessage>,
}

impl ChatResponse {
    fn into_reply(self) -> ChatReply {
        match self.message {
            Some(m) => ChatReply {
                content: m.content,
                tool_calls: m.tool_calls.unwrap_or_default(),
            },
            None => ChatReply::default(),
        }
    }
}
