//! Model providers: one capability ("send conversation, get text or tool calls") behind [`Provider`].
//!
//! Providers are built once at startup into an explicit [`ProviderRegistry`] and handed to the agent.

mod ollama;
mod openai;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{self, Config, ProviderKind};

pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("provider api error: {0}")]
    Api(String),
    #[error("provider response could not be decoded: {0}")]
    Decode(String),
    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

/// One tool/function call requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id (OpenAI); the agent fills one in when the provider has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub typ: String,
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Arguments as JSON object or string (model-dependent).
    #[serde(default)]
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: None,
            typ: "function".to_string(),
            function: ToolCallFunction {
                name: name.into(),
                arguments,
            },
        }
    }
}

/// One conversation turn in provider-neutral form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// When role is "tool", the name of the tool this result is for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// When role is "tool", the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
            tool_name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// Assistant turn that requested tools.
    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(calls),
            ..Self::plain("assistant", content)
        }
    }

    /// Result of one tool call, fed back to the model.
    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            tool_name: Some(call.function.name.clone()),
            tool_call_id: call.id.clone(),
            ..Self::plain("tool", content)
        }
    }
}

/// Tool definition advertised to the model (function-calling).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub typ: String,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

/// Model answer: final text, or tool calls to run before asking again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ChatReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn calls(tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: String::new(),
            tool_calls,
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatReply, ProviderError>;
}

/// Providers by name plus the default backend and model.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_backend: String,
    default_model: String,
}

const FALLBACK_MODEL: &str = "llama3.2:latest";

impl ProviderRegistry {
    pub fn new(default_backend: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_backend: default_backend.into(),
            default_model: default_model.into(),
        }
    }

    /// Ollama is always available; the OpenAI-compatible provider is added when a key or base URL is configured.
    pub fn from_config(config: &Config) -> Self {
        let model = config
            .agents
            .default_model
            .clone()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_MODEL.to_string());
        let mut registry = Self::new(config.agents.default_backend.as_str(), model);
        registry.register(Arc::new(OllamaProvider::new(
            config.providers.ollama.base_url.clone(),
        )));
        let key = config::resolve_openai_key(config);
        if key.is_some()
            || config.providers.openai.base_url.is_some()
            || config.agents.default_backend == ProviderKind::Openai
        {
            registry.register(Arc::new(OpenAiProvider::new(
                config.providers.openai.base_url.clone(),
                key,
            )));
        }
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// The configured default provider.
    pub fn default_provider(&self) -> Result<Arc<dyn Provider>, ProviderError> {
        self.get(&self.default_backend)
            .ok_or_else(|| ProviderError::NotConfigured(self.default_backend.clone()))
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_has_ollama() {
        let registry = ProviderRegistry::from_config(&Config::default());
        assert_eq!(registry.default_provider().unwrap().name(), "ollama");
        assert_eq!(registry.default_model(), FALLBACK_MODEL);
    }

    #[test]
    fn missing_default_backend_is_not_configured() {
        let registry = ProviderRegistry::new("openai", "gpt-4o-mini");
        assert!(matches!(
            registry.default_provider(),
            Err(ProviderError::NotConfigured(ref n)) if n == "openai"
        ));
    }

    #[test]
    fn tool_result_carries_call_identity() {
        let mut call = ToolCall::new("web_search", serde_json::json!({"query": "rust"}));
        call.id = Some("call_0".into());
        let msg = ChatMessage::tool_result(&call, "results");
        assert_eq!(msg.role, "tool");
        assert_eq!(msg.tool_name.as_deref(), Some("web_search"));
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_0"));
    }
}
