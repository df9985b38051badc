//! OpenAI-compatible chat completions client (OpenAI, LM Studio, vLLM, ...).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    ChatMessage, ChatReply, Provider, ProviderError, ToolCall, ToolCallFunction, ToolDefinition,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone)]
pub struct OpenAiProvider {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<String>, api_key: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    /// POST {base}/chat/completions, non-streaming.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ChatReply, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = OpenAiChatRequest {
            model,
            messages: messages_to_openai(messages),
            tools: if tools.is_empty() {
                None
            } else {
                Some(tools.iter().map(OpenAiTool::from).collect())
            },
        };
        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{} {}", status, body)));
        }
        let data: OpenAiChatResponse = res
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(openai_response_to_reply(data))
    }
}

#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum OpenAiMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_calls: Option<Vec<OpenAiToolCallRef>>,
    },
    Tool {
        content: String,
        tool_call_id: String,
    },
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallRef {
    id: String,
    #[serde(rename = "type")]
    typ: String,
    function: OpenAiToolCallFunctionRef,
}

#[derive(Debug, Serialize)]
struct OpenAiToolCallFunctionRef {
    name: String,
    /// JSON-encoded arguments string.
    arguments: String,
}

#[derive(Debug, Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    typ: String,
    function: OpenAiToolFunction,
}

#[derive(Debug, Serialize)]
struct OpenAiToolFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    parameters: serde_json::Value,
}

impl From<&ToolDefinition> for OpenAiTool {
    fn from(t: &ToolDefinition) -> Self {
        Self {
            typ: t.typ.clone(),
            function: OpenAiToolFunction {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                parameters: t.function.parameters.clone(),
            },
        }
    }
}

/// Convert neutral messages to OpenAI form. Calls without an id get positional ids
/// (`call_N`), and tool results without an id take the oldest unanswered one.
fn messages_to_openai(messages: &[ChatMessage]) -> Vec<OpenAiMessage> {
    let mut out = Vec::with_capacity(messages.len());
    let mut pending_ids: Vec<String> = Vec::new();
    let mut next_idx = 0;

    for m in messages {
        match m.role.as_str() {
            "system" => out.push(OpenAiMessage::System {
                content: m.content.clone(),
            }),
            "assistant" => {
                let tool_calls = m.tool_calls.as_ref().map(|tcs| {
                    pending_ids.clear();
                    tcs.iter()
                        .map(|tc| {
                            let id = tc.id.clone().unwrap_or_else(|| {
                                let id = format!("call_{}", next_idx);
                                next_idx += 1;
                                id
                            });
                            pending_ids.push(id.clone());
                            OpenAiToolCallRef {
                                id,
                                typ: if tc.typ.is_empty() {
                                    "function".to_string()
                                } else {
                                    tc.typ.clone()
                                },
                                function: OpenAiToolCallFunctionRef {
                                    name: tc.function.name.clone(),
                                    arguments: encode_arguments(&tc.function.arguments),
                                },
                            }
                        })
                        .collect()
                });
                out.push(OpenAiMessage::Assistant {
                    content: m.content.clone(),
                    tool_calls,
                });
            }
            "tool" => {
                let id = match &m.tool_call_id {
                    Some(id) => {
                        pending_ids.retain(|p| p != id);
                        id.clone()
                    }
                    None if !pending_ids.is_empty() => pending_ids.remove(0),
                    None => {
                        let id = format!("call_{}", next_idx);
                        next_idx += 1;
                        id
                    }
                };
                out.push(OpenAiMessage::Tool {
                    content: m.content.clone(),
                    tool_call_id: id,
                });
            }
            _ => {
                pending_ids.clear();
                out.push(OpenAiMessage::User {
                    content: m.content.clone(),
                });
            }
        }
    }
    out
}

fn encode_arguments(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "{}".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Option<Vec<OpenAiChoice>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: Option<OpenAiResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiResponseToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseToolCall {
    id: Option<String>,
    #[serde(rename = "type")]
    typ: Option<String>,
    function: Option<OpenAiResponseToolCallFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponseToolCallFunction {
    name: Option<String>,
    arguments: Option<String>,
}

fn openai_response_to_reply(data: OpenAiChatResponse) -> ChatReply {
    let Some(message) = data
        .choices
        .and_then(|c| c.into_iter().next())
        .and_then(|c| c.message)
    else {
        return ChatReply::default();
    };
    let tool_calls = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .filter_map(|tc| {
            let function = tc.function?;
            let name = function.name?;
            // Unparseable argument strings are passed through as strings; the agent reports them to the model.
            let arguments = function
                .arguments
                .map(|s| serde_json::from_str(&s).unwrap_or(serde_json::Value::String(s)))
                .unwrap_or(serde_json::Value::Null);
            Some(ToolCall {
                id: tc.id,
                typ: tc.typ.unwrap_or_else(|| "function".to_string()),
                function: ToolCallFunction { name, arguments },
            })
        })
        .collect();
    ChatReply {
        content: message.content.unwrap_or_default(),
        tool_calls,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_ids_to_calls_and_results() {
        let call = ToolCall::new("web_search", serde_json::json!({"query": "x"}));
        let messages = vec![
            ChatMessage::system("sys"),
            ChatMessage::user("hi"),
            ChatMessage::assistant_with_calls("", vec![call.clone()]),
            ChatMessage::tool_result(&call, "result"),
        ];
        let out = serde_json::to_value(messages_to_openai(&messages)).unwrap();
        assert_eq!(out[2]["role"], "assistant");
        assert_eq!(out[2]["tool_calls"][0]["id"], "call_0");
        assert_eq!(out[2]["tool_calls"][0]["function"]["arguments"], r#"{"query":"x"}"#);
        assert_eq!(out[3]["role"], "tool");
        assert_eq!(out[3]["tool_call_id"], "call_0");
    }

    #[test]
    fn parses_tool_calls_from_response() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":null,
            "tool_calls":[{"id":"abc","type":"function","function":{"name":"web_fetch","arguments":"{\"url\":\"https://example.com\"}"}}]}}]}"#;
        let data: OpenAiChatResponse = serde_json::from_str(json).unwrap();
        let reply = openai_response_to_reply(data);
        assert_eq!(reply.content, "");
        assert_eq!(reply.tool_calls[0].id.as_deref(), Some("abc"));
        assert_eq!(reply.tool_calls[0].function.arguments["url"], "https://example.com");
    }
}
