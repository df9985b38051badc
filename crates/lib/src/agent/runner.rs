//! Tool-calling state machine for a single inbound message.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};

use super::context::{user_turn, ContextBuilder};
use crate::bus::{InboundMessage, OutboundMessage};
use crate::config::Config;
use crate::llm::{ChatMessage, Provider, ProviderError, ToolCall};
use crate::session::SessionStore;
use crate::tools::{ToolInvocation, ToolRegistry};

/// Appended to a partial answer when the tool iteration cap stops a turn.
pub const LIMIT_REACHED_MARKER: &str = "[reasoning limit reached]";

const EMPTY_ANSWER: &str = "I've completed processing but have no response to give.";
const NO_PARTIAL_ANSWER: &str = "I could not finish this request within the allowed number of tool steps.";
const FAILURE_TEXT: &str = "Sorry, I ran into a problem while working on that. Please try again.";
const TIMEOUT_TEXT: &str = "Sorry, that took too long and was stopped. Please try again or simplify the request.";

const HELP_TEXT: &str = "Commands:\n/new - start a new conversation\n/help - show this help";

/// Where a turn is. Recorded so a failure can be reported with its stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnStage {
    Received,
    ContextBuilt,
    AwaitingModel,
    ToolRequested,
    ToolExecuted,
    Responded,
    Failed,
}

impl fmt::Display for TurnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TurnStage::Received => "received",
            TurnStage::ContextBuilt => "context_built",
            TurnStage::AwaitingModel => "awaiting_model",
            TurnStage::ToolRequested => "tool_requested",
            TurnStage::ToolExecuted => "tool_executed",
            TurnStage::Responded => "responded",
            TurnStage::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Faults that end a turn abnormally. Tool failures are not here: they go back to the model.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("provider failed: {0}")]
    Provider(#[from] ProviderError),
    #[error("turn timed out after {0:?}")]
    Timeout(Duration),
    #[error("context unavailable: {0}")]
    Context(String),
}

/// Loop limits.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub model: String,
    /// Tool rounds per turn; the model is called at most this many times plus one.
    pub max_tool_iterations: u32,
    /// Prior session messages sent to the model.
    pub memory_window: usize,
    pub turn_timeout: Duration,
}

impl AgentSettings {
    pub fn from_config(config: &Config, model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_tool_iterations: config.agents.max_tool_iterations,
            memory_window: config.agents.memory_window,
            turn_timeout: Duration::from_secs(config.agents.turn_timeout_secs.max(1)),
        }
    }
}

enum TurnState {
    Received,
    ContextBuilt,
    AwaitingModel,
    ToolRequested { content: String, calls: Vec<ToolCall> },
    ToolExecuted,
    Responded(String),
    LimitReached,
}

impl TurnState {
    fn stage(&self) -> TurnStage {
        match self {
            TurnState::Received => TurnStage::Received,
            TurnState::ContextBuilt => TurnStage::ContextBuilt,
            TurnState::AwaitingModel => TurnStage::AwaitingModel,
            TurnState::ToolRequested { .. } => TurnStage::ToolRequested,
            TurnState::ToolExecuted => TurnStage::ToolExecuted,
            TurnState::Responded(_) | TurnState::LimitReached => TurnStage::Responded,
        }
    }
}

/// Result of a completed turn.
struct TurnOutcome {
    text: String,
    iterations: u32,
    tool_calls: Vec<Value>,
    limit_reached: bool,
}

/// Shared so the timeout path can still see how far the turn got.
struct StageTracker(Mutex<TurnStage>);

impl StageTracker {
    fn new() -> Self {
        Self(Mutex::new(TurnStage::Received))
    }

    fn set(&self, stage: TurnStage) {
        if let Ok(mut s) = self.0.lock() {
            *s = stage;
        }
    }

    fn get(&self) -> TurnStage {
        self.0.lock().map(|s| *s).unwrap_or(TurnStage::Failed)
    }
}

pub struct AgentLoop {
    provider: Arc<dyn Provider>,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    context: Arc<ContextBuilder>,
    settings: AgentSettings,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: Arc<ToolRegistry>,
        sessions: Arc<SessionStore>,
        context: Arc<ContextBuilder>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            sessions,
            context,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Produce the single reply for `msg`: an answer, a limit-reached partial answer, or a failure notice.
    pub async fn handle(&self, msg: &InboundMessage) -> OutboundMessage {
        if !msg.is_cron() {
            if let Some(reply) = self.handle_command(msg).await {
                return reply;
            }
        }

        let stage = StageTracker::new();
        let limit = self.settings.turn_timeout;
        let result = match tokio::time::timeout(limit, self.run_turn(msg, &stage)).await {
            Ok(r) => r,
            Err(_) => Err(AgentError::Timeout(limit)),
        };

        match result {
            Ok(outcome) => {
                log::debug!(
                    "agent: session {} message {} answered after {} tool rounds",
                    msg.session_id,
                    msg.id,
                    outcome.iterations
                );
                OutboundMessage::reply_to(msg, outcome.text).with_payload(json!({
                    "iterations": outcome.iterations,
                    "toolCalls": outcome.tool_calls,
                    "limitReached": outcome.limit_reached,
                }))
            }
            Err(err) => {
                let failed_at = stage.get();
                stage.set(TurnStage::Failed);
                log::warn!(
                    "agent: turn failed for session {} message {} at stage {}: {}",
                    msg.session_id,
                    msg.id,
                    failed_at,
                    err
                );
                let text = match err {
                    AgentError::Timeout(_) => TIMEOUT_TEXT,
                    _ => FAILURE_TEXT,
                };
                OutboundMessage::reply_to(msg, text).with_payload(json!({
                    "error": err.to_string(),
                    "stage": failed_at.to_string(),
                }))
            }
        }
    }

    /// Slash commands answered without the model.
    async fn handle_command(&self, msg: &InboundMessage) -> Option<OutboundMessage> {
        let cmd = msg.text.trim().to_lowercase();
        match cmd.as_str() {
            "/new" => {
                let text = match self.sessions.clear(&msg.session_id).await {
                    Ok(()) => "New session started.",
                    Err(e) => {
                        log::warn!("agent: clearing session {} failed: {}", msg.session_id, e);
                        "Could not reset the session; history was kept."
                    }
                };
                Some(OutboundMessage::reply_to(msg, text))
            }
            "/help" => Some(OutboundMessage::reply_to(msg, HELP_TEXT)),
            _ => None,
        }
    }

    async fn run_turn(
        &self,
        msg: &InboundMessage,
        stage: &StageTracker,
    ) -> Result<TurnOutcome, AgentError> {
        let definitions = self.tools.definitions();
        let mut state = TurnState::Received;
        let mut conversation: Vec<ChatMessage> = Vec::new();
        // Turns to persist once the turn completes.
        let mut new_turns: Vec<ChatMessage> = Vec::new();
        let mut iterations: u32 = 0;
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut tool_log: Vec<Value> = Vec::new();
        let mut partial = String::new();

        loop {
            stage.set(state.stage());
            state = match state {
                TurnState::Received => {
                    let history = self
                        .sessions
                        .history(&msg.session_id, self.settings.memory_window)
                        .await
                        .map_err(|e| AgentError::Context(e.to_string()))?;
                    conversation = self.context.build_messages(history, msg);
                    new_turns.push(user_turn(msg));
                    TurnState::ContextBuilt
                }
                TurnState::ContextBuilt | TurnState::ToolExecuted => TurnState::AwaitingModel,
                TurnState::AwaitingModel => {
                    let reply = self
                        .provider
                        .chat(&self.settings.model, &conversation, &definitions)
                        .await?;
                    if reply.tool_calls.is_empty() {
                        TurnState::Responded(reply.content)
                    } else {
                        TurnState::ToolRequested {
                            content: reply.content,
                            calls: reply.tool_calls,
                        }
                    }
                }
                TurnState::ToolRequested { content, mut calls } => {
                    if !content.trim().is_empty() {
                        partial = content.clone();
                    }
                    if iterations >= self.settings.max_tool_iterations {
                        TurnState::LimitReached
                    } else {
                        iterations += 1;
                        for (i, call) in calls.iter_mut().enumerate() {
                            if call.id.is_none() {
                                call.id = Some(format!("call_{}_{}", iterations, i));
                            }
                        }
                        let assistant = ChatMessage::assistant_with_calls(content, calls.clone());
                        conversation.push(assistant.clone());
                        new_turns.push(assistant);
                        for call in &calls {
                            let result = self.run_tool(call, &mut attempts, &mut tool_log, msg).await;
                            let turn = ChatMessage::tool_result(call, result);
                            conversation.push(turn.clone());
                            new_turns.push(turn);
                        }
                        TurnState::ToolExecuted
                    }
                }
                TurnState::Responded(text) => {
                    let text = if text.trim().is_empty() {
                        EMPTY_ANSWER.to_string()
                    } else {
                        text
                    };
                    new_turns.push(ChatMessage::assistant(text.clone()));
                    self.persist(&msg.session_id, &new_turns).await;
                    return Ok(TurnOutcome {
                        text,
                        iterations,
                        tool_calls: tool_log,
                        limit_reached: false,
                    });
                }
                TurnState::LimitReached => {
                    log::info!(
                        "agent: session {} hit the tool iteration cap ({})",
                        msg.session_id,
                        self.settings.max_tool_iterations
                    );
                    let answer = if partial.trim().is_empty() {
                        NO_PARTIAL_ANSWER.to_string()
                    } else {
                        partial.trim().to_string()
                    };
                    let text = format!("{}\n\n{}", answer, LIMIT_REACHED_MARKER);
                    new_turns.push(ChatMessage::assistant(text.clone()));
                    self.persist(&msg.session_id, &new_turns).await;
                    return Ok(TurnOutcome {
                        text,
                        iterations,
                        tool_calls: tool_log,
                        limit_reached: true,
                    });
                }
            };
        }
    }

    /// Run one tool call. Any failure becomes the result text so the model can adapt.
    async fn run_tool(
        &self,
        call: &ToolCall,
        attempts: &mut HashMap<String, u32>,
        tool_log: &mut Vec<Value>,
        msg: &InboundMessage,
    ) -> String {
        let name = call.function.name.clone();
        let attempt = attempts.entry(name.clone()).or_insert(0);
        *attempt += 1;
        let invocation = ToolInvocation {
            tool_name: name.clone(),
            arguments: call.function.arguments.clone(),
            attempt_count: *attempt,
        };
        log::debug!(
            "agent: session {} calling tool {} (attempt {})",
            msg.session_id,
            name,
            invocation.attempt_count
        );
        let (result, ok) = match self.tools.execute(&invocation).await {
            Ok(out) => (out, true),
            Err(e) => {
                log::warn!("agent: tool {} failed in session {}: {}", name, msg.session_id, e);
                (format!("Error: {}", e), false)
            }
        };
        tool_log.push(json!({
            "name": name,
            "attempt": invocation.attempt_count,
            "ok": ok,
        }));
        result
    }

    async fn persist(&self, session_id: &str, turns: &[ChatMessage]) {
        if let Err(e) = self.sessions.append(session_id, turns).await {
            log::warn!("agent: could not save session {}: {}", session_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatReply, ToolDefinition};
    use crate::tools::{Tool, ToolError};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies from a script; the last reply repeats once the script runs out.
    struct Scripted {
        replies: Mutex<VecDeque<ChatReply>>,
        calls: AtomicUsize,
        seen: Mutex<Vec<Vec<ChatMessage>>>,
    }

    impl Scripted {
        fn new(replies: Vec<ChatReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
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
            self.calls.fetch_add(1, Ordering::SeqCst);
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

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _args: Value) -> Result<String, ToolError> {
            Err(ToolError::Execution("upstream unavailable".into()))
        }
    }

    fn agent(provider: Arc<dyn Provider>, max_tool_iterations: u32) -> AgentLoop {
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Failing));
        AgentLoop::new(
            provider,
            Arc::new(tools),
            Arc::new(SessionStore::new()),
            Arc::new(ContextBuilder::bare()),
            AgentSettings {
                model: "test".into(),
                max_tool_iterations,
                memory_window: 50,
                turn_timeout: Duration::from_secs(5),
            },
        )
    }

    fn flaky_call() -> ChatReply {
        ChatReply::calls(vec![ToolCall::new("flaky", json!({}))])
    }

    #[tokio::test]
    async fn iteration_cap_bounds_model_calls() {
        let provider = Scripted::new(vec![flaky_call()]);
        let agent = agent(provider.clone(), 3);
        let msg = InboundMessage::new("telegram", "1", "u", "loop forever");
        let out = agent.handle(&msg).await;
        assert_eq!(provider.calls.load(Ordering::SeqCst), 4);
        assert!(out.text.ends_with(LIMIT_REACHED_MARKER));
        let payload = out.structured_payload.unwrap();
        assert_eq!(payload["limitReached"], true);
        assert_eq!(payload["iterations"], 3);
        assert_eq!(out.in_reply_to, msg.id);
    }

    #[tokio::test]
    async fn tool_failure_is_fed_back_to_model() {
        let provider = Scripted::new(vec![flaky_call(), ChatReply::text("worked around it")]);
        let agent = agent(provider.clone(), 5);
        let out = agent.handle(&InboundMessage::new("telegram", "1", "u", "try")).await;
        assert_eq!(out.text, "worked around it");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
        let seen = provider.seen.lock().unwrap();
        let tool_turn = seen[1].last().unwrap();
        assert_eq!(tool_turn.role, "tool");
        assert!(tool_turn.content.contains("upstream unavailable"));
        let payload = out.structured_payload.unwrap();
        assert_eq!(payload["toolCalls"][0]["ok"], false);
    }

    #[tokio::test]
    async fn unknown_tool_is_reported_not_fatal() {
        let provider = Scripted::new(vec![
            ChatReply::calls(vec![ToolCall::new("does_not_exist", json!({}))]),
            ChatReply::text("ok"),
        ]);
        let agent = agent(provider.clone(), 5);
        let out = agent.handle(&InboundMessage::new("t", "1", "u", "x")).await;
        assert_eq!(out.text, "ok");
        let seen = provider.seen.lock().unwrap();
        assert!(seen[1].last().unwrap().content.contains("unknown tool: does_not_exist"));
    }

    #[tokio::test]
    async fn provider_error_yields_failure_reply() {
        let provider = Scripted::new(Vec::new());
        let agent = agent(provider, 5);
        let out = agent.handle(&InboundMessage::new("t", "1", "u", "x")).await;
        assert_eq!(out.text, FAILURE_TEXT);
        assert_eq!(out.structured_payload.unwrap()["stage"], "awaiting_model");
    }

    #[tokio::test]
    async fn history_carries_across_turns_and_new_clears_it() {
        let provider = Scripted::new(vec![ChatReply::text("first"), ChatReply::text("second")]);
        let agent = agent(provider.clone(), 5);
        agent.handle(&InboundMessage::new("t", "1", "u", "one")).await;
        agent.handle(&InboundMessage::new("t", "1", "u", "two")).await;
        {
            let seen = provider.seen.lock().unwrap();
            let contents: Vec<&str> = seen[1].iter().skip(1).map(|m| m.content.as_str()).collect();
            assert_eq!(contents, vec!["one", "first", "two"]);
        }
        let reply = agent.handle(&InboundMessage::new("t", "1", "u", "/new")).await;
        assert_eq!(reply.text, "New session started.");
        assert!(agent.sessions().history("t:1", 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn slow_turn_times_out() {
        struct Slow;
        #[async_trait]
        impl Provider for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            async fn chat(
                &self,
                _model: &str,
                _messages: &[ChatMessage],
                _tools: &[ToolDefinition],
            ) -> Result<ChatReply, ProviderError> {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(ChatReply::text("late"))
            }
        }
        let mut agent = agent(Arc::new(Slow), 5);
        agent.settings.turn_timeout = Duration::from_millis(50);
        let out = agent.handle(&InboundMessage::new("t", "1", "u", "x")).await;
        assert_eq!(out.text, TIMEOUT_TEXT);
        assert_eq!(out.structured_payload.unwrap()["stage"], "awaiting_model");
    }

    #[tokio::test]
    async fn timed_out_turn_stops_its_tool() {
        use std::sync::atomic::AtomicBool;

        struct Slow(Arc<AtomicBool>);
        #[async_trait]
        impl Tool for Slow {
            fn name(&self) -> &str {
                "slow"
            }
            fn description(&self) -> &str {
                "Sleeps, then records that it finished"
            }
            fn parameters(&self) -> Value {
                json!({"type": "object", "properties": {}})
            }
            async fn execute(&self, _args: Value) -> Result<String, ToolError> {
                tokio::time::sleep(Duration::from_millis(300)).await;
                self.0.store(true, Ordering::SeqCst);
                Ok("done".into())
            }
        }

        let finished = Arc::new(AtomicBool::new(false));
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Slow(finished.clone())));
        let provider = Scripted::new(vec![ChatReply::calls(vec![ToolCall::new("slow", json!({}))])]);
        let agent = AgentLoop::new(
            provider,
            Arc::new(tools),
            Arc::new(SessionStore::new()),
            Arc::new(ContextBuilder::bare()),
            AgentSettings {
                model: "test".into(),
                max_tool_iterations: 5,
                memory_window: 50,
                turn_timeout: Duration::from_millis(50),
            },
        );
        let out = agent.handle(&InboundMessage::new("t", "1", "u", "x")).await;
        assert_eq!(out.text, TIMEOUT_TEXT);
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
