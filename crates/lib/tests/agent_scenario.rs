//! End to end through the runtime: loopback channel -> bus -> agent (scripted model, stub search tool)
//! -> bus -> channel manager -> loopback channel.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use banobot::bus::{InboundMessage, OutboundMessage};
use banobot::channels::{LoopbackChannel, LoopbackHandle};
use banobot::gateway::{build_runtime, Runtime, RuntimeOptions};
use banobot::llm::{ChatReply, Provider, ToolCall};
use banobot::tools::{Tool, ToolError, ToolRegistry};
use serde_json::{json, Value};

/// Stands in for `web_search` without touching the network.
struct StubSearch {
    calls: AtomicUsize,
}

#[async_trait]
impl Tool for StubSearch {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "query": { "type": "string" } },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<String, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let query = args["query"].as_str().unwrap_or_default();
        Ok(json!({
            "query": query,
            "results": [{
                "title": "What is Ownership?",
                "url": "https://doc.rust-lang.org/book/ch04-01-what-is-ownership.html",
                "snippet": "Each value in Rust has an owner."
            }]
        })
        .to_string())
    }
}

async fn start(
    provider: Arc<dyn Provider>,
    tools: ToolRegistry,
    allow_from: Vec<String>,
) -> (Runtime, LoopbackHandle, std::path::PathBuf) {
    let (config, config_path, dir) = common::temp_setup("agent");
    let runtime = build_runtime(
        config,
        &config_path,
        RuntimeOptions {
            provider: Some(provider),
            tools: Some(tools),
            configured_channels: false,
            cron: false,
        },
    )
    .await
    .expect("build runtime");
    let (channel, handle) = LoopbackChannel::new("loop");
    runtime
        .register_channel(channel, allow_from)
        .await
        .expect("register loopback");
    runtime.start().await;
    (runtime, handle, dir)
}

async fn next_reply(handle: &mut LoopbackHandle) -> OutboundMessage {
    tokio::time::timeout(Duration::from_secs(5), handle.recv())
        .await
        .expect("reply within 5s")
        .expect("channel open")
}

#[tokio::test]
async fn question_answered_after_search_tool_call() {
    let provider = common::Scripted::new(vec![
        ChatReply::calls(vec![ToolCall::new(
            "web_search",
            json!({ "query": "rust ownership rules" }),
        )]),
        ChatReply::text("Each value has a single owner."),
    ]);
    let search = Arc::new(StubSearch {
        calls: AtomicUsize::new(0),
    });
    let mut tools = ToolRegistry::new();
    tools.register(search.clone());

    let (runtime, mut handle, dir) = start(provider.clone(), tools, Vec::new()).await;
    let id = handle
        .send_message(
            InboundMessage::new("loop", "chat-1", "alice", "search for rust ownership rules")
                .with_session("s1"),
        )
        .unwrap();

    let reply = next_reply(&mut handle).await;
    assert_eq!(reply.in_reply_to, id);
    assert_eq!(reply.chat_id, "chat-1");
    assert_eq!(reply.session_id, "s1");
    assert_eq!(reply.text, "Each value has a single owner.");
    let payload = reply.structured_payload.expect("payload");
    assert_eq!(payload["iterations"], 1);
    assert_eq!(payload["limitReached"], false);
    assert_eq!(payload["toolCalls"][0]["name"], "web_search");
    assert_eq!(search.calls.load(Ordering::SeqCst), 1);

    // Second model call saw the tool result.
    let seen = provider.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen[1]
        .iter()
        .any(|m| m.role == "tool" && m.content.contains("doc.rust-lang.org")));

    runtime.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn slash_commands_answer_without_the_model() {
    let provider = common::Scripted::new(vec![ChatReply::text("model answer")]);
    let (runtime, mut handle, dir) = start(provider.clone(), ToolRegistry::new(), Vec::new()).await;

    handle.send("c", "u", "hello").unwrap();
    assert_eq!(next_reply(&mut handle).await.text, "model answer");
    assert!(!runtime
        .agent
        .sessions()
        .history("loop:c", 50)
        .await
        .unwrap()
        .is_empty());

    handle.send("c", "u", "/new").unwrap();
    assert_eq!(next_reply(&mut handle).await.text, "New session started.");
    assert!(runtime
        .agent
        .sessions()
        .history("loop:c", 50)
        .await
        .unwrap()
        .is_empty());

    handle.send("c", "u", "/help").unwrap();
    assert!(next_reply(&mut handle).await.text.contains("/new"));
    assert_eq!(provider.seen.lock().unwrap().len(), 1);

    runtime.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn provider_failure_still_yields_one_reply() {
    let provider = common::Scripted::new(Vec::new());
    let (runtime, mut handle, dir) = start(provider, ToolRegistry::new(), Vec::new()).await;

    let id = handle.send("c", "u", "anyone there?").unwrap();
    let reply = next_reply(&mut handle).await;
    assert_eq!(reply.in_reply_to, id);
    let payload = reply.structured_payload.expect("payload");
    assert!(payload["error"].as_str().is_some());
    assert!(handle.try_recv().is_none());

    runtime.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn senders_outside_allow_list_are_dropped() {
    let (runtime, mut handle, dir) = start(
        Arc::new(common::Echo),
        ToolRegistry::new(),
        vec!["alice".to_string()],
    )
    .await;

    handle.send("c", "mallory", "let me in").unwrap();
    let id = handle.send("c", "1234|alice", "hi").unwrap();

    let reply = next_reply(&mut handle).await;
    assert_eq!(reply.in_reply_to, id);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(handle.try_recv().is_none());
    // The denied message never reached the session.
    let history = runtime.agent.sessions().history("loop:c", 50).await.unwrap();
    assert!(history.iter().all(|m| !m.content.contains("let me in")));

    runtime.shutdown().await;
    let _ = std::fs::remove_dir_all(dir);
}
