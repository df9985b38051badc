//! Per-session ordering and cross-session independence through the dispatcher.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use banobot::channels::LoopbackChannel;
use banobot::gateway::{build_runtime, RuntimeOptions};
use banobot::tools::ToolRegistry;

#[tokio::test]
async fn same_session_in_order_other_sessions_not_blocked() {
    let (mut config, config_path, dir) = common::temp_setup("ordering");
    config.agents.max_concurrent_turns = 4;
    let runtime = build_runtime(
        config,
        &config_path,
        RuntimeOptions {
            provider: Some(Arc::new(common::Echo)),
            tools: Some(ToolRegistry::new()),
            configured_channels: false,
            cron: false,
        },
    )
    .await
    .unwrap();
    let (channel, mut handle) = LoopbackChannel::new("loop");
    runtime.register_channel(channel, Vec::new()).await.unwrap();
    runtime.start().await;

    // Session A: a slow first message followed by fast ones.
    let a1 = handle.send("a", "u", "sleep:600:a1").unwrap();
    let a2 = handle.send("a", "u", "a2").unwrap();
    let a3 = handle.send("a", "u", "a3").unwrap();
    // Session B must not wait for A's slow turn.
    let b1 = handle.send("b", "u", "b1").unwrap();

    let started = Instant::now();
    let mut order = Vec::new();
    let mut texts = Vec::new();
    let mut b_elapsed = None;
    while order.len() < 4 {
        let reply = tokio::time::timeout(Duration::from_secs(5), handle.recv())
            .await
            .expect("reply within 5s")
            .expect("channel open");
        if reply.in_reply_to == b1 {
            b_elapsed = Some(started.elapsed());
        }
        order.push(reply.in_reply_to.clone());
        texts.push(reply.text);
    }

    let a_order: Vec<&String> = order.iter().filter(|id| **id != b1).collect();
    assert_eq!(a_order, vec![&a1, &a2, &a3]);
    assert_eq!(order[0], b1, "session b answered before the slow a1 finished");
    assert!(b_elapsed.expect("b replied") < Duration::from_millis(500));

    // Each A turn saw all earlier A turns and none of B's.
    assert!(texts.contains(&"a1 (after 0)".to_string()));
    assert!(texts.contains(&"a2 (after 1)".to_string()));
    assert!(texts.contains(&"a3 (after 2)".to_string()));
    assert!(texts.contains(&"b1 (after 0)".to_string()));

    runtime.shutdown().await;
    assert_eq!(runtime.dispatcher().active_sessions(), 0);
    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn shutdown_drains_queued_turns() {
    let (config, config_path, dir) = common::temp_setup("drain");
    let runtime = build_runtime(
        config,
        &config_path,
        RuntimeOptions {
            provider: Some(Arc::new(common::Echo)),
            tools: Some(ToolRegistry::new()),
            configured_channels: false,
            cron: false,
        },
    )
    .await
    .unwrap();
    let (channel, mut handle) = LoopbackChannel::new("loop");
    runtime.register_channel(channel, Vec::new()).await.unwrap();
    runtime.start().await;

    let id = handle.send("c", "u", "sleep:300:late").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.shutdown().await;

    let reply = handle.try_recv().expect("queued turn answered before shutdown finished");
    assert_eq!(reply.in_reply_to, id);
    assert_eq!(runtime.bus.inbound_depth(), 0);
    let _ = std::fs::remove_dir_all(dir);
}
