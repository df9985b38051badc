//! Supervision: faulting, panicking, and unhealthy adapters are restarted with backoff;
//! exhausted ones degrade, their replies are dead-lettered, and an operator restart recovers them.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use banobot::bus::{InboundMessage, MessageBus, OutboundMessage};
use banobot::channels::{
    Channel, ChannelError, ChannelManager, ChannelState, DeliveryError, StopFlag, SupervisorPolicy,
};
use tokio::sync::mpsc;

#[derive(Clone, Copy)]
enum Fault {
    Error,
    Panic,
}

/// Fails (or panics) on every run while `broken` is set; otherwise runs until stopped.
struct TestChannel {
    id: String,
    fault: Fault,
    broken: AtomicBool,
    healthy: AtomicBool,
    /// Runs left that fault before the channel heals by itself.
    faults_left: AtomicU32,
    runs: AtomicU32,
    stop: StopFlag,
    sent: Mutex<Vec<String>>,
}

impl TestChannel {
    fn new(id: &str, fault: Fault, faults: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            fault,
            broken: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            faults_left: AtomicU32::new(faults),
            runs: AtomicU32::new(0),
            stop: StopFlag::new(),
            sent: Mutex::new(Vec::new()),
        })
    }

    fn runs(&self) -> u32 {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Channel for TestChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, _inbound: mpsc::Sender<InboundMessage>) -> Result<(), ChannelError> {
        self.stop.reset();
        self.runs.fetch_add(1, Ordering::SeqCst);
        let scripted_fault = self
            .faults_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted_fault || self.broken.load(Ordering::SeqCst) {
            match self.fault {
                Fault::Error => return Err(ChannelError::Connection(format!("{} unreachable", self.id))),
                Fault::Panic => panic!("{} adapter bug", self.id),
            }
        }
        self.stop.stopped().await;
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), DeliveryError> {
        self.sent.lock().unwrap().push(msg.text.clone());
        Ok(())
    }

    fn stop(&self) {
        self.stop.stop();
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

fn policy(max_restarts: u32) -> SupervisorPolicy {
    SupervisorPolicy {
        max_restarts,
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(40),
        stable_after: Duration::from_secs(60),
        health_check_interval: None,
    }
}

fn reply_on(channel_id: &str, text: &str) -> OutboundMessage {
    OutboundMessage::reply_to(&InboundMessage::new(channel_id, "chat", "user", "q"), text)
}

async fn wait_for_state(manager: &ChannelManager, id: &str, want: ChannelState) {
    for _ in 0..200 {
        if manager.state(id).await == Some(want) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {:?}; now {:?}", id, want, manager.state(id).await);
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[tokio::test]
async fn faulting_adapter_restarts_then_runs() {
    let bus = Arc::new(MessageBus::new(8, 8, Some(Duration::from_millis(100)), 8));
    let manager = ChannelManager::new(bus.clone(), policy(5));
    let channel = TestChannel::new("flaky", Fault::Error, 2);
    manager.register(channel.clone(), Vec::new()).await.unwrap();
    manager.start_all().await;

    wait_until(|| channel.runs() == 3).await;
    wait_for_state(&manager, "flaky", ChannelState::Running).await;
    let status = manager.status().await;
    assert_eq!(status[0].restarts, 2);
    assert_eq!(status[0].consecutive_failures, 2);
    assert!(status[0].last_error.as_deref().unwrap().contains("unreachable"));

    bus.publish_outbound(reply_on("flaky", "hello")).await.unwrap();
    wait_until(|| channel.sent.lock().unwrap().len() == 1).await;
    assert!(manager.dead_letters().is_empty());

    manager.shutdown().await;
    assert_eq!(manager.state("flaky").await, Some(ChannelState::Stopped));
}

#[tokio::test]
async fn panicking_adapter_is_contained_and_restarted() {
    let bus = Arc::new(MessageBus::new(8, 8, None, 8));
    let manager = ChannelManager::new(bus, policy(3));
    let channel = TestChannel::new("buggy", Fault::Panic, 1);
    let healthy = TestChannel::new("steady", Fault::Error, 0);
    manager.register(channel.clone(), Vec::new()).await.unwrap();
    manager.register(healthy.clone(), Vec::new()).await.unwrap();
    manager.start_all().await;

    wait_until(|| channel.runs() == 2).await;
    wait_for_state(&manager, "buggy", ChannelState::Running).await;
    let status = manager.status().await;
    let buggy = status.iter().find(|s| s.id == "buggy").unwrap();
    assert_eq!(buggy.restarts, 1);
    assert!(buggy.last_error.as_deref().unwrap().contains("panicked"));
    // The other adapter never noticed.
    assert_eq!(healthy.runs(), 1);
    assert_eq!(manager.state("steady").await, Some(ChannelState::Running));

    manager.shutdown().await;
}

#[tokio::test]
async fn exhausted_adapter_degrades_and_operator_restart_recovers() {
    let bus = Arc::new(MessageBus::new(8, 8, Some(Duration::from_millis(100)), 8));
    let manager = ChannelManager::new(bus.clone(), policy(2));
    let channel = TestChannel::new("down", Fault::Error, 0);
    channel.broken.store(true, Ordering::SeqCst);
    manager.register(channel.clone(), Vec::new()).await.unwrap();
    manager.start_all().await;

    wait_for_state(&manager, "down", ChannelState::Degraded).await;
    // One initial run plus max_restarts retries.
    assert_eq!(channel.runs(), 3);

    bus.publish_outbound(reply_on("down", "lost reply")).await.unwrap();
    wait_until(|| manager.dead_letters().len() == 1).await;
    let dead = manager.dead_letters();
    assert_eq!(dead[0].message.text, "lost reply");
    assert!(dead[0].reason.contains("degraded"));
    assert!(channel.sent.lock().unwrap().is_empty());

    channel.broken.store(false, Ordering::SeqCst);
    manager.restart("down").await.unwrap();
    wait_for_state(&manager, "down", ChannelState::Running).await;
    let status = manager.status().await;
    assert_eq!(status[0].consecutive_failures, 0);
    assert_eq!(status[0].restarts, 0);
    assert!(status[0].last_error.is_none());

    bus.publish_outbound(reply_on("down", "delivered")).await.unwrap();
    wait_until(|| channel.sent.lock().unwrap().len() == 1).await;

    manager.shutdown().await;
}

#[tokio::test]
async fn failed_health_check_restarts_adapter() {
    let bus = Arc::new(MessageBus::new(8, 8, None, 8));
    let manager = ChannelManager::new(
        bus,
        SupervisorPolicy {
            health_check_interval: Some(Duration::from_millis(30)),
            ..policy(10)
        },
    );
    let channel = TestChannel::new("probe", Fault::Error, 0);
    manager.register(channel.clone(), Vec::new()).await.unwrap();
    manager.start_all().await;
    wait_for_state(&manager, "probe", ChannelState::Running).await;

    channel.healthy.store(false, Ordering::SeqCst);
    wait_until(|| channel.runs() >= 2).await;
    channel.healthy.store(true, Ordering::SeqCst);
    wait_for_state(&manager, "probe", ChannelState::Running).await;
    let status = manager.status().await;
    assert!(status[0].restarts >= 1);

    manager.shutdown().await;
}

#[tokio::test]
async fn disabled_channel_is_not_started() {
    let bus = Arc::new(MessageBus::new(8, 8, None, 8));
    let manager = ChannelManager::new(bus, policy(1));
    let channel = TestChannel::new("off", Fault::Error, 0);
    manager.register(channel.clone(), Vec::new()).await.unwrap();
    manager.set_enabled("off", false).await.unwrap();
    manager.start_all().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(channel.runs(), 0);
    assert_eq!(manager.state("off").await, Some(ChannelState::Disabled));
    assert!(matches!(
        manager.restart("off").await,
        Err(ChannelError::Disabled(_))
    ));
    manager.shutdown().await;
}
