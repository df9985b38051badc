//! Channel supervision: start, health-check, restart with backoff, and stop adapters.
//!
//! Every registered adapter runs under its own supervisor task. Inbound messages pass through
//! a gate that enforces the channel's allow list before they reach the bus, and a delivery task
//! per channel drains that channel's outbound queue. Replies for a channel that is stopped,
//! degraded or disabled are dead-lettered.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use super::adapter::{AllowList, Channel, ChannelError};
use crate::bus::{DeadLetter, InboundMessage, MessageBus, OutboundMessage};
use crate::config::SupervisorConfig;

/// How long `stop_all` waits for a receive loop before aborting it.
const STOP_GRACE: Duration = Duration::from_secs(5);
const GATE_CAPACITY: usize = 64;

/// Restart policy applied to every adapter.
#[derive(Debug, Clone)]
pub struct SupervisorPolicy {
    /// Restart attempts after consecutive failures before the channel is marked degraded.
    pub max_restarts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A run lasting at least this long resets the consecutive failure count.
    pub stable_after: Duration,
    pub health_check_interval: Option<Duration>,
}

impl SupervisorPolicy {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            stable_after: Duration::from_secs(config.stable_after_secs),
            health_check_interval: (config.health_check_interval_secs > 0)
                .then(|| Duration::from_secs(config.health_check_interval_secs)),
        }
    }

    /// Delay before the restart that follows the `failures`-th consecutive failure.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

impl Default for SupervisorPolicy {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Stopped,
    Running,
    /// Waiting to restart after a fault.
    Backoff,
    /// Out of restart attempts; needs an operator restart.
    Degraded,
    Disabled,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Running => "running",
            ChannelState::Backoff => "backoff",
            ChannelState::Degraded => "degraded",
            ChannelState::Disabled => "disabled",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one registration.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub id: String,
    pub state: ChannelState,
    pub enabled: bool,
    pub consecutive_failures: u32,
    pub restarts: u32,
    pub last_error: Option<String>,
    /// Number of allow-listed identities (0 = open).
    pub allow_from: usize,
}

#[derive(Debug)]
struct Health {
    state: ChannelState,
    consecutive_failures: u32,
    restarts: u32,
    last_error: Option<String>,
}

type SharedHealth = Arc<Mutex<Health>>;

fn lock(health: &SharedHealth) -> MutexGuard<'_, Health> {
    health.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn set_state(health: &SharedHealth, state: ChannelState) {
    let mut h = lock(health);
    if h.state != ChannelState::Disabled {
        h.state = state;
    }
}

struct Registration {
    channel: Arc<dyn Channel>,
    enabled: bool,
    allow_from: AllowList,
    health: SharedHealth,
    stop_tx: watch::Sender<bool>,
    supervisor: Option<JoinHandle<()>>,
    delivery: Option<JoinHandle<()>>,
}

struct Inner {
    bus: Arc<MessageBus>,
    policy: SupervisorPolicy,
    registry: RwLock<HashMap<String, Registration>>,
    health_loop: Mutex<Option<JoinHandle<()>>>,
}

/// Owns every channel registration. Cheap to clone.
#[derive(Clone)]
pub struct ChannelManager {
    inner: Arc<Inner>,
}

impl ChannelManager {
    pub fn new(bus: Arc<MessageBus>, policy: SupervisorPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                policy,
                registry: RwLock::new(HashMap::new()),
                health_loop: Mutex::new(None),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<MessageBus> {
        &self.inner.bus
    }

    /// Register an adapter under its own id. Registered channels start enabled.
    pub async fn register(
        &self,
        channel: Arc<dyn Channel>,
        allow_from: Vec<String>,
    ) -> Result<(), ChannelError> {
        let id = channel.id().to_string();
        let mut registry = self.inner.registry.write().await;
        if registry.contains_key(&id) {
            return Err(ChannelError::AlreadyRegistered(id));
        }
        let (stop_tx, _) = watch::channel(false);
        let allow_from = AllowList::new(allow_from);
        log::info!(
            "channels: registered {} (allow_from: {})",
            id,
            if allow_from.is_empty() {
                "everyone".to_string()
            } else {
                format!("{} identities", allow_from.len())
            }
        );
        registry.insert(
            id,
            Registration {
                channel,
                enabled: true,
                allow_from,
                health: Arc::new(Mutex::new(Health {
                    state: ChannelState::Stopped,
                    consecutive_failures: 0,
                    restarts: 0,
                    last_error: None,
                })),
                stop_tx,
                supervisor: None,
                delivery: None,
            },
        );
        Ok(())
    }

    /// Disabling stops the adapter; enabling leaves it stopped until `start_all` or `restart`.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), ChannelError> {
        {
            let mut registry = self.inner.registry.write().await;
            let reg = registry
                .get_mut(id)
                .ok_or_else(|| ChannelError::Unknown(id.to_string()))?;
            if reg.enabled == enabled {
                return Ok(());
            }
            reg.enabled = enabled;
            if enabled {
                lock(&reg.health).state = ChannelState::Stopped;
            }
        }
        if !enabled {
            self.stop_channel(id).await;
            let registry = self.inner.registry.read().await;
            if let Some(reg) = registry.get(id) {
                lock(&reg.health).state = ChannelState::Disabled;
            }
            log::info!("channels: {} disabled", id);
        }
        Ok(())
    }

    /// Launch every enabled adapter that is not already running, plus the health-check loop.
    pub async fn start_all(&self) {
        let ids: Vec<String> = {
            let registry = self.inner.registry.read().await;
            registry
                .iter()
                .filter(|(_, reg)| reg.enabled)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in ids {
            if let Err(e) = self.start(&id).await {
                log::warn!("channels: could not start {}: {}", id, e);
            }
        }
        self.spawn_health_loop();
    }

    /// Stop every adapter. Each receive loop gets a grace period before it is aborted.
    /// Delivery tasks keep running so late replies are dead-lettered rather than lost.
    pub async fn stop_all(&self) {
        if let Some(handle) = self.health_loop_slot().take() {
            handle.abort();
        }
        let ids: Vec<String> = self.inner.registry.read().await.keys().cloned().collect();
        for id in ids {
            self.stop_channel(&id).await;
        }
    }

    /// Final teardown: close every outbound route and let delivery tasks flush what is already
    /// queued while the adapters are still up, then stop the adapters.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.health_loop_slot().take() {
            handle.abort();
        }
        let deliveries: Vec<(String, JoinHandle<()>)> = {
            let mut registry = self.inner.registry.write().await;
            registry
                .iter_mut()
                .filter_map(|(id, reg)| reg.delivery.take().map(|h| (id.clone(), h)))
                .collect()
        };
        for (id, _) in &deliveries {
            self.inner.bus.close_outbound(id);
        }
        for (id, mut handle) in deliveries {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                log::warn!("channels: {} delivery did not flush within {:?}; aborting", id, STOP_GRACE);
                handle.abort();
            }
        }
        self.stop_all().await;
        log::info!("channels: all channels shut down");
    }

    /// Operator restart: stop the adapter, clear degraded state and counters, relaunch.
    pub async fn restart(&self, id: &str) -> Result<(), ChannelError> {
        {
            let registry = self.inner.registry.read().await;
            let reg = registry
                .get(id)
                .ok_or_else(|| ChannelError::Unknown(id.to_string()))?;
            if !reg.enabled {
                return Err(ChannelError::Disabled(id.to_string()));
            }
        }
        self.stop_channel(id).await;
        {
            let registry = self.inner.registry.read().await;
            if let Some(reg) = registry.get(id) {
                let mut h = lock(&reg.health);
                h.state = ChannelState::Stopped;
                h.consecutive_failures = 0;
                h.restarts = 0;
                h.last_error = None;
            }
        }
        log::info!("channels: {} restarted by operator", id);
        self.start(id).await
    }

    pub async fn status(&self) -> Vec<ChannelStatus> {
        let registry = self.inner.registry.read().await;
        let mut out: Vec<ChannelStatus> = registry
            .iter()
            .map(|(id, reg)| {
                let h = lock(&reg.health);
                ChannelStatus {
                    id: id.clone(),
                    state: h.state,
                    enabled: reg.enabled,
                    consecutive_failures: h.consecutive_failures,
                    restarts: h.restarts,
                    last_error: h.last_error.clone(),
                    allow_from: reg.allow_from.len(),
                }
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    pub async fn state(&self, id: &str) -> Option<ChannelState> {
        let registry = self.inner.registry.read().await;
        registry.get(id).map(|reg| lock(&reg.health).state)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.bus.dead_letters().snapshot()
    }

    async fn start(&self, id: &str) -> Result<(), ChannelError> {
        let mut registry = self.inner.registry.write().await;
        let reg = registry
            .get_mut(id)
            .ok_or_else(|| ChannelError::Unknown(id.to_string()))?;
        if !reg.enabled {
            return Err(ChannelError::Disabled(id.to_string()));
        }
        if reg.supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }
        reg.stop_tx.send_replace(false);

        if reg.delivery.as_ref().map_or(true, |h| h.is_finished()) {
            match self.inner.bus.subscribe_outbound(id) {
                Ok(rx) => {
                    reg.delivery = Some(tokio::spawn(deliver(
                        id.to_string(),
                        reg.channel.clone(),
                        reg.health.clone(),
                        self.inner.bus.clone(),
                        rx,
                    )));
                }
                Err(e) => log::warn!("channels: {} outbound route unavailable: {}", id, e),
            }
        }

        reg.supervisor = Some(tokio::spawn(supervise(Supervised {
            id: id.to_string(),
            channel: reg.channel.clone(),
            allow_from: reg.allow_from.clone(),
            health: reg.health.clone(),
            stop_rx: reg.stop_tx.subscribe(),
            bus: self.inner.bus.clone(),
            policy: self.inner.policy.clone(),
        })));
        log::info!("channels: {} started", id);
        Ok(())
    }

    async fn stop_channel(&self, id: &str) {
        let (channel, handle, health) = {
            let mut registry = self.inner.registry.write().await;
            let Some(reg) = registry.get_mut(id) else {
                return;
            };
            reg.stop_tx.send_replace(true);
            (reg.channel.clone(), reg.supervisor.take(), reg.health.clone())
        };
        channel.stop();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                log::warn!("channels: {} did not stop within {:?}; aborting", id, STOP_GRACE);
                handle.abort();
            }
        }
        let mut h = lock(&health);
        if matches!(h.state, ChannelState::Running | ChannelState::Backoff) {
            h.state = ChannelState::Stopped;
        }
        log::info!("channels: {} stopped", id);
    }

    fn health_loop_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .health_loop
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_health_loop(&self) {
        let Some(every) = self.inner.policy.health_check_interval else {
            return;
        };
        let mut slot = self.health_loop_slot();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                check_health(&inner).await;
            }
        }));
    }
}

/// Stop any running adapter that fails its probe; its supervisor restarts it.
async fn check_health(inner: &Inner) {
    let running: Vec<(String, Arc<dyn Channel>)> = {
        let registry = inner.registry.read().await;
        registry
            .iter()
            .filter(|(_, reg)| lock(&reg.health).state == ChannelState::Running)
            .map(|(id, reg)| (id.clone(), reg.channel.clone()))
            .collect()
    };
    for (id, channel) in running {
        if !channel.health_check().await {
            log::warn!("channels: {} failed health check; restarting", id);
            channel.stop();
        }
    }
}

struct Supervised {
    id: String,
    channel: Arc<dyn Channel>,
    allow_from: AllowList,
    health: SharedHealth,
    stop_rx: watch::Receiver<bool>,
    bus: Arc<MessageBus>,
    policy: SupervisorPolicy,
}

async fn supervise(mut s: Supervised) {
    loop {
        if *s.stop_rx.borrow() {
            break;
        }
        set_state(&s.health, ChannelState::Running);
        let (tx, rx) = mpsc::channel(GATE_CAPACITY);
        tokio::spawn(gate(s.id.clone(), rx, s.allow_from.clone(), s.bus.clone()));

        let started = Instant::now();
        let outcome = AssertUnwindSafe(s.channel.run(tx)).catch_unwind().await;
        if *s.stop_rx.borrow() {
            break;
        }

        let reason = match outcome {
            Ok(Ok(())) => "receive loop exited".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("panicked: {}", panic_message(panic.as_ref())),
        };
        let delay = {
            let mut h = lock(&s.health);
            if started.elapsed() >= s.policy.stable_after {
                h.consecutive_failures = 0;
            }
            h.consecutive_failures += 1;
            h.last_error = Some(reason.clone());
            if h.consecutive_failures > s.policy.max_restarts {
                h.state = ChannelState::Degraded;
                log::error!(
                    "channels: {} degraded after {} consecutive failures; last error: {}",
                    s.id,
                    h.consecutive_failures,
                    reason
                );
                return;
            }
            h.state = ChannelState::Backoff;
            h.restarts += 1;
            s.policy.backoff(h.consecutive_failures)
        };
        log::warn!(
            "channels: {} fault: {}; restarting in {:?}",
            s.id,
            reason,
            delay
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = s.stop_rx.wait_for(|stop| *stop) => break,
        }
    }
    set_state(&s.health, ChannelState::Stopped);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Forward permitted messages to the bus. Runs until the adapter drops its sender.
async fn gate(
    id: String,
    mut rx: mpsc::Receiver<InboundMessage>,
    allow_from: AllowList,
    bus: Arc<MessageBus>,
) {
    while let Some(msg) = rx.recv().await {
        if !allow_from.permits(&msg.sender_id) {
            log::warn!(
                "channels: {} permission denied for sender {}; message {} dropped",
                id,
                msg.sender_id,
                msg.id
            );
            continue;
        }
        let msg_id = msg.id.clone();
        if let Err(e) = bus.publish_inbound(msg).await {
            log::warn!("channels: {} inbound message {} dropped: {}", id, msg_id, e);
        }
    }
}

/// Drain one channel's outbound queue in order.
async fn deliver(
    id: String,
    channel: Arc<dyn Channel>,
    health: SharedHealth,
    bus: Arc<MessageBus>,
    mut rx: mpsc::Receiver<OutboundMessage>,
) {
    while let Some(msg) = rx.recv().await {
        let state = lock(&health).state;
        if !matches!(state, ChannelState::Running | ChannelState::Backoff) {
            bus.dead_letter(msg, format!("channel {} is {}", id, state));
            continue;
        }
        if let Err(e) = channel.send(&msg).await {
            log::warn!("channels: {} delivery failed for {}: {}", id, msg.in_reply_to, e);
            bus.dead_letter(msg, format!("delivery failed: {}", e));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_restarts: u32) -> SupervisorPolicy {
        SupervisorPolicy {
            max_restarts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            stable_after: Duration::from_secs(60),
            health_check_interval: None,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(350));
        assert_eq!(p.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn policy_from_config_disables_zero_health_interval() {
        let config = SupervisorConfig {
            health_check_interval_secs: 0,
            ..SupervisorConfig::default()
        };
        let p = SupervisorPolicy::from_config(&config);
        assert!(p.health_check_interval.is_none());
        assert_eq!(p.max_restarts, 5);
        assert_eq!(p.initial_backoff, Duration::from_secs(1));
    }

    #[test]
    fn panic_message_reads_str_and_string() {
        let boxed: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }

    #[tokio::test]
    async fn register_rejects_duplicate_ids() {
        let bus = Arc::new(MessageBus::new(8, 8, None, 8));
        let manager = ChannelManager::new(bus, policy(1));
        let (a, _ha) = crate::channels::LoopbackChannel::new("loop");
        let (b, _hb) = crate::channels::LoopbackChannel::new("loop");
        manager.register(a, Vec::new()).await.unwrap();
        assert!(matches!(
            manager.register(b, Vec::new()).await,
            Err(ChannelError::AlreadyRegistered(_))
        ));
    }

    #[tokio::test]
    async fn restart_unknown_channel_fails() {
        let bus = Arc::new(MessageBus::new(8, 8, None, 8));
        let manager = ChannelManager::new(bus, policy(1));
        assert!(matches!(
            manager.restart("nope").await,
            Err(ChannelError::Unknown(_))
        ));
    }
}
