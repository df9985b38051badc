//! Process wiring: bus, providers, tools, agent, channel manager, cron.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::agent::{AgentLoop, AgentSettings, ContextBuilder, SessionDispatcher};
use crate::bus::MessageBus;
use crate::channels::{
    channels_from_config, Channel, ChannelError, ChannelManager, SinkChannel, SupervisorPolicy,
    TelegramChannel,
};
use crate::config::{self, Config};
use crate::cron::{CronService, CronStore, CRON_CHANNEL_ID};
use crate::llm::{Provider, ProviderRegistry};
use crate::session::SessionStore;
use crate::skills::load_skills;
use crate::tools::ToolRegistry;

/// How long shutdown waits for queued turns to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Overrides for [`build_runtime`].
pub struct RuntimeOptions {
    /// Use this provider instead of the configured one.
    pub provider: Option<Arc<dyn Provider>>,
    /// Use these tools instead of the registry built from config and skills.
    pub tools: Option<ToolRegistry>,
    /// Register the adapters enabled in config.
    pub configured_channels: bool,
    /// Run the cron service when enabled in config.
    pub cron: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            provider: None,
            tools: None,
            configured_channels: true,
            cron: true,
        }
    }
}

/// Everything a running gateway owns.
pub struct Runtime {
    pub config: Arc<Config>,
    pub bus: Arc<MessageBus>,
    pub agent: Arc<AgentLoop>,
    pub channels: ChannelManager,
    pub cron: Option<Arc<CronService>>,
    /// Present when Telegram runs, so webhook posts can reach it.
    pub telegram: Option<Arc<TelegramChannel>>,
    dispatcher: SessionDispatcher,
    shutdown_tx: watch::Sender<bool>,
    cron_stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Build the runtime from config. Nothing runs until [`Runtime::start`].
pub async fn build_runtime(
    config: Config,
    config_path: &Path,
    options: RuntimeOptions,
) -> Result<Runtime> {
    let bus = Arc::new(MessageBus::from_config(
        &config.bus,
        config.channels.dead_letter_capacity,
    ));

    let skills_dir = config::resolve_skills_dir(&config, config_path);
    let skills = match load_skills(
        Some(skills_dir.as_path()),
        &config.skills.extra_dirs,
        &config.skills.disabled,
    ) {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("loading skills failed: {}", e);
            Vec::new()
        }
    };
    log::info!("loaded {} skill(s) for agent context", skills.len());

    let providers = ProviderRegistry::from_config(&config);
    let provider = match options.provider {
        Some(p) => p,
        None => providers
            .default_provider()
            .context("resolving default model provider")?,
    };
    let tools = options
        .tools
        .unwrap_or_else(|| ToolRegistry::from_config(&config, &skills));
    log::info!(
        "agent: provider {} model {} tools [{}]",
        provider.name(),
        providers.default_model(),
        tools.names().join(", ")
    );

    let sessions = match config::resolve_sessions_dir(&config) {
        Some(dir) => SessionStore::with_dir(dir),
        None => SessionStore::new(),
    };
    let context = ContextBuilder::new(
        Some(config::resolve_workspace_dir(&config)),
        skills,
        config.skills.context_mode,
    );
    let settings = AgentSettings::from_config(&config, providers.default_model());
    let agent = Arc::new(AgentLoop::new(
        provider,
        Arc::new(tools),
        Arc::new(sessions),
        Arc::new(context),
        settings,
    ));

    let channels = ChannelManager::new(
        bus.clone(),
        SupervisorPolicy::from_config(&config.channels.supervisor),
    );
    let mut telegram = None;
    if options.configured_channels {
        let configured = channels_from_config(&config);
        telegram = configured.telegram;
        for (channel, allow_from) in configured.channels {
            channels
                .register(channel, allow_from)
                .await
                .context("registering channel")?;
        }
    }

    let cron = if options.cron && config.cron.enabled {
        let store = CronStore::new(config::resolve_cron_store_path(&config));
        let service = Arc::new(CronService::new(bus.clone(), Some(store)));
        service
            .load(&config.cron.jobs)
            .await
            .context("loading cron jobs")?;
        channels
            .register(Arc::new(SinkChannel::new(CRON_CHANNEL_ID)), Vec::new())
            .await
            .context("registering cron channel")?;
        Some(service)
    } else {
        None
    };

    let dispatcher = SessionDispatcher::new(
        agent.clone(),
        bus.clone(),
        config.agents.max_concurrent_turns,
        config.bus.inbound_capacity,
    );
    let (shutdown_tx, _) = watch::channel(false);
    let (cron_stop_tx, _) = watch::channel(false);

    Ok(Runtime {
        config: Arc::new(config),
        bus,
        agent,
        channels,
        cron,
        telegram,
        dispatcher,
        shutdown_tx,
        cron_stop_tx,
        tasks: Mutex::new(Vec::new()),
    })
}

impl Runtime {
    /// Register an extra adapter (loopback, tests). Call before [`Runtime::start`].
    pub async fn register_channel(
        &self,
        channel: Arc<dyn Channel>,
        allow_from: Vec<String>,
    ) -> Result<(), ChannelError> {
        self.channels.register(channel, allow_from).await
    }

    pub fn dispatcher(&self) -> &SessionDispatcher {
        &self.dispatcher
    }

    /// Start the dispatcher, every enabled channel, and the cron timer.
    pub async fn start(&self) {
        let mut handles = Vec::new();
        handles.push(tokio::spawn(
            self.dispatcher.clone().run(self.shutdown_tx.subscribe()),
        ));
        self.channels.start_all().await;
        if let Some(cron) = &self.cron {
            let every = Duration::from_secs(self.config.cron.tick_interval_secs);
            handles.push(tokio::spawn(
                cron.clone().run(every, self.cron_stop_tx.subscribe()),
            ));
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
        log::info!("runtime started");
    }

    /// Stop cron, let queued turns finish (bounded), then stop the dispatcher and channels.
    pub async fn shutdown(&self) {
        log::info!("runtime shutting down");
        self.cron_stop_tx.send_replace(true);
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while (self.bus.inbound_depth() > 0 || self.dispatcher.active_sessions() > 0)
            && tokio::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.bus.inbound_depth() > 0 || self.dispatcher.active_sessions() > 0 {
            log::warn!(
                "runtime: drain timed out with {} queued message(s) and {} active session(s)",
                self.bus.inbound_depth(),
                self.dispatcher.active_sessions()
            );
        }
        self.shutdown_tx.send_replace(true);
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.await;
        }
        self.channels.shutdown().await;
        log::info!("runtime stopped");
    }
}
