//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (`~/.banobot/config.json` by default) and environment.
//! Every section has defaults, so an empty `{}` file is a valid config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::cron::CronJob;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Queue capacities and publish timeout.
    #[serde(default)]
    pub bus: BusConfig,

    /// Channel adapters and their supervision policy.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Model provider endpoints.
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Agent defaults (model, workspace, loop limits).
    #[serde(default)]
    pub agents: AgentsConfig,

    /// Built-in tool settings (web search, web fetch).
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Skills load paths and options.
    #[serde(default)]
    pub skills: SkillsConfig,

    /// Scheduled jobs.
    #[serde(default)]
    pub cron: CronConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP (default 18790).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings. When absent, defaults to no auth for loopback bind.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require a bearer token on admin routes.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for admin routes. Overridden by BANOBOT_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require `Authorization: Bearer <token>` on admin routes.
    Token,
}

fn default_gateway_port() -> u16 {
    18790
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

/// Message bus capacities. `publishTimeoutMs` of 0 blocks publishers indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    #[serde(default = "default_queue_capacity")]
    pub inbound_capacity: usize,
    #[serde(default = "default_queue_capacity")]
    pub outbound_capacity: usize,
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
}

fn default_queue_capacity() -> usize {
    256
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_queue_capacity(),
            outbound_capacity: default_queue_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
        }
    }
}

/// Restart policy for crashed adapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorConfig {
    /// Consecutive failed runs tolerated before the channel is marked degraded.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// A run lasting at least this long resets the consecutive failure count.
    #[serde(default = "default_stable_after_secs")]
    pub stable_after_secs: u64,
    /// 0 disables periodic health checks.
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

fn default_max_restarts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_stable_after_secs() -> u64 {
    60
}

fn default_health_check_interval_secs() -> u64 {
    60
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            stable_after_secs: default_stable_after_secs(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

/// Per-channel config plus supervision and dead-letter settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Undeliverable replies retained for inspection.
    #[serde(default = "default_dead_letter_capacity")]
    pub dead_letter_capacity: usize,
    #[serde(default)]
    pub telegram: TelegramChannelConfig,
    #[serde(default)]
    pub discord: DiscordChannelConfig,
    #[serde(default)]
    pub slack: SlackChannelConfig,
    #[serde(default)]
    pub whatsapp: WhatsAppChannelConfig,
}

fn default_dead_letter_capacity() -> usize {
    100
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            dead_letter_capacity: default_dead_letter_capacity(),
            telegram: TelegramChannelConfig::default(),
            discord: DiscordChannelConfig::default(),
            slack: SlackChannelConfig::default(),
            whatsapp: WhatsAppChannelConfig::default(),
        }
    }
}

/// Telegram channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelegramChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bot token from BotFather. Overridden by TELEGRAM_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    /// When set, use webhook mode: Telegram POSTs updates to this URL. If unset, long-poll getUpdates is used.
    pub webhook_url: Option<String>,
    /// Optional secret for webhook verification (X-Telegram-Bot-Api-Secret-Token). Used only when webhook_url is set.
    pub webhook_secret: Option<String>,
    /// Allowed sender ids or usernames. Empty allows everyone.
    #[serde(default)]
    pub allow_from: Vec<String>,
}

/// Discord channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscordChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Bot token. Overridden by DISCORD_BOT_TOKEN env when set.
    pub bot_token: Option<String>,
    #[serde(default = "default_discord_gateway_url")]
    pub gateway_url: String,
    /// Gateway intents bitmask (guilds, guild messages, direct messages, message content).
    #[serde(default = "default_discord_intents")]
    pub intents: u64,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

fn default_discord_gateway_url() -> String {
    "wss://gateway.discord.gg/?v=10&encoding=json".to_string()
}

fn default_discord_intents() -> u64 {
    37377
}

impl Default for DiscordChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bot_token: None,
            gateway_url: default_discord_gateway_url(),
            intents: default_discord_intents(),
            allow_from: Vec::new(),
        }
    }
}

/// Slack channel config (Socket Mode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlackChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    /// xoxb- token for chat.postMessage. Overridden by SLACK_BOT_TOKEN env.
    pub bot_token: Option<String>,
    /// xapp- token for apps.connections.open. Overridden by SLACK_APP_TOKEN env.
    pub app_token: Option<String>,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

/// WhatsApp bridge channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WhatsAppChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_whatsapp_bridge_url")]
    pub bridge_url: String,
    #[serde(default)]
    pub allow_from: Vec<String>,
}

fn default_whatsapp_bridge_url() -> String {
    "ws://localhost:3001".to_string()
}

impl Default for WhatsAppChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bridge_url: default_whatsapp_bridge_url(),
            allow_from: Vec::new(),
        }
    }
}

/// Which provider handles chat requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Ollama,
    /// Any OpenAI-compatible `/chat/completions` endpoint (OpenAI, LM Studio, vLLM, ...).
    Openai,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Openai => "openai",
        }
    }
}

/// Provider endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersConfig {
    #[serde(default)]
    pub ollama: OllamaProviderConfig,
    #[serde(default)]
    pub openai: OpenAiProviderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OllamaProviderConfig {
    /// Default http://127.0.0.1:11434.
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAiProviderConfig {
    /// Default https://api.openai.com/v1.
    pub base_url: Option<String>,
    /// Overridden by OPENAI_API_KEY env when set.
    pub api_key: Option<String>,
}

/// Agent defaults (backend, model, workspace, loop limits).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentsConfig {
    #[serde(default)]
    pub default_backend: ProviderKind,
    /// Model name as the provider knows it (e.g. "llama3.2:latest", "gpt-4o-mini").
    pub default_model: Option<String>,
    /// Workspace root (default ~/.banobot/workspace).
    pub workspace: Option<PathBuf>,
    /// Tool rounds allowed per turn before the loop is forced to stop.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: u32,
    /// Prior messages of the session sent to the model.
    #[serde(default = "default_memory_window")]
    pub memory_window: usize,
    /// Timeout for a whole turn (all model and tool calls).
    #[serde(default = "default_turn_timeout_secs")]
    pub turn_timeout_secs: u64,
    /// Sessions processed at the same time.
    #[serde(default = "default_max_concurrent_turns")]
    pub max_concurrent_turns: usize,
    /// Directory for JSONL session files (default ~/.banobot/sessions). Set to "" to keep sessions in memory only.
    pub sessions_dir: Option<PathBuf>,
}

fn default_max_tool_iterations() -> u32 {
    20
}

fn default_memory_window() -> usize {
    50
}

fn default_turn_timeout_secs() -> u64 {
    300
}

fn default_max_concurrent_turns() -> usize {
    8
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default_backend: ProviderKind::default(),
            default_model: None,
            workspace: None,
            max_tool_iterations: default_max_tool_iterations(),
            memory_window: default_memory_window(),
            turn_timeout_secs: default_turn_timeout_secs(),
            max_concurrent_turns: default_max_concurrent_turns(),
            sessions_dir: None,
        }
    }
}

/// Built-in tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfig {
    #[serde(default)]
    pub web: WebToolsConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebToolsConfig {
    #[serde(default)]
    pub search: WebSearchConfig,
    #[serde(default)]
    pub fetch: WebFetchConfig,
}

/// web_search settings: the default provider is tried first, then the rest in registry order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchConfig {
    #[serde(default = "default_search_provider")]
    pub default_provider: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub providers: SearchProvidersConfig,
}

fn default_search_provider() -> String {
    "duckduckgo".to_string()
}

fn default_max_results() -> usize {
    5
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            default_provider: default_search_provider(),
            max_results: default_max_results(),
            providers: SearchProvidersConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchProvidersConfig {
    #[serde(default)]
    pub duckduckgo: SearchProviderConfig,
    #[serde(default)]
    pub brave: SearchProviderConfig,
    #[serde(default)]
    pub tavily: SearchProviderConfig,
    #[serde(default)]
    pub serper: SearchProviderConfig,
    #[serde(default)]
    pub searxng: SearchProviderConfig,
}

impl SearchProvidersConfig {
    pub fn get(&self, name: &str) -> Option<&SearchProviderConfig> {
        match name {
            "duckduckgo" => Some(&self.duckduckgo),
            "brave" => Some(&self.brave),
            "tavily" => Some(&self.tavily),
            "serper" => Some(&self.serper),
            "searxng" => Some(&self.searxng),
            _ => None,
        }
    }
}

/// One search provider. Key-requiring providers without a key are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub api_key: Option<String>,
    /// Base URL override (required for SearXNG).
    pub api_base: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for SearchProviderConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            api_base: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebFetchConfig {
    /// Extracted text is truncated to this many characters.
    #[serde(default = "default_fetch_max_chars")]
    pub max_chars: usize,
}

fn default_fetch_max_chars() -> usize {
    50_000
}

impl Default for WebFetchConfig {
    fn default() -> Self {
        Self {
            max_chars: default_fetch_max_chars(),
        }
    }
}

/// How skill documentation is provided to the agent: full (all SKILL.md in system message) or read-on-demand (compact list + read_skill tool).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SkillContextMode {
    /// All loaded skills' full SKILL.md content is injected into the system message each turn.
    #[default]
    Full,
    /// System message contains only a compact list (name, description); the model calls read_skill for the rest.
    ReadOnDemand,
}

/// Skills load config (dirs, disabled list, context mode).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkillsConfig {
    /// Override the default skill root. Relative paths are resolved against the config file's parent. Omit to use ~/.banobot/skills.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// Extra skill directories (lowest precedence).
    #[serde(default)]
    pub extra_dirs: Vec<PathBuf>,
    /// Skill names to skip even when present on disk.
    #[serde(default)]
    pub disabled: Vec<String>,
    #[serde(default)]
    pub context_mode: SkillContextMode,
}

/// Cron service settings and jobs declared in config (merged into the store by id at startup).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Job store file (default ~/.banobot/cron/jobs.json).
    pub store_path: Option<PathBuf>,
    #[serde(default)]
    pub jobs: Vec<CronJob>,
}

fn default_tick_interval_secs() -> u64 {
    60
}

impl Default for CronConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: default_tick_interval_secs(),
            store_path: None,
            jobs: Vec::new(),
        }
    }
}

/// Env var (trimmed, non-empty) wins over the config value (trimmed, non-empty).
fn env_or(var: &str, configured: Option<&String>) -> Option<String> {
    std::env::var(var)
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            configured
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// Resolve the gateway token: env BANOBOT_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_or("BANOBOT_GATEWAY_TOKEN", config.gateway.auth.token.as_ref())
}

/// Resolve the Telegram bot token: env TELEGRAM_BOT_TOKEN overrides config.
pub fn resolve_telegram_token(config: &Config) -> Option<String> {
    env_or("TELEGRAM_BOT_TOKEN", config.channels.telegram.bot_token.as_ref())
}

pub fn resolve_discord_token(config: &Config) -> Option<String> {
    env_or("DISCORD_BOT_TOKEN", config.channels.discord.bot_token.as_ref())
}

/// Slack needs both tokens: (bot, app).
pub fn resolve_slack_tokens(config: &Config) -> (Option<String>, Option<String>) {
    (
        env_or("SLACK_BOT_TOKEN", config.channels.slack.bot_token.as_ref()),
        env_or("SLACK_APP_TOKEN", config.channels.slack.app_token.as_ref()),
    )
}

pub fn resolve_openai_key(config: &Config) -> Option<String> {
    env_or("OPENAI_API_KEY", config.providers.openai.api_key.as_ref())
}

/// API key for a search provider: `{NAME}_API_KEY` env overrides config (brave, tavily, serper).
pub fn resolve_search_key(config: &Config, provider: &str) -> Option<String> {
    let configured = config
        .tools
        .web
        .search
        .providers
        .get(provider)
        .and_then(|p| p.api_key.as_ref());
    let var = format!("{}_API_KEY", provider.to_uppercase());
    env_or(&var, configured)
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

fn banobot_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".banobot"))
        .unwrap_or_else(|| PathBuf::from(".banobot"))
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("BANOBOT_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| banobot_home().join("config.json"))
}

/// Resolve workspace directory for agent context (AGENTS.md, memory/).
pub fn resolve_workspace_dir(config: &Config) -> PathBuf {
    config
        .agents
        .workspace
        .clone()
        .unwrap_or_else(|| banobot_home().join("workspace"))
}

/// Session persistence directory; `None` when set to an empty path (in-memory only).
pub fn resolve_sessions_dir(config: &Config) -> Option<PathBuf> {
    match &config.agents.sessions_dir {
        Some(d) if d.as_os_str().is_empty() => None,
        Some(d) => Some(d.clone()),
        None => Some(banobot_home().join("sessions")),
    }
}

pub fn resolve_cron_store_path(config: &Config) -> PathBuf {
    config
        .cron
        .store_path
        .clone()
        .unwrap_or_else(|| banobot_home().join("cron").join("jobs.json"))
}

/// Load config from the given path, or the default path (or BANOBOT_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the config directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Default skill root when no override is set: `skills` subdirectory of the config file's parent.
pub fn skills_dir(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .join("skills")
}

/// Resolve the primary skill root: `config.skills.directory` if set (relative to the config file's parent), otherwise the default.
pub fn resolve_skills_dir(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.skills.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => skills_dir(config_path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.gateway.port, 18790);
        assert_eq!(config.gateway.bind, "127.0.0.1");
        assert_eq!(config.bus.inbound_capacity, 256);
        assert_eq!(config.bus.publish_timeout_ms, 5000);
        assert_eq!(config.channels.supervisor.max_restarts, 5);
        assert_eq!(config.channels.dead_letter_capacity, 100);
        assert_eq!(config.agents.max_tool_iterations, 20);
        assert_eq!(config.agents.memory_window, 50);
        assert_eq!(config.agents.default_backend, ProviderKind::Ollama);
        assert_eq!(config.tools.web.search.default_provider, "duckduckgo");
        assert_eq!(config.tools.web.fetch.max_chars, 50_000);
        assert!(config.cron.enabled);
        assert_eq!(config.cron.tick_interval_secs, 60);
    }

    #[test]
    fn parses_camel_case_sections() {
        let json = r#"{
            "bus": { "inboundCapacity": 4, "publishTimeoutMs": 0 },
            "channels": {
                "supervisor": { "maxRestarts": 2, "initialBackoffMs": 10 },
                "telegram": { "enabled": true, "botToken": "t", "allowFrom": ["alice"] }
            },
            "agents": { "defaultBackend": "openai", "maxToolIterations": 3 },
            "skills": { "contextMode": "readOnDemand" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.bus.inbound_capacity, 4);
        assert_eq!(config.bus.outbound_capacity, 256);
        assert_eq!(config.bus.publish_timeout_ms, 0);
        assert_eq!(config.channels.supervisor.max_restarts, 2);
        assert_eq!(config.channels.supervisor.max_backoff_ms, 60_000);
        assert!(config.channels.telegram.enabled);
        assert_eq!(config.channels.telegram.allow_from, vec!["alice"]);
        assert_eq!(config.agents.default_backend, ProviderKind::Openai);
        assert_eq!(config.agents.max_tool_iterations, 3);
        assert_eq!(config.skills.context_mode, SkillContextMode::ReadOnDemand);
    }

    #[test]
    fn empty_sessions_dir_means_memory_only() {
        let mut config = Config::default();
        config.agents.sessions_dir = Some(PathBuf::new());
        assert_eq!(resolve_sessions_dir(&config), None);
        config.agents.sessions_dir = Some(PathBuf::from("/tmp/s"));
        assert_eq!(resolve_sessions_dir(&config), Some(PathBuf::from("/tmp/s")));
    }

    #[test]
    fn loopback_binds() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind(" localhost "));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[test]
    fn resolve_skills_dir_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.banobot/config.json");
        assert_eq!(
            resolve_skills_dir(&config, path),
            PathBuf::from("/home/user/.banobot/skills")
        );
    }

    #[test]
    fn resolve_skills_dir_override_relative() {
        let mut config = Config::default();
        config.skills.directory = Some(PathBuf::from("custom/skills"));
        let path = Path::new("/home/user/.banobot/config.json");
        assert_eq!(
            resolve_skills_dir(&config, path),
            PathBuf::from("/home/user/.banobot/custom/skills")
        );
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join(format!("banobot-missing-{}.json", uuid::Uuid::new_v4()));
        let (config, used) = load_config(Some(path.clone())).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.gateway.port, 18790);
    }
}
