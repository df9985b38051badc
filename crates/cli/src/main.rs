use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use banobot::bus::{InboundMessage, MessageBus};
use banobot::channels::{LoopbackChannel, LoopbackHandle};
use banobot::config::{self, Config};
use banobot::cron::{CronJob, CronSchedule, CronService, CronStore};
use banobot::gateway::{build_runtime, RuntimeOptions};
use clap::{Parser, Subcommand};

const CLI_CHANNEL_ID: &str = "cli";
const CLI_CHAT_ID: &str = "local";

#[derive(Parser)]
#[command(name = "banobot")]
#[command(about = "Banobot CLI", long_about = None)]
struct Cli {
    /// Config file path (default: BANOBOT_CONFIG_PATH or ~/.banobot/config.json)
    #[arg(long, short, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, workspace, bundled skills).
    Init,

    /// Run the gateway: channels, agent, cron, and the HTTP surface.
    Gateway {
        /// HTTP port (default from config or 18790)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Talk to the agent in-process. Interactive unless --message is given.
    Agent {
        /// Send one message, print the reply, and exit.
        #[arg(long, short)]
        message: Option<String>,

        /// Session id to continue (default: cli:local).
        #[arg(long, value_name = "ID")]
        session: Option<String>,
    },

    /// Query a running gateway's channel, bus, and cron status.
    Status,

    /// Manage scheduled jobs in the job store.
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
}

#[derive(Subcommand)]
enum CronCommand {
    /// List jobs.
    List,
    /// Add a job.
    Add {
        /// Job name.
        #[arg(long)]
        name: String,
        /// "every 15m", "at 2026-01-01T09:00:00Z", or a cron expression.
        #[arg(long)]
        schedule: String,
        /// Prompt sent to the agent when the job fires.
        #[arg(long)]
        prompt: String,
        /// Session id for the job's turns (default: cron:<id>).
        #[arg(long)]
        session: Option<String>,
        /// Deliver replies to this channel id (requires --chat).
        #[arg(long, requires = "chat")]
        channel: Option<String>,
        /// Chat id on --channel.
        #[arg(long, requires = "channel")]
        chat: Option<String>,
        /// Remove a one-shot job after it fires.
        #[arg(long)]
        delete_after_run: bool,
    },
    /// Remove a job.
    Remove { id: String },
    /// Enable a job.
    Enable { id: String },
    /// Disable a job.
    Disable { id: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.command {
        Some(Commands::Gateway { .. }) => "info",
        _ => "warn",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("banobot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init) => run_init(cli.config),
        Some(Commands::Gateway { port }) => run_gateway(cli.config, port).await,
        Some(Commands::Agent { message, session }) => run_agent(cli.config, message, session).await,
        Some(Commands::Status) => run_status(cli.config).await,
        Some(Commands::Cron { command }) => run_cron(cli.config, command).await,
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = banobot::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, path) = config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    banobot::gateway::run_gateway(config, path).await
}

async fn run_agent(
    config_path: Option<PathBuf>,
    message: Option<String>,
    session: Option<String>,
) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    banobot::init::require_initialized(&path, &config)?;
    let reply_timeout = Duration::from_secs(config.agents.turn_timeout_secs.saturating_add(5));

    let runtime = build_runtime(
        config,
        &path,
        RuntimeOptions {
            configured_channels: false,
            cron: false,
            ..RuntimeOptions::default()
        },
    )
    .await?;
    let (channel, mut handle) = LoopbackChannel::new(CLI_CHANNEL_ID);
    runtime
        .register_channel(channel, Vec::new())
        .await
        .context("registering cli channel")?;
    runtime.start().await;

    let result: anyhow::Result<()> = async {
        if let Some(text) = message {
            let id = send_text(&handle, session.as_deref(), &text)?;
            let reply = await_reply(&mut handle, &id, reply_timeout).await?;
            println!("{}", reply.trim());
            return Ok(());
        }

        let stdin = io::stdin();
        let mut stdout = io::stdout();
        loop {
            write!(stdout, "> ")?;
            stdout.flush()?;
            let mut line = String::new();
            if stdin.read_line(&mut line)? == 0 {
                break;
            }
            let input = line.trim();
            if input.is_empty() {
                continue;
            }
            if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
                break;
            }
            let id = send_text(&handle, session.as_deref(), input)?;
            match await_reply(&mut handle, &id, reply_timeout).await {
                Ok(reply) => println!("< {}", reply.trim()),
                Err(e) => eprintln!("agent error: {:#}", e),
            }
        }
        Ok(())
    }
    .await;

    runtime.shutdown().await;
    result
}

fn send_text(handle: &LoopbackHandle, session: Option<&str>, text: &str) -> anyhow::Result<String> {
    let mut msg = InboundMessage::new(CLI_CHANNEL_ID, CLI_CHAT_ID, "user", text);
    if let Some(id) = session {
        msg = msg.with_session(id);
    }
    Ok(handle.send_message(msg)?)
}

/// Wait for the reply to inbound message `id`; replies to earlier messages are skipped.
async fn await_reply(
    handle: &mut LoopbackHandle,
    id: &str,
    timeout: Duration,
) -> anyhow::Result<String> {
    let wait = async {
        while let Some(reply) = handle.recv().await {
            if reply.in_reply_to == id {
                return Some(reply.text);
            }
        }
        None
    };
    match tokio::time::timeout(timeout, wait).await {
        Ok(Some(text)) => Ok(text),
        Ok(None) => anyhow::bail!("cli channel closed before a reply arrived"),
        Err(_) => anyhow::bail!("no reply within {}s", timeout.as_secs()),
    }
}

async fn run_status(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let url = format!("http://{}:{}/status", config.gateway.bind.trim(), config.gateway.port);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("building http client")?;
    let mut req = client.get(&url);
    if let Some(token) = config::resolve_gateway_token(&config) {
        req = req.bearer_auth(token);
    }
    let resp = match req.send().await {
        Ok(r) => r,
        Err(e) => {
            println!("gateway not reachable at {} ({})", url, e);
            return Ok(());
        }
    };
    let status = resp.status();
    let body: serde_json::Value = resp.json().await.context("decoding status response")?;
    if !status.is_success() {
        anyhow::bail!("gateway returned {}: {}", status, body);
    }
    print_status(&body);
    Ok(())
}

fn print_status(body: &serde_json::Value) {
    println!("channels:");
    for ch in body["channels"].as_array().into_iter().flatten() {
        println!(
            "  {:<12} {:<9} failures={} restarts={}{}",
            ch["id"].as_str().unwrap_or("?"),
            ch["state"].as_str().unwrap_or("?"),
            ch["consecutiveFailures"],
            ch["restarts"],
            ch["lastError"]
                .as_str()
                .map(|e| format!(" last_error={}", e))
                .unwrap_or_default()
        );
    }
    println!("inbound queue depth: {}", body["bus"]["inboundDepth"]);
    println!("active sessions: {}", body["activeSessions"]);
    println!(
        "dead letters: {}",
        body["deadLetters"].as_array().map(|a| a.len()).unwrap_or(0)
    );
    if let Some(jobs) = body["cron"].as_array() {
        println!("cron jobs: {}", jobs.len());
    }
}

/// Job admin goes through the cron service against the shared store, so a running gateway
/// picks the changes up on its next tick.
async fn cron_service(config: &Config) -> anyhow::Result<CronService> {
    let bus = Arc::new(MessageBus::from_config(
        &config.bus,
        config.channels.dead_letter_capacity,
    ));
    let store = CronStore::new(config::resolve_cron_store_path(config));
    let service = CronService::new(bus, Some(store));
    service
        .load(&config.cron.jobs)
        .await
        .context("loading cron jobs")?;
    Ok(service)
}

async fn run_cron(config_path: Option<PathBuf>, command: CronCommand) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let service = cron_service(&config).await?;
    match command {
        CronCommand::List => {
            let jobs = service.list_jobs().await;
            if jobs.is_empty() {
                println!("no jobs");
            }
            for job in jobs {
                print_job(&job);
            }
        }
        CronCommand::Add {
            name,
            schedule,
            prompt,
            session,
            channel,
            chat,
            delete_after_run,
        } => {
            let schedule = CronSchedule::parse(&schedule)?;
            let mut job = CronJob::new(name, schedule, prompt);
            if let Some(s) = session {
                job = job.with_session(s);
            }
            if let (Some(channel), Some(chat)) = (channel, chat) {
                job = job.with_delivery(channel, chat);
            }
            job.delete_after_run = delete_after_run;
            let job = service.add_job(job).await?;
            println!("added job {}", job.id);
            print_job(&job);
        }
        CronCommand::Remove { id } => {
            if service.remove_job(&id).await? {
                println!("removed job {}", id);
            } else {
                anyhow::bail!("no job with id {}", id);
            }
        }
        CronCommand::Enable { id } => {
            let job = service.enable_job(&id, true).await?;
            print_job(&job);
        }
        CronCommand::Disable { id } => {
            let job = service.enable_job(&id, false).await?;
            print_job(&job);
        }
    }
    Ok(())
}

fn print_job(job: &CronJob) {
    let next = job
        .next_fire_at
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:<20} {:<8} {:<24} next={}",
        job.id,
        job.name,
        if job.enabled { "enabled" } else { "disabled" },
        job.schedule.describe(),
        next
    );
}
