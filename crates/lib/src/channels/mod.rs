//! Communication channels (Telegram, Discord, Slack, WhatsApp bridge, loopback).
//!
//! Each adapter implements [`Channel`]; the [`ChannelManager`] supervises them, enforces
//! `allowFrom`, forwards their inbound messages to the bus and delivers replies back.

mod adapter;
mod discord;
mod generic;
mod manager;
mod sink;
mod slack;
mod telegram;
mod whatsapp;

pub use adapter::{split_message, AllowList, Channel, ChannelError, DeliveryError, StopFlag};
pub use discord::DiscordChannel;
pub use generic::{LoopbackChannel, LoopbackHandle};
pub use manager::{ChannelManager, ChannelState, ChannelStatus, SupervisorPolicy};
pub use sink::SinkChannel;
pub use slack::SlackChannel;
pub use telegram::{TelegramChannel, TelegramMode, TelegramUpdate};
pub use whatsapp::WhatsAppChannel;

use std::sync::Arc;

use crate::config::Config;

/// Adapters enabled in config, paired with their allow lists. Telegram is returned separately
/// as well so the gateway can route webhook posts to it.
pub struct ConfiguredChannels {
    pub channels: Vec<(Arc<dyn Channel>, Vec<String>)>,
    pub telegram: Option<Arc<TelegramChannel>>,
}

/// Build every adapter enabled in config. An enabled channel without credentials is skipped
/// with a warning.
pub fn channels_from_config(config: &Config) -> ConfiguredChannels {
    let mut channels: Vec<(Arc<dyn Channel>, Vec<String>)> = Vec::new();
    let mut telegram_handle = None;

    let telegram = &config.channels.telegram;
    if telegram.enabled {
        match crate::config::resolve_telegram_token(config) {
            Some(token) => {
                let mode = match telegram.webhook_url.as_deref().filter(|u| !u.is_empty()) {
                    Some(url) => TelegramMode::Webhook {
                        url: url.to_string(),
                        secret: telegram.webhook_secret.clone(),
                    },
                    None => TelegramMode::Poll,
                };
                let ch = Arc::new(TelegramChannel::new(token, mode));
                telegram_handle = Some(ch.clone());
                channels.push((ch, telegram.allow_from.clone()));
            }
            None => log::warn!("channels: telegram enabled but no bot token configured"),
        }
    }

    let discord = &config.channels.discord;
    if discord.enabled {
        match crate::config::resolve_discord_token(config) {
            Some(token) => channels.push((
                Arc::new(DiscordChannel::new(
                    token,
                    discord.gateway_url.clone(),
                    discord.intents,
                )),
                discord.allow_from.clone(),
            )),
            None => log::warn!("channels: discord enabled but no bot token configured"),
        }
    }

    let slack = &config.channels.slack;
    if slack.enabled {
        match crate::config::resolve_slack_tokens(config) {
            (Some(bot), Some(app)) => channels.push((
                Arc::new(SlackChannel::new(bot, app)),
                slack.allow_from.clone(),
            )),
            _ => log::warn!("channels: slack enabled but bot or app token missing"),
        }
    }

    let whatsapp = &config.channels.whatsapp;
    if whatsapp.enabled {
        channels.push((
            Arc::new(WhatsAppChannel::new(whatsapp.bridge_url.clone())),
            whatsapp.allow_from.clone(),
        ));
    }

    ConfiguredChannels {
        channels,
        telegram: telegram_handle,
    }
}
