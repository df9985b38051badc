//! Cron job definitions and schedule evaluation.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

use super::CronError;
use crate::bus::InboundMessage;

/// When a job fires. Cron expressions are evaluated in UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum CronSchedule {
    #[serde(rename_all = "camelCase")]
    Every { every_secs: u64 },
    /// 5-field (minute resolution) or 6-field (with seconds) expression.
    Cron { expr: String },
    /// One-shot.
    At { at: DateTime<Utc> },
}

impl CronSchedule {
    /// Parse the CLI form: `every 30m`, `at 2026-01-01T09:00:00Z`, or a cron expression.
    pub fn parse(spec: &str) -> Result<Self, CronError> {
        let spec = spec.trim();
        let schedule = if let Some(rest) = spec.strip_prefix("every ") {
            CronSchedule::Every {
                every_secs: parse_interval(rest.trim())?,
            }
        } else if let Some(rest) = spec.strip_prefix("at ") {
            let at = DateTime::parse_from_rfc3339(rest.trim())
                .map_err(|e| CronError::InvalidSchedule(format!("{}: {}", rest.trim(), e)))?
                .with_timezone(&Utc);
            CronSchedule::At { at }
        } else {
            CronSchedule::Cron {
                expr: spec.to_string(),
            }
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<(), CronError> {
        match self {
            CronSchedule::Every { every_secs } if *every_secs == 0 => Err(
                CronError::InvalidSchedule("interval must be at least one second".to_string()),
            ),
            CronSchedule::Cron { expr } => parse_expr(expr).map(|_| ()),
            _ => Ok(()),
        }
    }

    /// First fire time strictly after `after`. `None` when the schedule has no further slots.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
        match self {
            CronSchedule::Every { every_secs } => {
                let secs = i64::try_from(*every_secs).unwrap_or(i64::MAX);
                Ok(after.checked_add_signed(ChronoDuration::seconds(secs)))
            }
            CronSchedule::Cron { expr } => {
                let cron = parse_expr(expr)?;
                cron.find_next_occurrence(&after, false)
                    .map(Some)
                    .map_err(|e| CronError::InvalidSchedule(format!("{}: {}", expr, e)))
            }
            CronSchedule::At { at } => Ok((*at > after).then_some(*at)),
        }
    }

    /// Slot assigned when a job is created or re-enabled. A one-shot in the past is still due.
    pub fn first_fire(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, CronError> {
        match self {
            CronSchedule::At { at } => Ok(Some(*at)),
            _ => self.next_after(now),
        }
    }

    pub fn is_one_shot(&self) -> bool {
        matches!(self, CronSchedule::At { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            CronSchedule::Every { every_secs } => format!("every {}s", every_secs),
            CronSchedule::Cron { expr } => format!("cron '{}'", expr),
            CronSchedule::At { at } => format!("at {}", at.to_rfc3339()),
        }
    }
}

fn parse_expr(expr: &str) -> Result<croner::Cron, CronError> {
    croner::Cron::new(expr)
        .with_seconds_optional()
        .parse()
        .map_err(|e| CronError::InvalidSchedule(format!("{}: {}", expr, e)))
}

/// `90`, `90s`, `15m`, `2h`, `1d`.
fn parse_interval(s: &str) -> Result<u64, CronError> {
    let invalid = || CronError::InvalidSchedule(format!("invalid interval: {}", s));
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n: u64 = num.parse().map_err(|_| invalid())?;
    let mult = match unit.trim() {
        "s" | "sec" | "secs" => 1,
        "m" | "min" | "mins" => 60,
        "h" | "hr" | "hrs" => 3600,
        "d" | "day" | "days" => 86_400,
        _ => return Err(invalid()),
    };
    n.checked_mul(mult).filter(|v| *v > 0).ok_or_else(invalid)
}

/// Where a job's reply is delivered. Without one, replies go to the cron sink channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronDelivery {
    pub channel_id: String,
    pub chat_id: String,
}

fn default_true() -> bool {
    true
}

/// A scheduled synthetic turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub schedule: CronSchedule,
    /// Text of the synthesized inbound message.
    pub prompt: String,
    /// Session the turn runs in. Defaults to `cron:{id}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deliver: Option<CronDelivery>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// One-shot jobs only: remove instead of disabling after firing.
    #[serde(default)]
    pub delete_after_run: bool,
    #[serde(default)]
    pub next_fire_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_fired_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl CronJob {
    pub fn new(name: impl Into<String>, schedule: CronSchedule, prompt: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            schedule,
            prompt: prompt.into(),
            target_session_id: None,
            deliver: None,
            enabled: true,
            delete_after_run: false,
            next_fire_at: None,
            last_fired_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.target_session_id = Some(session_id.into());
        self
    }

    pub fn with_delivery(mut self, channel_id: impl Into<String>, chat_id: impl Into<String>) -> Self {
        self.deliver = Some(CronDelivery {
            channel_id: channel_id.into(),
            chat_id: chat_id.into(),
        });
        self
    }

    pub fn session_id(&self) -> String {
        self.target_session_id
            .clone()
            .unwrap_or_else(|| format!("cron:{}", self.id))
    }

    /// The system-originated turn this job injects. `sink_channel` receives the reply when the
    /// job has no delivery target.
    pub fn to_inbound(&self, sink_channel: &str) -> InboundMessage {
        let (channel_id, chat_id) = match &self.deliver {
            Some(d) => (d.channel_id.clone(), d.chat_id.clone()),
            None => (sink_channel.to_string(), self.id.clone()),
        };
        InboundMessage::from_cron(
            self.id.clone(),
            channel_id,
            chat_id,
            self.session_id(),
            self.prompt.clone(),
        )
    }
}
