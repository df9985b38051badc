//! Scheduled jobs that inject system-originated turns into the bus.

mod service;
mod store;
mod types;

pub use service::{CronService, CRON_CHANNEL_ID};
pub use store::CronStore;
pub use types::{CronDelivery, CronJob, CronSchedule};

use crate::bus::BusError;

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job already exists: {0}")]
    Duplicate(String),
    #[error("job store: {0}")]
    Store(String),
    #[error("job store io: {0}")]
    Io(#[from] std::io::Error),
    #[error("publish failed: {0}")]
    Bus(#[from] BusError),
}
