//! Gateway: the long-running process and its HTTP control surface.
//!
//! [`build_runtime`] wires bus, agent, channels, and cron; [`run_gateway`] starts them
//! and serves health, status, the Telegram webhook, and channel restarts on one port.

mod runtime;
mod server;

pub use runtime::{build_runtime, Runtime, RuntimeOptions};
pub use server::{run_gateway, serve};
