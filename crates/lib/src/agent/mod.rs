//! Agent: turns inbound messages into exactly one reply each.
//!
//! [`AgentLoop::handle`] runs the tool-calling state machine for one message. [`SessionDispatcher`]
//! consumes the bus, keeps per-session order, and runs different sessions concurrently.

mod context;
mod dispatch;
mod runner;

pub use context::ContextBuilder;
pub use dispatch::SessionDispatcher;
pub use runner::{AgentError, AgentLoop, AgentSettings, TurnStage, LIMIT_REACHED_MARKER};
