//! Message bus: decouples channel adapters (and cron) from the agent loop.
//!
//! Inbound events flow through one bounded queue to the agent; replies flow through
//! bounded per-channel outbound queues to the channel manager's delivery tasks.
//! Undeliverable replies are recorded in the dead-letter queue.

mod dead_letter;
mod events;
mod queue;

pub use dead_letter::{DeadLetter, DeadLetterQueue};
pub use events::{default_session_id, Attachment, InboundMessage, OutboundMessage, Origin};
pub use queue::{BusError, InboundSubscription, MessageBus};
