//! Banobot core library: message bus, agent loop, tools, channel adapters, cron,
//! and the gateway runtime used by the CLI.

pub mod agent;
pub mod bus;
pub mod channels;
pub mod config;
pub mod cron;
pub mod exec;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod memory;
pub mod session;
pub mod skills;
pub mod tools;
