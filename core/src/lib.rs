//! LinkRelay core: per-chat serialized resolve queue, bypass API client, IM (Telegram), config.
//! No HTTP server; the server crate owns the process.

pub mod config;
pub mod im;
pub mod queue;
pub mod resolver;
