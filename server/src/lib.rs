//! LinkRelay server: read-only queue status API over Axum. The Telegram bot lives in core.

mod web_server;

pub use web_server::{router, run_web_server, serve_with_bot};

/// Re-export: Telegram bot runs from core (linkrelay_core::im::telegram). No-op if no bot token is set.
pub use linkrelay_core::im::telegram::run_telegram_bot;
