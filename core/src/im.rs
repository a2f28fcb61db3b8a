//! IM (instant messaging) side: Telegram adapter, per-chat outbound send daemon, and the
//! delivery/notification sinks the resolve queue reports through.
//! Log fields: channel=... chat_id=... content=...

pub mod channels;
pub mod commands;
pub mod daemon;
pub mod delivery;
pub mod log;
pub mod transport;

/// Re-export so `linkrelay_core::im::telegram::run_telegram_bot` works.
pub use channels::telegram;
