//! IM transport abstraction: "send one message" for the per-chat send daemon.
//! Each channel declares its capabilities; the daemon chunks to max_message_len.

use async_trait::async_trait;

/// Error from sending a message. Rate-limited responses can be retried after a delay.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SendError {
    /// API returned 429; retry after this many seconds.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },
    /// Other error (network, auth, unknown chat, etc.).
    #[error("{0}")]
    Other(String),
}

/// Channel capabilities declared at IM level.
#[derive(Clone, Debug)]
pub struct ImChannelCapabilities {
    /// Max length for a single message (chunking).
    pub max_message_len: usize,
    /// Prefix for channel_id (e.g. "telegram") for routing and logging.
    pub channel_id_prefix: &'static str,
}

/// Transport that can send a message to a channel. Implemented per IM channel.
#[async_trait]
pub trait ImTransport: Send + Sync {
    fn capabilities(&self) -> ImChannelCapabilities;

    /// Max length for a single message (convenience; equals capabilities().max_message_len).
    fn max_message_len(&self) -> usize {
        self.capabilities().max_message_len
    }

    /// Send `text` to the channel identified by `channel_id` (e.g. "telegram:123").
    /// Caller must chunk to max_message_len.
    async fn send(&self, channel_id: &str, text: &str) -> Result<(), SendError>;
}

/// Split text into chunks of at most `max_len` bytes, trying to break at newlines.
/// Never splits inside a UTF-8 character.
pub fn chunk_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let (chunk, next) = if rest.len() <= max_len {
            (rest, "")
        } else {
            let mut end = max_len;
            while end > 0 && !rest.is_char_boundary(end) {
                end -= 1;
            }
            if end == 0 {
                end = rest.chars().next().map_or(rest.len(), char::len_utf8);
            }
            let slice = &rest[..end];
            let break_at = slice.rfind('\n').map(|i| i + 1).unwrap_or(end);
            (&rest[..break_at], &rest[break_at..])
        };
        chunks.push(chunk.to_string());
        rest = next;
    }
    chunks
}
