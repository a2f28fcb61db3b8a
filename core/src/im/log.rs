//! Shared helpers for IM log fields: channel name from a channel_id and bounded content.
//! Events are emitted with `tracing` as `channel=telegram chat_id=... content=...`.

const CONTENT_LOG_MAX_LEN: usize = 120;

/// Channel name parsed from channel_id (prefix before ':'), e.g. "telegram:123" -> "telegram".
#[inline]
pub fn channel_name(channel_id: &str) -> &str {
    channel_id.split(':').next().filter(|s| !s.is_empty()).unwrap_or("?")
}

/// Truncate message content for logging (avoid huge dumps). Cuts on a char boundary.
#[inline]
pub fn truncate_content(content: &str, max_len: usize) -> std::borrow::Cow<'_, str> {
    if content.len() <= max_len {
        return std::borrow::Cow::Borrowed(content);
    }
    let mut cut = max_len;
    while !content.is_char_boundary(cut) {
        cut -= 1;
    }
    std::borrow::Cow::Owned(format!("{}... ({} bytes)", &content[..cut], content.len()))
}

#[inline]
pub fn truncate_content_default(content: &str) -> std::borrow::Cow<'_, str> {
    truncate_content(content, CONTENT_LOG_MAX_LEN)
}
