//! Per-channel outbound: one FIFO queue and one send daemon task per chat.
//! The daemon spaces sends to the same chat, honours platform retry-after and splits long text.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::log::{channel_name, truncate_content_default};
use super::transport::{self, ImTransport, SendError};

const MIN_INTERVAL: Duration = Duration::from_secs(1);
const QUEUE_CAPACITY: usize = 256;
/// Give up on a chunk after this many consecutive rate-limit answers.
const MAX_RATE_LIMIT_RETRIES: u32 = 5;

/// Send one chunk, waiting out the min interval and any retry-after. Errors other than
/// rate limiting drop the chunk.
async fn send_chunk<T: ImTransport>(
    channel_id: &str,
    chunk: &str,
    transport: &Arc<T>,
    last_send: &mut Option<Instant>,
    min_interval: Duration,
) {
    let mut attempts = 0;
    loop {
        if let Some(last) = *last_send {
            tokio::time::sleep_until(last + min_interval).await;
        }
        match transport.send(channel_id, chunk).await {
            Ok(()) => {
                *last_send = Some(Instant::now());
                return;
            }
            Err(SendError::RateLimited { retry_after_secs }) if attempts < MAX_RATE_LIMIT_RETRIES => {
                attempts += 1;
                tracing::debug!(
                    channel = channel_name(channel_id),
                    chat_id = channel_id,
                    retry_after_secs,
                    attempts,
                    "rate limited"
                );
                tokio::time::sleep(Duration::from_secs_f64(retry_after_secs.max(0.0))).await;
            }
            Err(e) => {
                tracing::warn!(
                    channel = channel_name(channel_id),
                    chat_id = channel_id,
                    direction = "send",
                    content = %truncate_content_default(chunk),
                    error = %e,
                    "send failed, dropping message"
                );
                *last_send = Some(Instant::now());
                return;
            }
        }
    }
}

/// One send daemon for a single chat: drains that chat's FIFO queue in order.
async fn run_send_daemon_for_channel<T>(
    mut rx: mpsc::Receiver<String>,
    channel_id: String,
    transport: Arc<T>,
    min_interval: Duration,
) where
    T: ImTransport,
{
    let max_len = transport.max_message_len();
    let mut last_send: Option<Instant> = None;
    while let Some(text) = rx.recv().await {
        for chunk in transport::chunk_message(&text, max_len) {
            send_chunk(&channel_id, &chunk, &transport, &mut last_send, min_interval).await;
        }
    }
}

/// Hub that routes outbound messages to a per-chat FIFO queue and a dedicated daemon task per chat.
pub struct OutboundHub<T> {
    channels: DashMap<String, mpsc::Sender<String>>,
    transport: Arc<T>,
    min_interval: Duration,
}

impl<T> OutboundHub<T>
where
    T: ImTransport + 'static,
{
    pub fn new(transport: Arc<T>) -> Arc<Self> {
        Self::with_min_interval(transport, MIN_INTERVAL)
    }

    pub fn with_min_interval(transport: Arc<T>, min_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            channels: DashMap::new(),
            transport,
            min_interval,
        })
    }

    /// Get or create the sender for this chat (creates a new FIFO queue and spawns a daemon task).
    pub fn sender_for(&self, channel_id: &str) -> mpsc::Sender<String> {
        self.channels
            .entry(channel_id.to_string())
            .or_insert_with(|| {
                let channel_id = channel_id.to_string();
                let (tx, rx) = mpsc::channel::<String>(QUEUE_CAPACITY);
                let transport = Arc::clone(&self.transport);
                tokio::spawn(run_send_daemon_for_channel(rx, channel_id, transport, self.min_interval));
                tx
            })
            .clone()
    }

    /// Enqueue a message for the given chat (FIFO per chat). Fails if the chat id belongs to
    /// another platform or the daemon is gone.
    pub async fn send(&self, channel_id: &str, text: impl Into<String>) -> Result<(), SendError> {
        let prefix = self.transport.capabilities().channel_id_prefix;
        let routed = channel_id
            .split_once(':')
            .is_some_and(|(p, _)| p == prefix);
        if !routed {
            return Err(SendError::Other(format!("channel_id {} is not a {} chat", channel_id, prefix)));
        }
        let tx = self.sender_for(channel_id);
        tx.send(text.into())
            .await
            .map_err(|_| SendError::Other(format!("send daemon for {} stopped", channel_id)))
    }
}
