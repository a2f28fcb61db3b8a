//! Queue sinks backed by the outbound hub: outcomes go back to the tenant's chat, log and
//! error summaries go to fixed notification chats.

use std::sync::Arc;

use async_trait::async_trait;

use super::daemon::OutboundHub;
use super::transport::ImTransport;
use crate::queue::{Delivery, DeliveryError, FailureReason, NotificationSink, ResolutionOutcome, SinkError, Task};

const FOOTER: &str = "LinkRelay";

/// Message text shown to the originator for an outcome.
pub fn render_outcome(task: &Task, outcome: &ResolutionOutcome) -> String {
    match outcome {
        ResolutionOutcome::Success { value, elapsed } => format!(
            "✅ Bypass successful!\n\n🔑 Bypassed link / key:\n{}\n\n⏱️ Time taken: {:.2} seconds\n📝 Requested by: {}\n\n{} | {}",
            value,
            elapsed.as_secs_f64(),
            task.requester,
            FOOTER,
            task.kind.label()
        ),
        ResolutionOutcome::Failure(FailureReason::Unresolved) => format!(
            "❌ Bypass failed\n- Unable to process the link.\n📝 Requested by: {}\n\n{}",
            task.requester, FOOTER
        ),
        ResolutionOutcome::Failure(_) => format!(
            "❌ Error\nAPI is down, please try again later.\n📝 Requested by: {}\n\n{}",
            task.requester, FOOTER
        ),
    }
}

/// Delivers outcomes into the chat the task came from (the tenant id is the channel id).
pub struct ChatDelivery<T> {
    hub: Arc<OutboundHub<T>>,
}

impl<T> ChatDelivery<T> {
    pub fn new(hub: Arc<OutboundHub<T>>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl<T> Delivery for ChatDelivery<T>
where
    T: ImTransport + 'static,
{
    async fn deliver(&self, task: &Task, outcome: &ResolutionOutcome) -> Result<(), DeliveryError> {
        self.hub
            .send(&task.tenant.0, render_outcome(task, outcome))
            .await
            .map_err(|e| DeliveryError(e.to_string()))
    }
}

/// Notification sink posting summaries to one fixed chat.
pub struct ChatSink<T> {
    hub: Arc<OutboundHub<T>>,
    channel_id: String,
}

impl<T> ChatSink<T> {
    pub fn new(hub: Arc<OutboundHub<T>>, channel_id: impl Into<String>) -> Self {
        Self {
            hub,
            channel_id: channel_id.into(),
        }
    }
}

#[async_trait]
impl<T> NotificationSink for ChatSink<T>
where
    T: ImTransport + 'static,
{
    async fn notify(&self, summary: &str) -> Result<(), SinkError> {
        self.hub
            .send(&self.channel_id, summary)
            .await
            .map_err(|e| SinkError(e.to_string()))
    }
}
