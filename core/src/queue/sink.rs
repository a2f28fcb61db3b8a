//! Boundary between the dispatcher and whatever presents results: per-task delivery to the
//! originator, and two best-effort notification channels (success log, error reports).

use std::sync::Arc;

use async_trait::async_trait;

use super::task::{ResolutionOutcome, Task};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery failed: {0}")]
pub struct DeliveryError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("notification failed: {0}")]
pub struct SinkError(pub String);

/// Hands a task's outcome to its originator. Called exactly once per dequeued task.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, task: &Task, outcome: &ResolutionOutcome) -> Result<(), DeliveryError>;
}

/// Receives human-readable summaries. Failures are logged by the caller and otherwise ignored.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, summary: &str) -> Result<(), SinkError>;
}

/// Optional log and error sinks. Each notification runs on its own spawned task so a slow or
/// failing sink never holds up the drain loop.
#[derive(Clone, Default)]
pub struct Notifier {
    log: Option<Arc<dyn NotificationSink>>,
    errors: Option<Arc<dyn NotificationSink>>,
}

impl Notifier {
    pub fn new(
        log: Option<Arc<dyn NotificationSink>>,
        errors: Option<Arc<dyn NotificationSink>>,
    ) -> Self {
        Self { log, errors }
    }

    pub fn log(&self, summary: String) {
        fire_and_forget(self.log.clone(), "log", summary);
    }

    pub fn error(&self, summary: String) {
        fire_and_forget(self.errors.clone(), "error", summary);
    }
}

fn fire_and_forget(sink: Option<Arc<dyn NotificationSink>>, which: &'static str, summary: String) {
    let Some(sink) = sink else {
        return;
    };
    tokio::spawn(async move {
        if let Err(e) = sink.notify(&summary).await {
            tracing::warn!(sink = which, error = %e, "notification sink failed");
        }
    });
}
