//! Dispatcher: accepts submissions, and drains one tenant's queue at a time under that
//! tenant's lock. A drain holds the lock for its whole run and only stops when the queue is
//! empty, so resolver calls for one tenant never overlap and run in submission order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;

use super::registry::{InFlightTracker, TenantRegistry};
use super::sink::{Delivery, Notifier};
use super::task::{parse_link, FailureReason, OriginatorId, ResolutionOutcome, SubmitError, Task, TenantId};
use crate::im::log::truncate_content_default;
use crate::resolver::{BypassKind, ResolverClient};

/// Acknowledgement of an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// 1-based position among the tenant's pending and running tasks at submit time. Approximate:
    /// read without the tenant lock.
    pub position: usize,
}

pub struct Dispatcher {
    registry: Arc<TenantRegistry>,
    resolver: Arc<dyn ResolverClient>,
    delivery: Arc<dyn Delivery>,
    notifier: Notifier,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TenantRegistry>,
        resolver: Arc<dyn ResolverClient>,
        delivery: Arc<dyn Delivery>,
        notifier: Notifier,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            resolver,
            delivery,
            notifier,
            timeout,
        })
    }

    pub fn registry(&self) -> &Arc<TenantRegistry> {
        &self.registry
    }

    /// Validate and enqueue one request. Unknown kinds and malformed links are rejected here,
    /// before anything touches the queue or the network.
    pub fn submit_request(
        self: &Arc<Self>,
        tenant: TenantId,
        originator: OriginatorId,
        requester: String,
        raw_link: &str,
        kind: &str,
    ) -> Result<Accepted, SubmitError> {
        let kind: BypassKind = kind.parse()?;
        let target = parse_link(raw_link)?;
        let task = Task {
            tenant,
            originator,
            requester,
            kind,
            target,
            submitted_at: Instant::now(),
        };
        Ok(self.submit(task))
    }

    /// Enqueue `task` and start a drain for its tenant. Returns immediately; if a drain is
    /// already running the new one waits on the tenant lock and usually finds the queue empty.
    pub fn submit(self: &Arc<Self>, task: Task) -> Accepted {
        let tenant = task.tenant.clone();
        tracing::info!(
            tenant = %tenant,
            originator = %task.originator,
            kind = %task.kind,
            target = %truncate_content_default(task.target.as_str()),
            "task queued"
        );
        let queued = self.registry.queues.enqueue(task);
        // Read without the tenant lock: a drain between dequeue and mark can make this one low.
        let position = queued + self.registry.in_flight.active_count(&tenant);

        let this = Arc::clone(self);
        tokio::spawn(async move { this.drain(tenant).await });
        Accepted { position }
    }

    /// Process `tenant`'s queue until empty while holding its lock.
    pub async fn drain(&self, tenant: TenantId) {
        let lock = self.registry.locks.lock_for(&tenant);
        let _guard = lock.lock().await;
        let mut processed = 0usize;
        while let Some(task) = self.registry.queues.dequeue_if_any(&tenant) {
            self.process(task).await;
            processed += 1;
        }
        if processed > 0 {
            tracing::debug!(tenant = %tenant, processed, "drain finished");
        }
    }

    async fn process(&self, task: Task) {
        let _in_flight = InFlightGuard::mark(&self.registry.in_flight, &task);

        let outcome = self.execute(&task).await;
        match &outcome {
            ResolutionOutcome::Success { elapsed, .. } => tracing::info!(
                tenant = %task.tenant,
                originator = %task.originator,
                kind = %task.kind,
                elapsed_ms = elapsed.as_millis() as u64,
                "bypass succeeded"
            ),
            ResolutionOutcome::Failure(reason) => tracing::warn!(
                tenant = %task.tenant,
                originator = %task.originator,
                kind = %task.kind,
                reason = %reason,
                "bypass failed"
            ),
        }

        match AssertUnwindSafe(self.delivery.deliver(&task, &outcome))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(tenant = %task.tenant, originator = %task.originator, error = %e, "delivery failed");
            }
            Err(_) => {
                tracing::error!(tenant = %task.tenant, originator = %task.originator, "delivery panicked");
            }
        }

        match &outcome {
            ResolutionOutcome::Success { value, elapsed } => {
                self.notifier.log(success_summary(&task, value, *elapsed));
            }
            ResolutionOutcome::Failure(reason) if reason.is_reportable() => {
                self.notifier.error(failure_summary(&task, reason));
            }
            ResolutionOutcome::Failure(_) => {}
        }
    }

    /// One bounded resolver call. Never panics outward and never retries.
    async fn execute(&self, task: &Task) -> ResolutionOutcome {
        let call = AssertUnwindSafe(self.resolver.resolve(task.kind, &task.target)).catch_unwind();
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(Ok(value))) => ResolutionOutcome::Success {
                value,
                elapsed: task.submitted_at.elapsed(),
            },
            Ok(Ok(Err(e))) => ResolutionOutcome::Failure(e.into()),
            Ok(Err(_)) => ResolutionOutcome::Failure(FailureReason::Upstream("resolver panicked".to_string())),
            Err(_) => ResolutionOutcome::Failure(FailureReason::Timeout(self.timeout)),
        }
    }
}

/// Keeps the originator in the in-flight set until dropped, whichever way `process` exits.
struct InFlightGuard<'a> {
    tracker: &'a InFlightTracker,
    tenant: &'a TenantId,
    originator: &'a OriginatorId,
}

impl<'a> InFlightGuard<'a> {
    fn mark(tracker: &'a InFlightTracker, task: &'a Task) -> Self {
        tracker.mark(&task.tenant, &task.originator);
        Self {
            tracker,
            tenant: &task.tenant,
            originator: &task.originator,
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.tracker.clear(self.tenant, self.originator);
    }
}

fn success_summary(task: &Task, value: &str, elapsed: Duration) -> String {
    format!(
        "Bypass successful for {} in {} ({}, {:.2}s)\nLink: {}\nResult: {}",
        task.requester,
        task.tenant,
        task.kind.label(),
        elapsed.as_secs_f64(),
        task.target,
        value
    )
}

fn failure_summary(task: &Task, reason: &FailureReason) -> String {
    format!(
        "Bypass error for {} in {} ({}): {}\nLink: {}",
        task.requester,
        task.tenant,
        task.kind.label(),
        reason,
        task.target
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::sink::{DeliveryError, NotificationSink, SinkError};
    use crate::resolver::ResolveError;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::{mpsc, Semaphore};
    use url::Url;

    /// Resolver whose behaviour is driven by the target: path "/{tenant}/{user}", query "mode=...".
    struct FakeResolver {
        delay: Duration,
        active: Mutex<HashMap<String, usize>>,
        max_per_tenant: Mutex<HashMap<String, usize>>,
        active_total: AtomicUsize,
        max_total: AtomicUsize,
        calls: AtomicUsize,
        gate: Semaphore,
    }

    impl FakeResolver {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                active: Mutex::new(HashMap::new()),
                max_per_tenant: Mutex::new(HashMap::new()),
                active_total: AtomicUsize::new(0),
                max_total: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            })
        }

        fn max_overlap(&self, tenant: &str) -> usize {
            self.max_per_tenant.lock().unwrap().get(tenant).copied().unwrap_or(0)
        }

        fn enter(&self, tenant: &str) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut active = self.active.lock().unwrap();
            let n = active.entry(tenant.to_string()).or_default();
            *n += 1;
            let mut max = self.max_per_tenant.lock().unwrap();
            let m = max.entry(tenant.to_string()).or_default();
            *m = (*m).max(*n);
            let total = self.active_total.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_total.fetch_max(total, Ordering::SeqCst);
        }

        fn exit(&self, tenant: &str) {
            *self.active.lock().unwrap().get_mut(tenant).unwrap() -= 1;
            self.active_total.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ResolverClient for FakeResolver {
        async fn resolve(&self, _kind: BypassKind, target: &Url) -> Result<String, ResolveError> {
            let tenant = target.path_segments().unwrap().next().unwrap().to_string();
            let mode = target
                .query_pairs()
                .find(|(k, _)| k == "mode")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_else(|| "ok".to_string());

            self.enter(&tenant);
            let result = match mode.as_str() {
                "block" => {
                    self.gate.acquire().await.unwrap().forget();
                    Ok(format!("resolved:{}", target.path()))
                }
                "slow" => {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok("too late".to_string())
                }
                "panic" => {
                    self.exit(&tenant);
                    panic!("resolver blew up");
                }
                other => {
                    tokio::time::sleep(self.delay).await;
                    match other {
                        "unresolved" => Err(ResolveError::Unresolved),
                        "upstream" => Err(ResolveError::Upstream("status 503".into())),
                        _ => Ok(format!("resolved:{}", target.path())),
                    }
                }
            };
            self.exit(&tenant);
            result
        }
    }

    struct Delivered {
        tenant: TenantId,
        originator: OriginatorId,
        outcome: ResolutionOutcome,
        in_flight_at_delivery: bool,
    }

    struct RecordingDelivery {
        registry: Arc<TenantRegistry>,
        tx: mpsc::UnboundedSender<Delivered>,
    }

    #[async_trait]
    impl Delivery for RecordingDelivery {
        async fn deliver(&self, task: &Task, outcome: &ResolutionOutcome) -> Result<(), DeliveryError> {
            let in_flight_at_delivery = self.registry.in_flight.contains(&task.tenant, &task.originator);
            let _ = self.tx.send(Delivered {
                tenant: task.tenant.clone(),
                originator: task.originator.clone(),
                outcome: outcome.clone(),
                in_flight_at_delivery,
            });
            match task.originator.0.as_str() {
                "panicky" => panic!("renderer crashed"),
                "unreachable" => Err(DeliveryError("chat not found".into())),
                _ => Ok(()),
            }
        }
    }

    struct RecordingSink(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn notify(&self, summary: &str) -> Result<(), SinkError> {
            let _ = self.0.send(summary.to_string());
            Ok(())
        }
    }

    /// Sink whose chat is gone: every notify fails.
    struct FailingSink;

    #[async_trait]
    impl NotificationSink for FailingSink {
        async fn notify(&self, _summary: &str) -> Result<(), SinkError> {
            Err(SinkError("chat not found".into()))
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        resolver: Arc<FakeResolver>,
        delivered: mpsc::UnboundedReceiver<Delivered>,
        logs: mpsc::UnboundedReceiver<String>,
        errors: mpsc::UnboundedReceiver<String>,
    }

    impl Harness {
        fn new(delay: Duration, timeout: Duration) -> Self {
            let (log_tx, logs) = mpsc::unbounded_channel();
            let (err_tx, errors) = mpsc::unbounded_channel();
            let notifier = Notifier::new(
                Some(Arc::new(RecordingSink(log_tx))),
                Some(Arc::new(RecordingSink(err_tx))),
            );
            Self::with_notifier(delay, timeout, notifier, logs, errors)
        }

        /// Both notification chats unreachable.
        fn with_failing_sinks(delay: Duration, timeout: Duration) -> Self {
            let (_, logs) = mpsc::unbounded_channel();
            let (_, errors) = mpsc::unbounded_channel();
            let notifier = Notifier::new(Some(Arc::new(FailingSink)), Some(Arc::new(FailingSink)));
            Self::with_notifier(delay, timeout, notifier, logs, errors)
        }

        fn with_notifier(
            delay: Duration,
            timeout: Duration,
            notifier: Notifier,
            logs: mpsc::UnboundedReceiver<String>,
            errors: mpsc::UnboundedReceiver<String>,
        ) -> Self {
            let registry = TenantRegistry::new();
            let resolver = FakeResolver::new(delay);
            let (tx, delivered) = mpsc::unbounded_channel();
            let delivery = Arc::new(RecordingDelivery {
                registry: Arc::clone(&registry),
                tx,
            });
            let dispatcher = Dispatcher::new(registry, resolver.clone(), delivery, notifier, timeout);
            Self {
                dispatcher,
                resolver,
                delivered,
                logs,
                errors,
            }
        }

        fn submit(&self, tenant: &str, user: &str, kind: &str, mode: &str) -> Result<Accepted, SubmitError> {
            self.dispatcher.submit_request(
                tenant.into(),
                user.into(),
                format!("@{}", user),
                &format!("https://linkvertise.com/{}/{}?mode={}", tenant, user, mode),
                kind,
            )
        }

        async fn next(&mut self) -> Delivered {
            tokio::time::timeout(Duration::from_secs(5), self.delivered.recv())
                .await
                .expect("delivery within 5s")
                .expect("delivery channel open")
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn delivers_in_submission_order_per_tenant() {
        let mut h = Harness::new(Duration::from_millis(10), Duration::from_secs(5));
        for i in 0..5 {
            h.submit("g1", &format!("u{}", i), "linkvertise", "ok").unwrap();
        }
        for i in 0..5 {
            let d = h.next().await;
            assert_eq!(d.originator, OriginatorId(format!("u{}", i)));
            assert!(d.outcome.is_success());
            assert!(d.in_flight_at_delivery);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn resolver_calls_never_overlap_within_a_tenant() {
        let mut h = Harness::new(Duration::from_millis(20), Duration::from_secs(5));
        for i in 0..6 {
            h.submit("g1", &format!("u{}", i), "rekonise", "ok").unwrap();
        }
        for _ in 0..6 {
            h.next().await;
        }
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 6);
        assert_eq!(h.resolver.max_overlap("g1"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn tenants_drain_in_parallel() {
        let mut h = Harness::new(Duration::from_millis(60), Duration::from_secs(5));
        for i in 0..3 {
            h.submit("g1", &format!("a{}", i), "linkvertise", "ok").unwrap();
            h.submit("g2", &format!("b{}", i), "linkvertise", "ok").unwrap();
        }
        let mut g1 = Vec::new();
        let mut g2 = Vec::new();
        for _ in 0..6 {
            let d = h.next().await;
            match d.tenant.0.as_str() {
                "g1" => g1.push(d.originator.0),
                _ => g2.push(d.originator.0),
            }
        }
        assert_eq!(g1, ["a0", "a1", "a2"]);
        assert_eq!(g2, ["b0", "b1", "b2"]);
        assert_eq!(h.resolver.max_overlap("g1"), 1);
        assert_eq!(h.resolver.max_overlap("g2"), 1);
        assert_eq!(h.resolver.max_total.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn blocked_tenant_does_not_delay_others() {
        let mut h = Harness::new(Duration::from_millis(5), Duration::from_secs(5));
        h.submit("g1", "stuck", "linkvertise", "block").unwrap();
        settle().await;
        h.submit("g2", "free", "linkvertise", "ok").unwrap();

        let first = h.next().await;
        assert_eq!(first.tenant, TenantId::from("g2"));
        assert_eq!(h.dispatcher.registry().in_flight.active_count(&"g1".into()), 1);

        h.resolver.gate.add_permits(1);
        let second = h.next().await;
        assert_eq!(second.tenant, TenantId::from("g1"));
        assert!(second.outcome.is_success());
    }

    #[tokio::test]
    async fn rejected_kind_is_never_queued_or_resolved() {
        let h = Harness::new(Duration::from_millis(5), Duration::from_secs(5));
        let err = h.submit("g1", "u", "badkind", "ok").unwrap_err();
        assert!(matches!(err, SubmitError::UnknownKind(_)));

        let err = h
            .dispatcher
            .submit_request("g1".into(), "u".into(), "@u".into(), "not a url", "linkvertise")
            .unwrap_err();
        assert!(matches!(err, SubmitError::MalformedLink(_)));

        settle().await;
        assert_eq!(h.dispatcher.registry().queues.size(&"g1".into()), 0);
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mixed_kinds_scenario() {
        let mut h = Harness::new(Duration::from_millis(10), Duration::from_secs(5));
        assert!(h.submit("G1", "u1", "linkvertise", "ok").is_ok());
        assert!(h.submit("G1", "u2", "rekonise", "unresolved").is_ok());
        assert!(h.submit("G1", "u3", "badkind", "ok").is_err());

        let first = h.next().await;
        let second = h.next().await;
        assert_eq!(first.originator, OriginatorId::from("u1"));
        assert_eq!(second.originator, OriginatorId::from("u2"));
        assert!(first.outcome.is_success());
        assert_eq!(second.outcome, ResolutionOutcome::Failure(FailureReason::Unresolved));

        settle().await;
        assert!(h.delivered.try_recv().is_err());
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failure_does_not_poison_the_queue() {
        let mut h = Harness::new(Duration::from_millis(5), Duration::from_secs(5));
        h.submit("g1", "a", "workink", "upstream").unwrap();
        h.submit("g1", "b", "workink", "ok").unwrap();

        let first = h.next().await;
        assert_eq!(
            first.outcome,
            ResolutionOutcome::Failure(FailureReason::Upstream("status 503".into()))
        );
        let second = h.next().await;
        assert!(second.outcome.is_success());

        settle().await;
        let report = h.errors.try_recv().unwrap();
        assert!(report.contains("status 503"));
        assert!(h.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn failing_notification_sinks_do_not_stop_delivery() {
        let mut h = Harness::with_failing_sinks(Duration::from_millis(5), Duration::from_secs(5));
        h.submit("g1", "a", "workink", "upstream").unwrap();
        h.submit("g1", "b", "workink", "ok").unwrap();
        h.submit("g1", "c", "rekonise", "ok").unwrap();

        let first = h.next().await;
        assert_eq!(first.originator, OriginatorId::from("a"));
        assert!(!first.outcome.is_success());
        let second = h.next().await;
        assert_eq!(second.originator, OriginatorId::from("b"));
        assert!(second.outcome.is_success());
        let third = h.next().await;
        assert_eq!(third.originator, OriginatorId::from("c"));
        assert!(third.outcome.is_success());

        settle().await;
        assert_eq!(h.dispatcher.registry().status(&"g1".into()).in_flight, 0);
        assert_eq!(h.resolver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unresolved_is_not_reported_to_error_sink() {
        let mut h = Harness::new(Duration::from_millis(5), Duration::from_secs(5));
        h.submit("g1", "a", "linkvertise", "unresolved").unwrap();
        let d = h.next().await;
        assert_eq!(d.outcome, ResolutionOutcome::Failure(FailureReason::Unresolved));
        settle().await;
        assert!(h.errors.try_recv().is_err());
        assert!(h.logs.try_recv().is_err());
    }

    #[tokio::test]
    async fn success_goes_to_log_sink() {
        let mut h = Harness::new(Duration::from_millis(5), Duration::from_secs(5));
        h.submit("g1", "alice", "linkvertise", "ok").unwrap();
        let d = h.next().await;
        let ResolutionOutcome::Success { value, .. } = d.outcome else {
            panic!("expected success");
        };
        assert_eq!(value, "resolved:/g1/alice");
        settle().await;
        let log = h.logs.try_recv().unwrap();
        assert!(log.contains("@alice"));
        assert!(log.contains("resolved:/g1/alice"));
    }

    #[tokio::test]
    async fn timeout_fails_once_and_releases_the_lock() {
        let timeout = Duration::from_millis(100);
        let mut h = Harness::new(Duration::from_millis(5), timeout);
        h.submit("g1", "slowpoke", "linkvertise", "slow").unwrap();
        h.submit("g1", "next", "linkvertise", "ok").unwrap();

        let first = h.next().await;
        assert_eq!(first.originator, OriginatorId::from("slowpoke"));
        assert_eq!(first.outcome, ResolutionOutcome::Failure(FailureReason::Timeout(timeout)));

        let second = h.next().await;
        assert_eq!(second.originator, OriginatorId::from("next"));
        assert!(second.outcome.is_success());

        settle().await;
        assert!(h.errors.try_recv().unwrap().contains("timed out"));
        assert!(h.errors.try_recv().is_err());
        let lock = h.dispatcher.registry().locks.lock_for(&"g1".into());
        assert!(lock.try_lock().is_ok());
    }

    #[tokio::test]
    async fn failing_or_panicking_delivery_keeps_draining() {
        let mut h = Harness::new(Duration::from_millis(5), Duration::from_secs(5));
        h.submit("g1", "panicky", "linkvertise", "ok").unwrap();
        h.submit("g1", "unreachable", "linkvertise", "ok").unwrap();
        h.submit("g1", "fine", "linkvertise", "ok").unwrap();

        assert_eq!(h.next().await.originator, OriginatorId::from("panicky"));
        assert_eq!(h.next().await.originator, OriginatorId::from("unreachable"));
        assert_eq!(h.next().await.originator, OriginatorId::from("fine"));

        settle().await;
        let registry = h.dispatcher.registry();
        assert_eq!(registry.in_flight.active_count(&"g1".into()), 0);
        assert_eq!(registry.queues.size(&"g1".into()), 0);
    }

    #[tokio::test]
    async fn panicking_resolver_becomes_failure() {
        let mut h = Harness::new(Duration::from_millis(5), Duration::from_secs(5));
        h.submit("g1", "a", "linkvertise", "panic").unwrap();
        h.submit("g1", "b", "linkvertise", "ok").unwrap();

        let first = h.next().await;
        assert!(matches!(first.outcome, ResolutionOutcome::Failure(FailureReason::Upstream(_))));
        assert!(h.next().await.outcome.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accepted_position_counts_pending_and_running() {
        let mut h = Harness::new(Duration::from_millis(5), Duration::from_secs(5));
        assert_eq!(h.submit("g1", "a", "linkvertise", "block").unwrap().position, 1);
        settle().await;
        assert_eq!(h.submit("g1", "b", "linkvertise", "ok").unwrap().position, 2);
        assert_eq!(h.submit("g1", "c", "linkvertise", "ok").unwrap().position, 3);
        assert_eq!(h.submit("g2", "z", "linkvertise", "ok").unwrap().position, 1);

        assert_eq!(h.next().await.originator, OriginatorId::from("z"));
        h.resolver.gate.add_permits(1);
        for expected in ["a", "b", "c"] {
            assert_eq!(h.next().await.originator, OriginatorId::from(expected));
        }
    }
}
