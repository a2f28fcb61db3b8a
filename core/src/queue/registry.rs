//! Tenant registry: the queue store, lock store and in-flight tracker behind one handle.
//! Every table is a DashMap so per-key creation goes through `entry()` (atomic get-or-insert
//! under a shard lock); no table lock is ever held across an await.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;

use super::task::{OriginatorId, Task, TenantId};

/// Tenant id -> FIFO of pending tasks. Queues are created on first enqueue and never removed.
#[derive(Default)]
pub struct TenantQueues {
    queues: DashMap<TenantId, VecDeque<Task>>,
}

impl TenantQueues {
    /// Append to the tail. Returns the queue length after the push.
    pub fn enqueue(&self, task: Task) -> usize {
        let mut queue = self.queues.entry(task.tenant.clone()).or_default();
        queue.push_back(task);
        queue.len()
    }

    /// Pop the head task. Callers must hold the tenant's lock.
    pub fn dequeue_if_any(&self, tenant: &TenantId) -> Option<Task> {
        self.queues.get_mut(tenant).and_then(|mut q| q.pop_front())
    }

    pub fn size(&self, tenant: &TenantId) -> usize {
        self.queues.get(tenant).map_or(0, |q| q.len())
    }

    fn tenants(&self) -> Vec<TenantId> {
        self.queues.iter().map(|e| e.key().clone()).collect()
    }
}

/// Tenant id -> async gate. One gate per tenant for the process lifetime.
#[derive(Default)]
pub struct TenantLocks {
    locks: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl TenantLocks {
    pub fn lock_for(&self, tenant: &TenantId) -> Arc<Mutex<()>> {
        self.locks
            .entry(tenant.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Tenant id -> originators whose task is dequeued but not yet delivered.
#[derive(Default)]
pub struct InFlightTracker {
    active: DashMap<TenantId, HashSet<OriginatorId>>,
}

impl InFlightTracker {
    pub fn mark(&self, tenant: &TenantId, originator: &OriginatorId) {
        self.active
            .entry(tenant.clone())
            .or_default()
            .insert(originator.clone());
    }

    pub fn clear(&self, tenant: &TenantId, originator: &OriginatorId) {
        if let Some(mut set) = self.active.get_mut(tenant) {
            set.remove(originator);
        }
    }

    pub fn active_count(&self, tenant: &TenantId) -> usize {
        self.active.get(tenant).map_or(0, |s| s.len())
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, tenant: &TenantId, originator: &OriginatorId) -> bool {
        self.active
            .get(tenant)
            .is_some_and(|s| s.contains(originator))
    }
}

/// Queue depth and in-flight count for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantStatus {
    pub tenant: String,
    pub queued: usize,
    pub in_flight: usize,
}

/// The three per-tenant tables. Shared by `Arc` between the dispatcher and status readers.
#[derive(Default)]
pub struct TenantRegistry {
    pub queues: TenantQueues,
    pub locks: TenantLocks,
    pub in_flight: InFlightTracker,
}

impl TenantRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self, tenant: &TenantId) -> TenantStatus {
        TenantStatus {
            tenant: tenant.0.clone(),
            queued: self.queues.size(tenant),
            in_flight: self.in_flight.active_count(tenant),
        }
    }

    /// Status of every tenant that has ever enqueued, sorted by tenant id.
    pub fn snapshot(&self) -> Vec<TenantStatus> {
        let mut tenants = self.queues.tenants();
        tenants.sort();
        tenants.iter().map(|t| self.status(t)).collect()
    }
}
