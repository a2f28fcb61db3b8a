//! Per-tenant serialized resolve queue. Each tenant (a chat) has a FIFO of tasks and an async
//! lock; at most one resolver call per tenant is in flight, tenants drain in parallel.
//! The registry owns the tables, the dispatcher owns the drain loop, sinks are the boundary
//! to whoever shows results to users.

pub mod dispatcher;
pub mod registry;
pub mod sink;
pub mod task;

pub use dispatcher::{Accepted, Dispatcher};
pub use registry::{TenantRegistry, TenantStatus};
pub use sink::{Delivery, DeliveryError, NotificationSink, Notifier, SinkError};
pub use task::{FailureReason, OriginatorId, ResolutionOutcome, SubmitError, Task, TenantId};
