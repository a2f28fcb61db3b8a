//! Task and outcome types shared by the registry, dispatcher and sinks.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use url::Url;

use crate::resolver::{BypassKind, ResolveError, UnknownKind};

/// Scope under which tasks are serialized (e.g. "telegram:-100123").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId(pub String);

/// User who submitted a task (e.g. "telegram:42").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginatorId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for OriginatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        TenantId(s.to_string())
    }
}

impl From<&str> for OriginatorId {
    fn from(s: &str) -> Self {
        OriginatorId(s.to_string())
    }
}

/// One user's link-resolution request. Immutable once enqueued.
#[derive(Debug, Clone)]
pub struct Task {
    pub tenant: TenantId,
    pub originator: OriginatorId,
    /// Display name for replies ("@alice").
    pub requester: String,
    pub kind: BypassKind,
    pub target: Url,
    pub submitted_at: Instant,
}

/// Why a task produced no value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Timeout(Duration),
    /// Transport error or error status from the API.
    Upstream(String),
    /// The API answered without a recognised result field.
    Unresolved,
}

impl FailureReason {
    /// Whether the failure is operational (goes to the error sink) rather than a business outcome.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, FailureReason::Unresolved)
    }
}

impl From<ResolveError> for FailureReason {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::Timeout(after) => FailureReason::Timeout(after),
            ResolveError::Upstream(msg) => FailureReason::Upstream(msg),
            ResolveError::Unresolved => FailureReason::Unresolved,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout(after) => write!(f, "timed out after {:.1}s", after.as_secs_f64()),
            FailureReason::Upstream(e) => write!(f, "upstream error: {}", e),
            FailureReason::Unresolved => f.write_str("no result returned"),
        }
    }
}

/// Produced once per task, consumed once by delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionOutcome {
    /// `elapsed` is measured from submission, queue wait included.
    Success { value: String, elapsed: Duration },
    Failure(FailureReason),
}

impl ResolutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ResolutionOutcome::Success { .. })
    }
}

/// Submission rejected before anything was enqueued.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    UnknownKind(#[from] UnknownKind),
    #[error("invalid link: {0}")]
    MalformedLink(String),
}

/// Basic well-formedness: absolute http(s) URL with a host.
pub fn parse_link(raw: &str) -> Result<Url, SubmitError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(SubmitError::MalformedLink("empty link".to_string()));
    }
    let url = Url::parse(raw).map_err(|e| SubmitError::MalformedLink(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SubmitError::MalformedLink(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(SubmitError::MalformedLink("missing host".to_string()));
    }
    Ok(url)
}
