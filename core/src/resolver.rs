//! Bypass API client: one GET per task against `{base}/{kind}?url=...`, normalised into a
//! resolved value or a `ResolveError`. The dispatcher only sees the `ResolverClient` trait.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

pub const DEFAULT_API_BASE: &str = "https://trw.lat/api/bypass";

/// Response fields that carry the resolved value, highest priority first.
pub const RESOLVED_FIELDS: [&str; 3] = ["bypassed", "key", "result"];

/// Link families the bypass API has a route for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BypassKind {
    Linkvertise,
    Rekonise,
    Workink,
}

impl BypassKind {
    /// Path segment appended to the API base.
    pub fn route(&self) -> &'static str {
        match self {
            BypassKind::Linkvertise => "linkvertise",
            BypassKind::Rekonise => "rekonise",
            BypassKind::Workink => "workink",
        }
    }

    /// Human label for replies.
    pub fn label(&self) -> &'static str {
        match self {
            BypassKind::Linkvertise => "Linkvertise",
            BypassKind::Rekonise => "Rekonise",
            BypassKind::Workink => "Work.ink",
        }
    }

    pub fn all() -> &'static [BypassKind] {
        &[BypassKind::Linkvertise, BypassKind::Rekonise, BypassKind::Workink]
    }
}

impl fmt::Display for BypassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.route())
    }
}

/// Error for a kind outside the fixed set. Carries the rejected input.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown link kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for BypassKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linkvertise" => Ok(BypassKind::Linkvertise),
            "rekonise" => Ok(BypassKind::Rekonise),
            "workink" | "work.ink" => Ok(BypassKind::Workink),
            _ => Err(UnknownKind(s.trim().to_string())),
        }
    }
}

/// Why a resolver call produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// No response within the bound.
    #[error("resolver timed out after {0:?}")]
    Timeout(Duration),
    /// Network failure or a non-2xx status.
    #[error("resolver unavailable: {0}")]
    Upstream(String),
    /// The API answered but none of the known result fields were present.
    #[error("resolver returned no result")]
    Unresolved,
}

/// One outbound call to the bypass API.
#[async_trait]
pub trait ResolverClient: Send + Sync {
    async fn resolve(&self, kind: BypassKind, target: &Url) -> Result<String, ResolveError>;
}

/// Full request URL for `target` under `kind`'s route. The target is percent-encoded as `url=`.
pub fn api_url(base: &str, kind: BypassKind, target: &str) -> String {
    format!(
        "{}/{}?url={}",
        base.trim_end_matches('/'),
        kind.route(),
        urlencoding::encode(target)
    )
}

/// First recognised, non-empty result field of the response body.
pub fn extract_resolved(body: &serde_json::Value) -> Option<String> {
    RESOLVED_FIELDS.iter().find_map(|field| match body.get(field)? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) if n.as_f64() != Some(0.0) => Some(n.to_string()),
        serde_json::Value::Bool(true) => Some("true".to_string()),
        _ => None,
    })
}

/// reqwest-backed resolver. The client-level timeout bounds connect + body.
pub struct HttpResolver {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpResolver {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolveError::Upstream(format!("reqwest client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            timeout,
        })
    }

    fn map_transport_error(&self, e: reqwest::Error) -> ResolveError {
        if e.is_timeout() {
            ResolveError::Timeout(self.timeout)
        } else {
            ResolveError::Upstream(e.to_string())
        }
    }
}

#[async_trait]
impl ResolverClient for HttpResolver {
    async fn resolve(&self, kind: BypassKind, target: &Url) -> Result<String, ResolveError> {
        let url = api_url(&self.base_url, kind, target.as_str());
        let res = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        let status = res.status();
        if !status.is_success() {
            return Err(ResolveError::Upstream(format!("status {}", status)));
        }
        let body = res.text().await.map_err(|e| self.map_transport_error(e))?;
        let Ok(json) = serde_json::from_str::<serde_json::Value>(&body) else {
            tracing::debug!(kind = %kind, bytes = body.len(), "resolver body is not JSON");
            return Err(ResolveError::Unresolved);
        };
        extract_resolved(&json).ok_or(ResolveError::Unresolved)
    }
}
