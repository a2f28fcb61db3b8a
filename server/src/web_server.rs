//! Axum HTTP server: read-only view of the resolve queue. GET /api/health, GET /api/tenants
//! (every chat that has queued work) and GET /api/tenants/{id}. Binds to 127.0.0.1 only.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};

use linkrelay_core::queue::{TenantRegistry, TenantStatus};

/// Shared app state: the registry the dispatcher mutates.
#[derive(Clone)]
struct AppState {
    registry: Arc<TenantRegistry>,
}

#[derive(serde::Serialize)]
struct HealthBody {
    status: &'static str,
}

/// Routes without a listener, so tests can drive them with `oneshot`.
pub fn router(registry: Arc<TenantRegistry>) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/tenants", get(list_tenants_handler))
        .route("/api/tenants/{id}", get(get_tenant_handler))
        .with_state(AppState { registry })
}

type ServeError = Box<dyn std::error::Error + Send + Sync>;

/// Binds 127.0.0.1:`port` and runs the status server with `bot` alongside it.
pub async fn run_web_server<B>(port: u16, registry: Arc<TenantRegistry>, bot: B) -> Result<(), ServeError>
where
    B: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "status API listening");
    serve_with_bot(listener, registry, bot).await
}

/// Spawns `bot` detached and serves until the listener fails. The bot stopping (disabled,
/// bad token) leaves the status API up.
pub async fn serve_with_bot<B>(
    listener: tokio::net::TcpListener,
    registry: Arc<TenantRegistry>,
    bot: B,
) -> Result<(), ServeError>
where
    B: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        bot.await;
        tracing::warn!(channel = "telegram", "bot stopped, status API still running");
    });
    axum::serve(listener, router(registry)).await?;
    Ok(())
}

async fn health_handler() -> Json<HealthBody> {
    Json(HealthBody { status: "ok" })
}

async fn list_tenants_handler(State(state): State<AppState>) -> Json<Vec<TenantStatus>> {
    Json(state.registry.snapshot())
}

/// GET /api/tenants/:id. 404 for a chat that never queued anything.
async fn get_tenant_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TenantStatus>, (StatusCode, String)> {
    state
        .registry
        .snapshot()
        .into_iter()
        .find(|s| s.tenant == id)
        .map(Json)
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Tenant not found: {}", id)))
}
