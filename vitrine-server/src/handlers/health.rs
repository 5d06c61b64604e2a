use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use vitrine_core::persistence::{
    CacheRootsRepository as _, CollectionsRepository as _,
};

use crate::state::AppState;

/// GET /healthz - 200 when the metadata store answers, at least one active
/// cache root exists, and the worker pool is running.
pub async fn healthz(
    State(state): State<AppState>,
) -> (StatusCode, Json<Value>) {
    let store_ok = state.repos.collections.count().await.is_ok();
    let active_root = match state.repos.cache_roots.list().await {
        Ok(roots) => roots.iter().any(|root| root.is_active),
        Err(_) => false,
    };
    let workers_ok = state.pool.is_running();

    let healthy = store_ok && active_root && workers_ok;
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "metadata_store": store_ok,
            "active_cache_root": active_root,
            "worker_pool": workers_ok,
        })),
    )
}
