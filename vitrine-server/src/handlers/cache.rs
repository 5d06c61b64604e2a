use std::path::PathBuf;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vitrine_model::CacheRoot;

use crate::errors::AppResult;
use crate::state::AppState;

use super::JobAccepted;

#[derive(Debug, Serialize)]
pub struct CacheRootResponse {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub max_size_bytes: Option<u64>,
    pub current_size_bytes: u64,
    pub file_count: u64,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<CacheRoot> for CacheRootResponse {
    fn from(root: CacheRoot) -> Self {
        Self {
            id: root.id.to_uuid(),
            name: root.name,
            path: root.path,
            max_size_bytes: root.max_size_bytes,
            current_size_bytes: root.current_size_bytes,
            file_count: root.file_count,
            priority: root.priority,
            is_active: root.is_active,
            created_at: root.created_at,
        }
    }
}

/// POST /api/v1/cache/redistribute
pub async fn redistribute(
    State(state): State<AppState>,
) -> AppResult<impl IntoResponse> {
    let job = state.admin.redistribute_cache().await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

/// GET /api/v1/cache/roots
pub async fn list_roots(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<CacheRootResponse>>> {
    let roots = state.admin.list_cache_roots().await?;
    Ok(Json(
        roots.into_iter().map(CacheRootResponse::from).collect(),
    ))
}

#[derive(Debug, Deserialize)]
pub struct AddCacheRootRequest {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub max_size_bytes: Option<u64>,
    #[serde(default)]
    pub priority: i32,
}

/// POST /api/v1/cache/roots
pub async fn add_root(
    State(state): State<AppState>,
    Json(request): Json<AddCacheRootRequest>,
) -> AppResult<impl IntoResponse> {
    let root = state
        .admin
        .add_cache_root(
            request.name,
            request.path,
            request.max_size_bytes,
            request.priority,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(CacheRootResponse::from(root))))
}
