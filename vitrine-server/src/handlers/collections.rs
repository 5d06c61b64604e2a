use std::path::PathBuf;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vitrine_model::{
    BulkAddParams, Collection, CollectionId, CollectionSettings,
    CollectionStats,
};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

use super::JobAccepted;

#[derive(Debug, Serialize)]
pub struct CollectionResponse {
    pub id: Uuid,
    pub name: String,
    pub path: PathBuf,
    pub kind: String,
    pub settings: CollectionSettings,
    pub stats: CollectionStats,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Collection> for CollectionResponse {
    fn from(collection: Collection) -> Self {
        Self {
            id: collection.id.to_uuid(),
            name: collection.name,
            path: collection.path,
            kind: collection.kind.to_string(),
            settings: collection.settings,
            stats: collection.stats,
            created_at: collection.created_at,
            updated_at: collection.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCollectionRequest {
    pub path: PathBuf,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub settings: Option<CollectionSettings>,
}

#[derive(Debug, Serialize)]
pub struct CreateCollectionResponse {
    #[serde(flatten)]
    pub collection: CollectionResponse,
    /// The auto-scan job, when the collection's settings enqueue one.
    pub scan_job_id: Option<String>,
}

/// POST /api/v1/collections
pub async fn create_collection(
    State(state): State<AppState>,
    Json(request): Json<CreateCollectionRequest>,
) -> AppResult<impl IntoResponse> {
    let settings = request.settings.unwrap_or_default();
    let (collection, job) = state
        .admin
        .create_collection(request.name, request.path, settings)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(CreateCollectionResponse {
            collection: collection.into(),
            scan_job_id: job.map(|j| j.id.to_string()),
        }),
    ))
}

/// GET /api/v1/collections
pub async fn list_collections(
    State(state): State<AppState>,
) -> AppResult<Json<Vec<CollectionResponse>>> {
    let collections = state.admin.list_collections().await?;
    Ok(Json(
        collections.into_iter().map(CollectionResponse::from).collect(),
    ))
}

/// GET /api/v1/collections/random - uniform pick over non-deleted
/// collections; 404 when none exist.
pub async fn random_collection(
    State(state): State<AppState>,
) -> AppResult<Json<CollectionResponse>> {
    match state.admin.random_collection().await? {
        Some(collection) => Ok(Json(collection.into())),
        None => Err(AppError::not_found("no collections registered")),
    }
}

/// GET /api/v1/collections/{id}
pub async fn get_collection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CollectionResponse>> {
    let collection =
        state.admin.get_collection(CollectionId(id)).await?;
    Ok(Json(collection.into()))
}

/// DELETE /api/v1/collections/{id} - soft delete; the emitted events drop
/// the collection's entries from the cache tiers while the files stay on
/// disk for a purge pass.
pub async fn delete_collection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let events =
        state.admin.delete_collection(CollectionId(id)).await?;
    state.processor.apply_events(&events).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/collections/{id}/scan
pub async fn scan_collection(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job = state.admin.scan_collection(CollectionId(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

/// POST /api/v1/collections/{id}/thumbnails/regenerate
pub async fn regenerate_thumbnails(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let job =
        state.admin.regenerate_thumbnails(CollectionId(id)).await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}

#[derive(Debug, Deserialize)]
pub struct BulkAddRequest {
    pub parent_path: PathBuf,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub include_subfolders: bool,
    #[serde(default = "default_auto_add")]
    pub auto_add: bool,
}

fn default_auto_add() -> bool {
    true
}

/// POST /api/v1/collections/bulk
pub async fn bulk_add(
    State(state): State<AppState>,
    Json(request): Json<BulkAddRequest>,
) -> AppResult<impl IntoResponse> {
    let job = state
        .admin
        .bulk_add(BulkAddParams {
            parent_path: request.parent_path,
            prefix: request.prefix,
            include_subfolders: request.include_subfolders,
            auto_add: request.auto_add,
            child_job_ids: Vec::new(),
        })
        .await?;
    Ok((StatusCode::ACCEPTED, Json(JobAccepted::from(&job))))
}
