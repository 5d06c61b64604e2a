use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::handlers::{cache, collections, health, images, jobs};
use crate::state::AppState;

/// The versioned HTTP surface.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route(
            "/api/v1/collections",
            get(collections::list_collections)
                .post(collections::create_collection),
        )
        .route(
            "/api/v1/collections/random",
            get(collections::random_collection),
        )
        .route("/api/v1/collections/bulk", post(collections::bulk_add))
        .route(
            "/api/v1/collections/{id}",
            get(collections::get_collection)
                .delete(collections::delete_collection),
        )
        .route(
            "/api/v1/collections/{id}/scan",
            post(collections::scan_collection),
        )
        .route(
            "/api/v1/collections/{id}/thumbnails/regenerate",
            post(collections::regenerate_thumbnails),
        )
        .route("/api/v1/images/{imageId}", get(images::get_image))
        .route(
            "/api/v1/images/{imageId}/thumbnail",
            get(images::get_thumbnail),
        )
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route("/api/v1/jobs/{jobId}", get(jobs::get_job))
        .route("/api/v1/jobs/{jobId}/cancel", post(jobs::cancel_job))
        .route("/api/v1/jobs/{jobId}/pause", post(jobs::pause_job))
        .route("/api/v1/jobs/{jobId}/resume", post(jobs::resume_job))
        .route("/api/v1/cache/redistribute", post(cache::redistribute))
        .route(
            "/api/v1/cache/roots",
            get(cache::list_roots).post(cache::add_root),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
