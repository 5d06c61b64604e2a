//! Router-level tests over the in-memory repositories: the admin surface,
//! the job endpoints, and the dynamic image read path.

use std::io::Cursor;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use image::{DynamicImage, ImageFormat};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;
use vitrine_core::persistence::memory::memory_repositories;
use vitrine_core::persistence::ImagesRepository as _;
use vitrine_server::config::{CacheRootConfig, Config};
use vitrine_server::{build_router, build_state, AppState};

struct TestServer {
    router: Router,
    state: AppState,
    _cache_dir: TempDir,
}

async fn spawn_server() -> TestServer {
    let cache_dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.cache.roots = vec![CacheRootConfig {
        name: "primary".to_string(),
        path: cache_dir.path().to_path_buf(),
        max_size_bytes: None,
        priority: 0,
    }];

    let repos = memory_repositories();
    let longpath = vitrine_core::LongPath::new(config.path.safe_limit);
    vitrine_server::startup::sync_cache_roots(&config, &repos, longpath)
        .await
        .unwrap();

    let state = build_state(&config, repos).await;
    TestServer {
        router: build_router(state.clone()),
        state,
        _cache_dir: cache_dir,
    }
}

fn encoded_jpeg(width: u32, height: u32) -> Vec<u8> {
    let raster = DynamicImage::new_rgb8(width, height);
    let mut out = Cursor::new(Vec::new());
    raster.write_to(&mut out, ImageFormat::Jpeg).unwrap();
    out.into_inner()
}

async fn request(
    server: &TestServer,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value, Option<String>) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder
                .header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = server
        .router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json, content_type)
}

async fn wait_for_job(server: &TestServer, job_id: &str) -> Value {
    for _ in 0..500 {
        let (status, body, _) = request(
            server,
            "GET",
            &format!("/api/v1/jobs/{job_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        match body["state"].as_str() {
            Some("completed") => return body,
            Some("failed") | Some("cancelled") => {
                panic!("job ended badly: {body}")
            }
            _ => {}
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} never completed");
}

#[tokio::test]
async fn healthz_reports_ok_with_an_active_root() {
    let server = spawn_server().await;
    let (status, body, _) =
        request(&server, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn random_collection_is_404_when_empty() {
    let server = spawn_server().await;
    let (status, _, _) =
        request(&server, "GET", "/api/v1/collections/random", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn create_scan_and_read_an_image() {
    let source_dir = TempDir::new().unwrap();
    std::fs::write(
        source_dir.path().join("photo.jpg"),
        encoded_jpeg(800, 600),
    )
    .unwrap();
    std::fs::write(source_dir.path().join("notes.txt"), b"skip")
        .unwrap();

    let server = spawn_server().await;

    let (status, body, _) = request(
        &server,
        "POST",
        "/api/v1/collections",
        Some(serde_json::json!({
            "path": source_dir.path(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let collection_id = body["id"].as_str().unwrap().to_string();
    let scan_job = body["scan_job_id"].as_str().unwrap().to_string();

    let job = wait_for_job(&server, &scan_job).await;
    assert_eq!(job["total_items"], 1);
    assert_eq!(job["completed_items"], 1);
    assert_eq!(job["progress_percent"], 100.0);

    // Random now returns the only collection.
    let (status, body, _) =
        request(&server, "GET", "/api/v1/collections/random", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"].as_str().unwrap(), collection_id);

    // Fetch the image bytes through the read path.
    let images = server
        .state
        .repos
        .images
        .list_by_collection(vitrine_model::CollectionId(
            collection_id.parse().unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(images.len(), 1);
    let image_id = images[0].id;

    let (status, _, content_type) = request(
        &server,
        "GET",
        &format!("/api/v1/images/{image_id}?width=320&height=240"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/jpeg"));

    // The thumbnail endpoint serves the pre-generated artifact.
    let (status, _, content_type) = request(
        &server,
        "GET",
        &format!("/api/v1/images/{image_id}/thumbnail"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/jpeg"));

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn reads_without_a_ttl_are_not_cacheable() {
    let source_dir = TempDir::new().unwrap();
    std::fs::write(
        source_dir.path().join("photo.jpg"),
        encoded_jpeg(400, 300),
    )
    .unwrap();

    let server = spawn_server().await;
    let (status, body, _) = request(
        &server,
        "POST",
        "/api/v1/collections",
        Some(serde_json::json!({ "path": source_dir.path() })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    wait_for_job(&server, body["scan_job_id"].as_str().unwrap()).await;

    let images = server
        .state
        .repos
        .images
        .list_by_collection(vitrine_model::CollectionId(
            body["id"].as_str().unwrap().parse().unwrap(),
        ))
        .await
        .unwrap();

    // Default settings carry no cache expiration, so the artifact has no
    // expiry ahead of it and clients must revalidate.
    let response = server
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("GET")
                .uri(format!(
                    "/api/v1/images/{}/thumbnail",
                    images[0].id
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn duplicate_collection_path_conflicts() {
    let source_dir = TempDir::new().unwrap();
    let server = spawn_server().await;

    let body = serde_json::json!({
        "path": source_dir.path(),
        "settings": { "auto_scan": false },
    });
    let (status, _, _) = request(
        &server,
        "POST",
        "/api/v1/collections",
        Some(body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, _, _) =
        request(&server, "POST", "/api/v1/collections", Some(body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn missing_paths_and_bad_formats_are_rejected() {
    let server = spawn_server().await;

    let (status, _, _) = request(
        &server,
        "POST",
        "/api/v1/collections",
        Some(serde_json::json!({ "path": "/does/not/exist" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing_image = vitrine_model::ImageId::new();
    let (status, _, _) = request(
        &server,
        "GET",
        &format!("/api/v1/images/{missing_image}"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn unknown_image_format_is_a_validation_error() {
    let source_dir = TempDir::new().unwrap();
    std::fs::write(
        source_dir.path().join("photo.jpg"),
        encoded_jpeg(100, 100),
    )
    .unwrap();

    let server = spawn_server().await;
    let (status, body, _) = request(
        &server,
        "POST",
        "/api/v1/collections",
        Some(serde_json::json!({ "path": source_dir.path() })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    wait_for_job(
        &server,
        body["scan_job_id"].as_str().unwrap(),
    )
    .await;

    let images = server
        .state
        .repos
        .images
        .list_by_collection(vitrine_model::CollectionId(
            body["id"].as_str().unwrap().parse().unwrap(),
        ))
        .await
        .unwrap();

    let (status, _, _) = request(
        &server,
        "GET",
        &format!("/api/v1/images/{}?format=heic", images[0].id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn long_nested_source_paths_scan_and_serve() {
    let base = TempDir::new().unwrap();
    let mut deep = base.path().to_path_buf();
    for level in 0..6 {
        deep = deep
            .join(format!("{}{level}", "deeply-nested-album-".repeat(3)));
    }
    std::fs::create_dir_all(&deep).unwrap();
    std::fs::write(deep.join("shot.jpg"), encoded_jpeg(800, 600)).unwrap();
    assert!(
        deep.join("shot.jpg").to_string_lossy().chars().count()
            > vitrine_core::longpath::DEFAULT_SAFE_LIMIT
    );

    let server = spawn_server().await;
    let (status, body, _) = request(
        &server,
        "POST",
        "/api/v1/collections",
        Some(serde_json::json!({ "path": base.path() })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let job = wait_for_job(
        &server,
        body["scan_job_id"].as_str().unwrap(),
    )
    .await;
    assert_eq!(job["completed_items"], 1);
    assert_eq!(job["failed_items"], 0);

    let images = server
        .state
        .repos
        .images
        .list_by_collection(vitrine_model::CollectionId(
            body["id"].as_str().unwrap().parse().unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(images.len(), 1);

    let (status, _, content_type) = request(
        &server,
        "GET",
        &format!("/api/v1/images/{}/thumbnail", images[0].id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("image/jpeg"));

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn async_generation_answers_202_then_serves() {
    let source_dir = TempDir::new().unwrap();
    std::fs::write(
        source_dir.path().join("photo.jpg"),
        encoded_jpeg(640, 480),
    )
    .unwrap();

    let server = spawn_server().await;
    let (status, body, _) = request(
        &server,
        "POST",
        "/api/v1/collections",
        Some(serde_json::json!({
            "path": source_dir.path(),
            "settings": { "auto_scan": false },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let collection_id: uuid::Uuid =
        body["id"].as_str().unwrap().parse().unwrap();

    // Register the image without scanning so no artifact exists yet.
    let image = vitrine_model::ImageRecord::new(
        vitrine_model::CollectionId(collection_id),
        "photo.jpg",
        0,
        640,
        480,
        "jpeg",
    );
    let image = server.state.repos.images.upsert(&image).await.unwrap();

    let uri = format!("/api/v1/images/{}?width=100&height=100&async=true", image.id);
    let (status, _, _) = request(&server, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // The background producer commits the artifact; polling converges.
    let mut served = false;
    for _ in 0..500 {
        let (status, _, _) = request(&server, "GET", &uri, None).await;
        if status == StatusCode::OK {
            served = true;
            break;
        }
        assert_eq!(status, StatusCode::ACCEPTED);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(served, "async generation never completed");

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn job_cancel_is_idempotent_over_http() {
    let server = spawn_server().await;

    // A pending job that never gets dispatched can be cancelled twice.
    let job = server
        .state
        .registry
        .enqueue(vitrine_model::JobPayload::Redistribute)
        .await
        .unwrap();

    let uri = format!("/api/v1/jobs/{}/cancel", job.id);
    let (status, first, _) =
        request(&server, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["state"], "cancelled");

    let (status, second, _) =
        request(&server, "POST", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["state"], "cancelled");
    assert_eq!(second["completed_at"], first["completed_at"]);

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn bulk_add_enqueues_children_and_aggregates() {
    let parent = TempDir::new().unwrap();
    for name in ["alpha", "beta"] {
        let dir = parent.path().join(name);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join("pic.jpg"), encoded_jpeg(200, 150))
            .unwrap();
    }
    std::fs::create_dir(parent.path().join("other")).unwrap();

    let server = spawn_server().await;
    let (status, body, _) = request(
        &server,
        "POST",
        "/api/v1/collections/bulk",
        Some(serde_json::json!({
            "parent_path": parent.path(),
            "prefix": null,
            "include_subfolders": true,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let parent_job = body["job_id"].as_str().unwrap().to_string();

    let done = wait_for_job(&server, &parent_job).await;
    assert_eq!(done["total_items"], 3);
    assert_eq!(done["completed_items"], 3);
    let children = &done["children"];
    assert_eq!(children["total"], 3);

    let (status, collections, _) =
        request(&server, "GET", "/api/v1/collections", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(collections.as_array().unwrap().len(), 3);

    server.state.pool.shutdown().await;
}

#[tokio::test]
async fn redistribute_returns_a_job() {
    let server = spawn_server().await;
    let (status, body, _) = request(
        &server,
        "POST",
        "/api/v1/cache/redistribute",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    wait_for_job(&server, body["job_id"].as_str().unwrap()).await;
    server.state.pool.shutdown().await;
}
