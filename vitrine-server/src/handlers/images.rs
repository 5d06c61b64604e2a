use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
};
use serde::Deserialize;
use uuid::Uuid;
use vitrine_core::artifact_store::fingerprint;
use vitrine_core::persistence::{
    CollectionsRepository as _, ImagesRepository as _,
};
use vitrine_core::CoreError;
use vitrine_model::{
    ArtifactSpec, Collection, EncodeFormat, ImageId, ImageRecord,
    VariantKind,
};

use crate::errors::{AppError, AppResult};
use crate::state::AppState;

const YEAR_SECS: u64 = 31_536_000;

#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub quality: Option<u8>,
    pub format: Option<String>,
    /// When set, a miss answers 202 and generation continues in the
    /// background instead of blocking the request on the codec.
    #[serde(rename = "async", default)]
    pub asynchronous: bool,
}

/// GET /api/v1/images/{imageId} - dynamic read path with optional resize.
pub async fn get_image(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
    Query(query): Query<ImageQuery>,
) -> AppResult<Response> {
    serve_variant(state, ImageId(image_id), VariantKind::Cache, query)
        .await
}

/// GET /api/v1/images/{imageId}/thumbnail - thumbnail-box rendition.
pub async fn get_thumbnail(
    State(state): State<AppState>,
    Path(image_id): Path<Uuid>,
    Query(query): Query<ImageQuery>,
) -> AppResult<Response> {
    serve_variant(state, ImageId(image_id), VariantKind::Thumbnail, query)
        .await
}

async fn serve_variant(
    state: AppState,
    image_id: ImageId,
    variant: VariantKind,
    query: ImageQuery,
) -> AppResult<Response> {
    let image = state
        .repos
        .images
        .get(image_id)
        .await?
        .ok_or_else(|| AppError::not_found(format!("image {image_id}")))?;
    let collection = state
        .repos
        .collections
        .get(image.collection_id)
        .await?
        .filter(|c| !c.is_deleted())
        .ok_or_else(|| {
            AppError::not_found(format!(
                "collection {}",
                image.collection_id
            ))
        })?;

    let spec = normalize(&collection, &image, variant, &query)?;
    let fp = fingerprint(&spec);
    let ttl = collection
        .settings
        .cache_expiration_secs
        .map(std::time::Duration::from_secs);
    let root = state
        .placement
        .root_for_collection(collection.id)
        .await?;

    if query.asynchronous
        && !state
            .read_cache
            .store()
            .is_valid(&root.path, &fp, spec.format, ttl)
            .await?
    {
        // Kick off generation under the same single-flight guard and
        // answer immediately; the client polls until the artifact lands.
        let read_cache = state.read_cache.clone();
        let processor = state.processor.clone();
        let background_collection = collection.clone();
        let background_image = image.clone();
        tokio::spawn(async move {
            let result = read_cache
                .get_or_produce(
                    &root,
                    &fp,
                    spec.format,
                    ttl,
                    || async {
                        processor
                            .produce_for_read(
                                &background_collection,
                                &background_image,
                                spec,
                            )
                            .await
                    },
                )
                .await;
            if let Err(err) = result {
                tracing::warn!(
                    image_id = %background_image.id,
                    "background variant generation failed: {err}"
                );
            }
        });
        return Response::builder()
            .status(StatusCode::ACCEPTED)
            .body(Body::empty())
            .map_err(|err| AppError::internal(err.to_string()));
    }

    // The resize bound applies to actual production only; cache hits never
    // wait on a permit. The wait happens inside the single-flight guard so
    // a burst of readers queues one permit, not ten.
    let permits = state.resize_permits.clone();
    let wait = state.resize_wait;
    let processor = state.processor.clone();
    let producer_collection = collection.clone();
    let producer_image = image.clone();
    let bytes = state
        .read_cache
        .get_or_produce(&root, &fp, spec.format, ttl, move || async move {
            let _permit =
                tokio::time::timeout(wait, permits.acquire_owned())
                    .await
                    .map_err(|_| CoreError::TooBusy)?
                    .map_err(|_| {
                        CoreError::Internal(
                            "resize semaphore closed".to_string(),
                        )
                    })?;
            processor
                .produce_for_read(
                    &producer_collection,
                    &producer_image,
                    spec,
                )
                .await
        })
        .await?;

    // A served artifact with a TTL always has its expiry ahead of it (an
    // expired one reads as a miss and is re-produced), so it gets the long
    // max-age; without a TTL there is no expiry to lean on and clients
    // must revalidate.
    let cache_control = match collection.settings.cache_expiration_secs {
        Some(ttl) => {
            format!("public, max-age={}", ttl.min(YEAR_SECS))
        }
        None => "no-cache".to_string(),
    };
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, spec.format.content_type())
        .header(header::CONTENT_LENGTH, bytes.len().to_string())
        .header(header::CACHE_CONTROL, cache_control)
        .body(Body::from(bytes.as_ref().clone()))
        .map_err(|err| AppError::internal(err.to_string()))?;
    Ok(response)
}

/// Normalization per the read-path contract: missing dimensions take the
/// variant's configured box, quality clamps into 1..=100 with a default of
/// 85, format defaults to jpeg.
fn normalize(
    collection: &Collection,
    image: &ImageRecord,
    variant: VariantKind,
    query: &ImageQuery,
) -> AppResult<ArtifactSpec> {
    let settings = &collection.settings;
    let (default_width, default_height) = match variant {
        VariantKind::Thumbnail => {
            (settings.thumbnail_width, settings.thumbnail_height)
        }
        VariantKind::Cache => {
            (settings.cache_width, settings.cache_height)
        }
    };

    let width = query.width.unwrap_or(default_width);
    let height = query.height.unwrap_or(default_height);
    if width == 0 || height == 0 {
        return Err(AppError::bad_request(
            "width and height must be positive",
        ));
    }

    let quality = query.quality.unwrap_or(85).clamp(1, 100);
    let format = match &query.format {
        Some(raw) => EncodeFormat::parse(raw).ok_or_else(|| {
            AppError::bad_request(format!("unknown format: {raw}"))
        })?,
        None => EncodeFormat::Jpeg,
    };

    Ok(ArtifactSpec {
        image_id: image.id,
        variant,
        width,
        height,
        quality,
        format,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vitrine_model::{CollectionKind, CollectionSettings};

    fn fixture() -> (Collection, ImageRecord) {
        let collection = Collection::new(
            "c",
            PathBuf::from("/data/c"),
            CollectionKind::Folder,
            CollectionSettings::default(),
        );
        let image = ImageRecord::new(
            collection.id,
            "a.jpg",
            10,
            800,
            600,
            "jpeg",
        );
        (collection, image)
    }

    #[test]
    fn missing_dimensions_take_the_variant_box() {
        let (collection, image) = fixture();
        let spec = normalize(
            &collection,
            &image,
            VariantKind::Thumbnail,
            &ImageQuery::default(),
        )
        .unwrap();
        assert_eq!((spec.width, spec.height), (300, 300));
        assert_eq!(spec.quality, 85);
        assert_eq!(spec.format, EncodeFormat::Jpeg);

        let spec = normalize(
            &collection,
            &image,
            VariantKind::Cache,
            &ImageQuery {
                width: Some(640),
                ..ImageQuery::default()
            },
        )
        .unwrap();
        assert_eq!((spec.width, spec.height), (640, 1080));
    }

    #[test]
    fn quality_clamps_and_format_validates() {
        let (collection, image) = fixture();
        let spec = normalize(
            &collection,
            &image,
            VariantKind::Cache,
            &ImageQuery {
                quality: Some(0),
                format: Some("webp".to_string()),
                ..ImageQuery::default()
            },
        )
        .unwrap();
        assert_eq!(spec.quality, 1);
        assert_eq!(spec.format, EncodeFormat::Webp);

        let bad = normalize(
            &collection,
            &image,
            VariantKind::Cache,
            &ImageQuery {
                format: Some("heic".to_string()),
                ..ImageQuery::default()
            },
        );
        assert!(bad.is_err());
    }

    #[test]
    fn normalized_requests_share_a_fingerprint() {
        let (collection, image) = fixture();
        let explicit = normalize(
            &collection,
            &image,
            VariantKind::Cache,
            &ImageQuery {
                width: Some(1920),
                height: Some(1080),
                quality: Some(85),
                format: Some("jpeg".to_string()),
                asynchronous: false,
            },
        )
        .unwrap();
        let defaulted = normalize(
            &collection,
            &image,
            VariantKind::Cache,
            &ImageQuery::default(),
        )
        .unwrap();
        assert_eq!(fingerprint(&explicit), fingerprint(&defaulted));
    }
}
