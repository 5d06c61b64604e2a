//! PostgreSQL implementations of the persistence ports.
//!
//! Queries are runtime-bound so the crate builds without a live database.
//! The schema is created idempotently at startup; the unique indexes here
//! are the source of truth for the model's uniqueness invariants.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use vitrine_model::{
    CacheRoot, CacheRootId, Collection, CollectionCacheBinding, CollectionId,
    CollectionKind, CollectionSettings, CollectionStats, ImageId,
    ImageRecord, JobId, JobKind, JobPayload, JobProgress, JobRecord,
    JobState,
};

use crate::error::{CoreError, Result};

use super::{
    BindingsRepository, CacheRootsRepository, CollectionsRepository,
    ImagesRepository, JobsRepository, Repositories,
};

/// Build the production repository bundle over one shared pool.
pub fn postgres_repositories(pool: PgPool) -> Repositories {
    Repositories {
        collections: std::sync::Arc::new(PostgresCollections::new(
            pool.clone(),
        )),
        images: std::sync::Arc::new(PostgresImages::new(pool.clone())),
        cache_roots: std::sync::Arc::new(PostgresCacheRoots::new(
            pool.clone(),
        )),
        bindings: std::sync::Arc::new(PostgresBindings::new(pool.clone())),
        jobs: std::sync::Arc::new(PostgresJobs::new(pool)),
    }
}

/// Idempotent schema bootstrap. Each statement is `IF NOT EXISTS` so
/// repeated startups are harmless.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    const STATEMENTS: &[&str] = &[
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            path TEXT NOT NULL,
            kind TEXT NOT NULL,
            settings JSONB NOT NULL,
            stats JSONB NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL,
            deleted_at TIMESTAMPTZ
        )
        "#,
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS collections_active_path
            ON collections (path) WHERE deleted_at IS NULL
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS images (
            id UUID PRIMARY KEY,
            collection_id UUID NOT NULL,
            filename TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            file_size_bytes BIGINT NOT NULL,
            width INTEGER NOT NULL,
            height INTEGER NOT NULL,
            format TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL,
            UNIQUE (collection_id, relative_path)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS cache_roots (
            id UUID PRIMARY KEY,
            name TEXT NOT NULL,
            path TEXT NOT NULL UNIQUE,
            max_size_bytes BIGINT,
            current_size_bytes BIGINT NOT NULL DEFAULT 0,
            file_count BIGINT NOT NULL DEFAULT 0,
            priority INTEGER NOT NULL DEFAULT 0,
            is_active BOOLEAN NOT NULL DEFAULT TRUE,
            created_at TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS collection_cache_bindings (
            collection_id UUID PRIMARY KEY,
            cache_root_id UUID NOT NULL,
            bound_at TIMESTAMPTZ NOT NULL
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS bindings_by_root
            ON collection_cache_bindings (cache_root_id)
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            state TEXT NOT NULL,
            payload JSONB NOT NULL,
            total_items BIGINT NOT NULL DEFAULT 0,
            completed_items BIGINT NOT NULL DEFAULT 0,
            failed_items BIGINT NOT NULL DEFAULT 0,
            skipped_items BIGINT NOT NULL DEFAULT 0,
            processed_item_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
            failed_item_ids JSONB NOT NULL DEFAULT '[]'::jsonb,
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            last_progress_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            error_message TEXT,
            can_resume BOOLEAN NOT NULL DEFAULT TRUE
        )
        "#,
        r#"
        CREATE INDEX IF NOT EXISTS jobs_by_state_kind ON jobs (state, kind)
        "#,
    ];

    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

const COLLECTION_COLUMNS: &str = "id, name, path, kind, settings, stats, \
     created_at, updated_at, deleted_at";

fn collection_from_row(row: &PgRow) -> Result<Collection> {
    let kind: String = row.try_get("kind")?;
    let kind = CollectionKind::parse(&kind).ok_or_else(|| {
        CoreError::Internal(format!("unknown collection kind: {kind}"))
    })?;
    let settings: serde_json::Value = row.try_get("settings")?;
    let settings: CollectionSettings = serde_json::from_value(settings)?;
    let stats: serde_json::Value = row.try_get("stats")?;
    let stats: CollectionStats = serde_json::from_value(stats)?;
    let path: String = row.try_get("path")?;
    Ok(Collection {
        id: CollectionId(row.try_get::<Uuid, _>("id")?),
        name: row.try_get("name")?,
        path: PathBuf::from(path),
        kind,
        settings,
        stats,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

#[derive(Clone, Debug)]
pub struct PostgresCollections {
    pool: PgPool,
}

impl PostgresCollections {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CollectionsRepository for PostgresCollections {
    async fn insert(&self, collection: &Collection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collections
                (id, name, path, kind, settings, stats,
                 created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(collection.id.to_uuid())
        .bind(&collection.name)
        .bind(collection.path.to_string_lossy().as_ref())
        .bind(collection.kind.as_str())
        .bind(serde_json::to_value(&collection.settings)?)
        .bind(serde_json::to_value(&collection.stats)?)
        .bind(collection.created_at)
        .bind(collection.updated_at)
        .bind(collection.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: CollectionId) -> Result<Option<Collection>> {
        let row = sqlx::query(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections WHERE id = $1"
        ))
        .bind(id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| collection_from_row(&r)).transpose()
    }

    async fn find_by_path(&self, path: &Path) -> Result<Option<Collection>> {
        let row = sqlx::query(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections \
             WHERE path = $1 AND deleted_at IS NULL"
        ))
        .bind(path.to_string_lossy().as_ref())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| collection_from_row(&r)).transpose()
    }

    async fn list(&self) -> Result<Vec<Collection>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections \
             WHERE deleted_at IS NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(collection_from_row).collect()
    }

    async fn update(&self, collection: &Collection) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE collections
            SET name = $2, settings = $3, stats = $4,
                updated_at = $5, deleted_at = $6
            WHERE id = $1
            "#,
        )
        .bind(collection.id.to_uuid())
        .bind(&collection.name)
        .bind(serde_json::to_value(&collection.settings)?)
        .bind(serde_json::to_value(&collection.stats)?)
        .bind(collection.updated_at)
        .bind(collection.deleted_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "collection {}",
                collection.id
            )));
        }
        Ok(())
    }

    async fn soft_delete(&self, id: CollectionId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE collections SET deleted_at = $2, updated_at = $2 \
             WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id.to_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM collections WHERE deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn get_at_offset(&self, offset: u64) -> Result<Option<Collection>> {
        let row = sqlx::query(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections \
             WHERE deleted_at IS NULL ORDER BY id LIMIT 1 OFFSET $1"
        ))
        .bind(offset as i64)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| collection_from_row(&r)).transpose()
    }
}

fn image_from_row(row: &PgRow) -> Result<ImageRecord> {
    Ok(ImageRecord {
        id: ImageId(row.try_get::<Uuid, _>("id")?),
        collection_id: CollectionId(row.try_get::<Uuid, _>("collection_id")?),
        filename: row.try_get("filename")?,
        relative_path: row.try_get("relative_path")?,
        file_size_bytes: row.try_get::<i64, _>("file_size_bytes")? as u64,
        width: row.try_get::<i32, _>("width")? as u32,
        height: row.try_get::<i32, _>("height")? as u32,
        format: row.try_get("format")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone, Debug)]
pub struct PostgresImages {
    pool: PgPool,
}

impl PostgresImages {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImagesRepository for PostgresImages {
    async fn upsert(&self, image: &ImageRecord) -> Result<ImageRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO images
                (id, collection_id, filename, relative_path,
                 file_size_bytes, width, height, format, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (collection_id, relative_path) DO UPDATE
            SET file_size_bytes = EXCLUDED.file_size_bytes,
                width = EXCLUDED.width,
                height = EXCLUDED.height,
                format = EXCLUDED.format
            RETURNING id, collection_id, filename, relative_path,
                      file_size_bytes, width, height, format, created_at
            "#,
        )
        .bind(image.id.to_uuid())
        .bind(image.collection_id.to_uuid())
        .bind(&image.filename)
        .bind(&image.relative_path)
        .bind(image.file_size_bytes as i64)
        .bind(image.width as i32)
        .bind(image.height as i32)
        .bind(&image.format)
        .bind(image.created_at)
        .fetch_one(&self.pool)
        .await?;
        image_from_row(&row)
    }

    async fn get(&self, id: ImageId) -> Result<Option<ImageRecord>> {
        let row = sqlx::query("SELECT * FROM images WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| image_from_row(&r)).transpose()
    }

    async fn list_by_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<Vec<ImageRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM images WHERE collection_id = $1 \
             ORDER BY relative_path",
        )
        .bind(collection_id.to_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(image_from_row).collect()
    }

}

fn cache_root_from_row(row: &PgRow) -> Result<CacheRoot> {
    let path: String = row.try_get("path")?;
    Ok(CacheRoot {
        id: CacheRootId(row.try_get::<Uuid, _>("id")?),
        name: row.try_get("name")?,
        path: PathBuf::from(path),
        max_size_bytes: row
            .try_get::<Option<i64>, _>("max_size_bytes")?
            .map(|v| v as u64),
        current_size_bytes: row.try_get::<i64, _>("current_size_bytes")?
            as u64,
        file_count: row.try_get::<i64, _>("file_count")? as u64,
        priority: row.try_get("priority")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
    })
}

#[derive(Clone, Debug)]
pub struct PostgresCacheRoots {
    pool: PgPool,
}

impl PostgresCacheRoots {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheRootsRepository for PostgresCacheRoots {
    async fn insert(&self, root: &CacheRoot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache_roots
                (id, name, path, max_size_bytes, current_size_bytes,
                 file_count, priority, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(root.id.to_uuid())
        .bind(&root.name)
        .bind(root.path.to_string_lossy().as_ref())
        .bind(root.max_size_bytes.map(|v| v as i64))
        .bind(root.current_size_bytes as i64)
        .bind(root.file_count as i64)
        .bind(root.priority)
        .bind(root.is_active)
        .bind(root.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: CacheRootId) -> Result<Option<CacheRoot>> {
        let row = sqlx::query("SELECT * FROM cache_roots WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| cache_root_from_row(&r)).transpose()
    }

    async fn list(&self) -> Result<Vec<CacheRoot>> {
        let rows = sqlx::query("SELECT * FROM cache_roots ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(cache_root_from_row).collect()
    }

    async fn adjust_counters(
        &self,
        id: CacheRootId,
        delta_bytes: i64,
        delta_files: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cache_roots
            SET current_size_bytes = GREATEST(0, current_size_bytes + $2),
                file_count = GREATEST(0, file_count + $3)
            WHERE id = $1
            "#,
        )
        .bind(id.to_uuid())
        .bind(delta_bytes)
        .bind(delta_files)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("cache root {id}")));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PostgresBindings {
    pool: PgPool,
}

impl PostgresBindings {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn binding_from_row(row: &PgRow) -> Result<CollectionCacheBinding> {
    Ok(CollectionCacheBinding {
        collection_id: CollectionId(row.try_get::<Uuid, _>("collection_id")?),
        cache_root_id: CacheRootId(row.try_get::<Uuid, _>("cache_root_id")?),
        bound_at: row.try_get("bound_at")?,
    })
}

#[async_trait]
impl BindingsRepository for PostgresBindings {
    async fn bind(&self, binding: &CollectionCacheBinding) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO collection_cache_bindings
                (collection_id, cache_root_id, bound_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection_id) DO UPDATE
            SET cache_root_id = EXCLUDED.cache_root_id,
                bound_at = EXCLUDED.bound_at
            "#,
        )
        .bind(binding.collection_id.to_uuid())
        .bind(binding.cache_root_id.to_uuid())
        .bind(binding.bound_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(
        &self,
        collection_id: CollectionId,
    ) -> Result<Option<CollectionCacheBinding>> {
        let row = sqlx::query(
            "SELECT * FROM collection_cache_bindings \
             WHERE collection_id = $1",
        )
        .bind(collection_id.to_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| binding_from_row(&r)).transpose()
    }

    async fn list(&self) -> Result<Vec<CollectionCacheBinding>> {
        let rows = sqlx::query(
            "SELECT * FROM collection_cache_bindings ORDER BY collection_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(binding_from_row).collect()
    }
}

#[derive(Clone, Debug)]
pub struct PostgresJobs {
    pool: PgPool,
}

impl PostgresJobs {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn job_from_row(row: &PgRow) -> Result<JobRecord> {
    let state: String = row.try_get("state")?;
    let state = JobState::parse(&state).ok_or_else(|| {
        CoreError::Internal(format!("unknown job state: {state}"))
    })?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let payload: JobPayload = serde_json::from_value(payload)?;
    let processed: serde_json::Value = row.try_get("processed_item_ids")?;
    let processed: Vec<ImageId> = serde_json::from_value(processed)?;
    let failed: serde_json::Value = row.try_get("failed_item_ids")?;
    let failed: Vec<ImageId> = serde_json::from_value(failed)?;
    Ok(JobRecord {
        id: JobId(row.try_get::<Uuid, _>("id")?),
        payload,
        state,
        total_items: row.try_get::<i64, _>("total_items")? as u64,
        completed_items: row.try_get::<i64, _>("completed_items")? as u64,
        failed_items: row.try_get::<i64, _>("failed_items")? as u64,
        skipped_items: row.try_get::<i64, _>("skipped_items")? as u64,
        processed_item_ids: processed.into_iter().collect(),
        failed_item_ids: failed.into_iter().collect(),
        attempts: row.try_get::<i32, _>("attempts")? as u16,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        last_progress_at: row.try_get("last_progress_at")?,
        completed_at: row.try_get("completed_at")?,
        error_message: row.try_get("error_message")?,
        can_resume: row.try_get("can_resume")?,
    })
}

#[async_trait]
impl JobsRepository for PostgresJobs {
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, kind, state, payload, total_items, completed_items,
                 failed_items, skipped_items, processed_item_ids,
                 failed_item_ids, attempts, created_at, started_at,
                 last_progress_at, completed_at, error_message, can_resume)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12,
                    $13, $14, $15, $16, $17)
            "#,
        )
        .bind(job.id.to_uuid())
        .bind(job.kind().as_str())
        .bind(job.state.as_str())
        .bind(serde_json::to_value(&job.payload)?)
        .bind(job.total_items as i64)
        .bind(job.completed_items as i64)
        .bind(job.failed_items as i64)
        .bind(job.skipped_items as i64)
        .bind(serde_json::to_value(
            job.processed_item_ids.iter().collect::<Vec<_>>(),
        )?)
        .bind(serde_json::to_value(
            job.failed_item_ids.iter().collect::<Vec<_>>(),
        )?)
        .bind(job.attempts as i32)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.last_progress_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(job.can_resume)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(id.to_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn list(
        &self,
        state: Option<JobState>,
        kind: Option<JobKind>,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE ($1::text IS NULL OR state = $1)
              AND ($2::text IS NULL OR kind = $2)
            ORDER BY id
            "#,
        )
        .bind(state.map(|s| s.as_str()))
        .bind(kind.map(|k| k.as_str()))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        error_message: Option<String>,
    ) -> Result<JobRecord> {
        if !expected.can_transition_to(next) {
            return Err(CoreError::IllegalTransition {
                from: expected,
                to: next,
            });
        }

        // The WHERE clause is the compare-and-set; timestamp bookkeeping
        // follows the target state.
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $3,
                started_at = CASE
                    WHEN $3 = 'running' THEN COALESCE(started_at, NOW())
                    ELSE started_at END,
                attempts = CASE
                    WHEN $3 = 'running' THEN attempts + 1
                    ELSE attempts END,
                completed_at = CASE
                    WHEN $3 IN ('completed', 'cancelled', 'failed') THEN NOW()
                    ELSE completed_at END,
                can_resume = CASE
                    WHEN $3 IN ('completed', 'cancelled') THEN FALSE
                    WHEN $3 = 'pending' THEN TRUE
                    ELSE can_resume END,
                error_message = COALESCE($4, error_message)
            WHERE id = $1 AND state = $2
            RETURNING *
            "#,
        )
        .bind(id.to_uuid())
        .bind(expected.as_str())
        .bind(next.as_str())
        .bind(error_message)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => job_from_row(&row),
            None => match self.get(id).await? {
                Some(current) => Err(CoreError::Conflict(format!(
                    "job {id} is {}, expected {expected}",
                    current.state
                ))),
                None => Err(CoreError::NotFound(format!("job {id}"))),
            },
        }
    }

    async fn apply_progress(&self, progress: &JobProgress) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET completed_items = completed_items + $2,
                failed_items = failed_items + $3,
                skipped_items = skipped_items + $4,
                processed_item_ids = processed_item_ids || $5::jsonb,
                failed_item_ids = failed_item_ids || $6::jsonb,
                last_progress_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(progress.job_id.to_uuid())
        .bind(progress.completed_delta as i64)
        .bind(progress.failed_delta as i64)
        .bind(progress.skipped_delta as i64)
        .bind(serde_json::to_value(&progress.processed_ids)?)
        .bind(serde_json::to_value(&progress.failed_ids)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "job {}",
                progress.job_id
            )));
        }
        Ok(())
    }

    async fn set_total_items(&self, id: JobId, total: u64) -> Result<()> {
        let result =
            sqlx::query("UPDATE jobs SET total_items = $2 WHERE id = $1")
                .bind(id.to_uuid())
                .bind(total as i64)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    async fn update_payload(&self, job: &JobRecord) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET payload = $2, attempts = $3 WHERE id = $1",
        )
        .bind(job.id.to_uuid())
        .bind(serde_json::to_value(&job.payload)?)
        .bind(job.attempts as i32)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("job {}", job.id)));
        }
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', can_resume = TRUE
            WHERE state = 'running'
              AND can_resume
              AND COALESCE(last_progress_at, started_at) < $1
            RETURNING *
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn reclaim_resumable(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', can_resume = TRUE
            WHERE state IN ('running', 'paused') AND can_resume
            RETURNING *
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }
}
