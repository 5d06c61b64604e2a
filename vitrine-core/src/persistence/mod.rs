//! Persistence contracts for the metadata store.
//!
//! Behaviour the core relies on is pinned by these ports (uniqueness,
//! compare-and-set job transitions, resumption queries), not by the driver.
//! `postgres` is the production implementation; `memory` backs tests and
//! keeps the semantics driver-independent.

pub mod memory;
pub mod postgres;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vitrine_model::{
    CacheRoot, CacheRootId, Collection, CollectionCacheBinding, CollectionId,
    ImageId, ImageRecord, JobId, JobKind, JobProgress, JobRecord, JobState,
};

use crate::error::Result;

#[async_trait]
pub trait CollectionsRepository: Send + Sync {
    /// Insert a new collection. `Conflict` when the path is already used by
    /// a non-deleted collection.
    async fn insert(&self, collection: &Collection) -> Result<()>;

    async fn get(&self, id: CollectionId) -> Result<Option<Collection>>;

    async fn find_by_path(&self, path: &Path) -> Result<Option<Collection>>;

    /// Non-deleted collections ordered by id.
    async fn list(&self) -> Result<Vec<Collection>>;

    async fn update(&self, collection: &Collection) -> Result<()>;

    /// Soft-delete. Returns false when already deleted or missing.
    async fn soft_delete(&self, id: CollectionId) -> Result<bool>;

    async fn count(&self) -> Result<u64>;

    /// Indexed fetch at an offset into the id-ordered non-deleted set;
    /// backs the random-collection read.
    async fn get_at_offset(&self, offset: u64) -> Result<Option<Collection>>;
}

#[async_trait]
pub trait ImagesRepository: Send + Sync {
    /// Insert or refresh by the `(collection_id, relative_path)` key. The
    /// stored record keeps its original id on refresh; the returned record
    /// is the canonical row.
    async fn upsert(&self, image: &ImageRecord) -> Result<ImageRecord>;

    async fn get(&self, id: ImageId) -> Result<Option<ImageRecord>>;

    async fn list_by_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<Vec<ImageRecord>>;
}

#[async_trait]
pub trait CacheRootsRepository: Send + Sync {
    /// Insert a new root. `Conflict` on duplicate path.
    async fn insert(&self, root: &CacheRoot) -> Result<()>;

    async fn get(&self, id: CacheRootId) -> Result<Option<CacheRoot>>;

    async fn list(&self) -> Result<Vec<CacheRoot>>;

    /// Adjust size/count counters by signed deltas, saturating at zero.
    async fn adjust_counters(
        &self,
        id: CacheRootId,
        delta_bytes: i64,
        delta_files: i64,
    ) -> Result<()>;
}

#[async_trait]
pub trait BindingsRepository: Send + Sync {
    /// Create or replace the binding for a collection.
    async fn bind(&self, binding: &CollectionCacheBinding) -> Result<()>;

    async fn get(
        &self,
        collection_id: CollectionId,
    ) -> Result<Option<CollectionCacheBinding>>;

    async fn list(&self) -> Result<Vec<CollectionCacheBinding>>;
}

#[async_trait]
pub trait JobsRepository: Send + Sync {
    async fn insert(&self, job: &JobRecord) -> Result<()>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    async fn list(
        &self,
        state: Option<JobState>,
        kind: Option<JobKind>,
    ) -> Result<Vec<JobRecord>>;

    /// Compare-and-set state transition. Fails with `Conflict` when the
    /// stored state differs from `expected` and with `IllegalTransition`
    /// when the edge is not on the state machine. Timestamps and
    /// `can_resume` are maintained here so every caller agrees on them.
    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        error_message: Option<String>,
    ) -> Result<JobRecord>;

    /// Fold a progress delta into the record and bump `last_progress_at`.
    async fn apply_progress(&self, progress: &JobProgress) -> Result<()>;

    async fn set_total_items(&self, id: JobId, total: u64) -> Result<()>;

    /// Persist payload mutations (bulk-add child ids) and attempt counters.
    async fn update_payload(&self, job: &JobRecord) -> Result<()>;

    /// Running jobs whose `last_progress_at` (or `started_at`) is older
    /// than the cutoff go back to Pending with `can_resume = true`.
    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>>;

    /// Startup recovery: resumable Running/Paused jobs back to Pending.
    async fn reclaim_resumable(&self) -> Result<Vec<JobRecord>>;
}

/// Bundle of every port, wired once at startup and passed through the call
/// graph instead of living in globals.
#[derive(Clone)]
pub struct Repositories {
    pub collections: Arc<dyn CollectionsRepository>,
    pub images: Arc<dyn ImagesRepository>,
    pub cache_roots: Arc<dyn CacheRootsRepository>,
    pub bindings: Arc<dyn BindingsRepository>,
    pub jobs: Arc<dyn JobsRepository>,
}

impl std::fmt::Debug for Repositories {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repositories").finish_non_exhaustive()
    }
}
