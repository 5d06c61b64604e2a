//! In-memory implementations of the persistence ports.
//!
//! These back the test suites and single-process setups; the semantics
//! (uniqueness, CAS transitions, reclaim queries) intentionally match the
//! Postgres implementation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use vitrine_model::{
    CacheRoot, CacheRootId, Collection, CollectionCacheBinding, CollectionId,
    ImageId, ImageRecord, JobId, JobKind, JobProgress, JobRecord, JobState,
};

use crate::error::{CoreError, Result};

use super::{
    BindingsRepository, CacheRootsRepository, CollectionsRepository,
    ImagesRepository, JobsRepository, Repositories,
};

/// Build a full in-memory repository bundle.
pub fn memory_repositories() -> Repositories {
    Repositories {
        collections: Arc::new(MemoryCollections::default()),
        images: Arc::new(MemoryImages::default()),
        cache_roots: Arc::new(MemoryCacheRoots::default()),
        bindings: Arc::new(MemoryBindings::default()),
        jobs: Arc::new(MemoryJobs::default()),
    }
}

#[derive(Debug, Default)]
pub struct MemoryCollections {
    rows: RwLock<HashMap<CollectionId, Collection>>,
}

#[async_trait]
impl CollectionsRepository for MemoryCollections {
    async fn insert(&self, collection: &Collection) -> Result<()> {
        let mut rows = self.rows.write().await;
        let duplicate = rows.values().any(|existing| {
            existing.deleted_at.is_none()
                && existing.path == collection.path
        });
        if duplicate {
            return Err(CoreError::Conflict(format!(
                "collection path already registered: {}",
                collection.path.display()
            )));
        }
        rows.insert(collection.id, collection.clone());
        Ok(())
    }

    async fn get(&self, id: CollectionId) -> Result<Option<Collection>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn find_by_path(&self, path: &Path) -> Result<Option<Collection>> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .find(|c| c.deleted_at.is_none() && c.path == path)
            .cloned())
    }

    async fn list(&self) -> Result<Vec<Collection>> {
        let mut items: Vec<_> = self
            .rows
            .read()
            .await
            .values()
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .collect();
        items.sort_by_key(|c| c.id);
        Ok(items)
    }

    async fn update(&self, collection: &Collection) -> Result<()> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&collection.id) {
            Some(slot) => {
                *slot = collection.clone();
                Ok(())
            }
            None => Err(CoreError::NotFound(format!(
                "collection {}",
                collection.id
            ))),
        }
    }

    async fn soft_delete(&self, id: CollectionId) -> Result<bool> {
        let mut rows = self.rows.write().await;
        match rows.get_mut(&id) {
            Some(row) if row.deleted_at.is_none() => {
                row.deleted_at = Some(Utc::now());
                row.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn count(&self) -> Result<u64> {
        Ok(self
            .rows
            .read()
            .await
            .values()
            .filter(|c| c.deleted_at.is_none())
            .count() as u64)
    }

    async fn get_at_offset(&self, offset: u64) -> Result<Option<Collection>> {
        let mut items: Vec<_> = self
            .rows
            .read()
            .await
            .values()
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .collect();
        items.sort_by_key(|c| c.id);
        Ok(items.into_iter().nth(offset as usize))
    }
}

#[derive(Debug, Default)]
pub struct MemoryImages {
    rows: RwLock<HashMap<ImageId, ImageRecord>>,
}

#[async_trait]
impl ImagesRepository for MemoryImages {
    async fn upsert(&self, image: &ImageRecord) -> Result<ImageRecord> {
        let mut rows = self.rows.write().await;
        let existing_id = rows
            .values()
            .find(|row| {
                row.collection_id == image.collection_id
                    && row.relative_path == image.relative_path
            })
            .map(|row| row.id);
        match existing_id {
            Some(id) => {
                let slot = rows.get_mut(&id).expect("row just found");
                slot.file_size_bytes = image.file_size_bytes;
                slot.width = image.width;
                slot.height = image.height;
                slot.format = image.format.clone();
                Ok(slot.clone())
            }
            None => {
                rows.insert(image.id, image.clone());
                Ok(image.clone())
            }
        }
    }

    async fn get(&self, id: ImageId) -> Result<Option<ImageRecord>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn list_by_collection(
        &self,
        collection_id: CollectionId,
    ) -> Result<Vec<ImageRecord>> {
        let mut items: Vec<_> = self
            .rows
            .read()
            .await
            .values()
            .filter(|row| row.collection_id == collection_id)
            .cloned()
            .collect();
        items.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        Ok(items)
    }

}

#[derive(Debug, Default)]
pub struct MemoryCacheRoots {
    rows: RwLock<HashMap<CacheRootId, CacheRoot>>,
}

#[async_trait]
impl CacheRootsRepository for MemoryCacheRoots {
    async fn insert(&self, root: &CacheRoot) -> Result<()> {
        let mut rows = self.rows.write().await;
        if rows.values().any(|r| r.path == root.path) {
            return Err(CoreError::Conflict(format!(
                "cache root path already registered: {}",
                root.path.display()
            )));
        }
        rows.insert(root.id, root.clone());
        Ok(())
    }

    async fn get(&self, id: CacheRootId) -> Result<Option<CacheRoot>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<CacheRoot>> {
        let mut items: Vec<_> =
            self.rows.read().await.values().cloned().collect();
        items.sort_by_key(|r| r.id);
        Ok(items)
    }

    async fn adjust_counters(
        &self,
        id: CacheRootId,
        delta_bytes: i64,
        delta_files: i64,
    ) -> Result<()> {
        let mut rows = self.rows.write().await;
        let row = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("cache root {id}")))?;
        row.current_size_bytes =
            saturating_apply(row.current_size_bytes, delta_bytes);
        row.file_count = saturating_apply(row.file_count, delta_files);
        Ok(())
    }
}

fn saturating_apply(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBindings {
    rows: RwLock<HashMap<CollectionId, CollectionCacheBinding>>,
}

#[async_trait]
impl BindingsRepository for MemoryBindings {
    async fn bind(&self, binding: &CollectionCacheBinding) -> Result<()> {
        self.rows
            .write()
            .await
            .insert(binding.collection_id, binding.clone());
        Ok(())
    }

    async fn get(
        &self,
        collection_id: CollectionId,
    ) -> Result<Option<CollectionCacheBinding>> {
        Ok(self.rows.read().await.get(&collection_id).cloned())
    }

    async fn list(&self) -> Result<Vec<CollectionCacheBinding>> {
        let mut items: Vec<_> =
            self.rows.read().await.values().cloned().collect();
        items.sort_by_key(|b| b.collection_id);
        Ok(items)
    }
}

#[derive(Debug, Default)]
pub struct MemoryJobs {
    rows: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobs {
    fn apply_transition(
        record: &mut JobRecord,
        next: JobState,
        error_message: Option<String>,
    ) {
        let now = Utc::now();
        record.state = next;
        match next {
            JobState::Running => {
                if record.started_at.is_none() {
                    record.started_at = Some(now);
                }
                record.attempts = record.attempts.saturating_add(1);
            }
            JobState::Completed | JobState::Cancelled => {
                record.completed_at = Some(now);
                record.can_resume = false;
            }
            JobState::Failed => {
                record.completed_at = Some(now);
            }
            JobState::Pending => {
                // Reclaim path: the job will be picked up again.
                record.can_resume = true;
            }
            JobState::Paused => {}
        }
        if let Some(message) = error_message {
            record.error_message = Some(message);
        }
    }
}

#[async_trait]
impl JobsRepository for MemoryJobs {
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        self.rows.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self.rows.read().await.get(&id).cloned())
    }

    async fn list(
        &self,
        state: Option<JobState>,
        kind: Option<JobKind>,
    ) -> Result<Vec<JobRecord>> {
        let mut items: Vec<_> = self
            .rows
            .read()
            .await
            .values()
            .filter(|job| state.is_none_or(|s| job.state == s))
            .filter(|job| kind.is_none_or(|k| job.kind() == k))
            .cloned()
            .collect();
        items.sort_by_key(|job| job.id);
        Ok(items)
    }

    async fn transition(
        &self,
        id: JobId,
        expected: JobState,
        next: JobState,
        error_message: Option<String>,
    ) -> Result<JobRecord> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
        if record.state != expected {
            return Err(CoreError::Conflict(format!(
                "job {id} is {}, expected {expected}",
                record.state
            )));
        }
        if !expected.can_transition_to(next) {
            return Err(CoreError::IllegalTransition {
                from: expected,
                to: next,
            });
        }
        Self::apply_transition(record, next, error_message);
        Ok(record.clone())
    }

    async fn apply_progress(&self, progress: &JobProgress) -> Result<()> {
        let mut rows = self.rows.write().await;
        let record = rows.get_mut(&progress.job_id).ok_or_else(|| {
            CoreError::NotFound(format!("job {}", progress.job_id))
        })?;
        record.completed_items += progress.completed_delta;
        record.failed_items += progress.failed_delta;
        record.skipped_items += progress.skipped_delta;
        record
            .processed_item_ids
            .extend(progress.processed_ids.iter().copied());
        record
            .failed_item_ids
            .extend(progress.failed_ids.iter().copied());
        record.last_progress_at = Some(Utc::now());
        Ok(())
    }

    async fn set_total_items(&self, id: JobId, total: u64) -> Result<()> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("job {id}")))?;
        record.total_items = total;
        Ok(())
    }

    async fn update_payload(&self, job: &JobRecord) -> Result<()> {
        let mut rows = self.rows.write().await;
        let record = rows
            .get_mut(&job.id)
            .ok_or_else(|| CoreError::NotFound(format!("job {}", job.id)))?;
        record.payload = job.payload.clone();
        record.attempts = job.attempts;
        Ok(())
    }

    async fn reclaim_stale(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        let mut rows = self.rows.write().await;
        let mut reclaimed = Vec::new();
        for record in rows.values_mut() {
            if record.state != JobState::Running || !record.can_resume {
                continue;
            }
            let reference =
                record.last_progress_at.or(record.started_at);
            if reference.is_some_and(|at| at < cutoff) {
                Self::apply_transition(record, JobState::Pending, None);
                reclaimed.push(record.clone());
            }
        }
        reclaimed.sort_by_key(|job| job.id);
        Ok(reclaimed)
    }

    async fn reclaim_resumable(&self) -> Result<Vec<JobRecord>> {
        let mut rows = self.rows.write().await;
        let mut reclaimed = Vec::new();
        for record in rows.values_mut() {
            let interrupted = matches!(
                record.state,
                JobState::Running | JobState::Paused
            );
            if interrupted && record.can_resume {
                Self::apply_transition(record, JobState::Pending, None);
                reclaimed.push(record.clone());
            }
        }
        reclaimed.sort_by_key(|job| job.id);
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use vitrine_model::{CollectionKind, CollectionSettings, JobPayload};

    fn sample_collection(path: &str) -> Collection {
        Collection::new(
            "sample",
            PathBuf::from(path),
            CollectionKind::Folder,
            CollectionSettings::default(),
        )
    }

    #[tokio::test]
    async fn duplicate_collection_path_conflicts() {
        let repo = MemoryCollections::default();
        repo.insert(&sample_collection("/data/a")).await.unwrap();
        let duplicate = repo.insert(&sample_collection("/data/a")).await;
        assert!(matches!(duplicate, Err(CoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn soft_deleted_path_can_be_reused() {
        let repo = MemoryCollections::default();
        let first = sample_collection("/data/a");
        repo.insert(&first).await.unwrap();
        assert!(repo.soft_delete(first.id).await.unwrap());
        repo.insert(&sample_collection("/data/a")).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn image_upsert_keeps_original_id() {
        let repo = MemoryImages::default();
        let collection_id = CollectionId::new();
        let first = ImageRecord::new(
            collection_id,
            "a.jpg",
            10,
            800,
            600,
            "jpeg",
        );
        let stored = repo.upsert(&first).await.unwrap();

        let refreshed = ImageRecord::new(
            collection_id,
            "a.jpg",
            12,
            1024,
            768,
            "jpeg",
        );
        let second = repo.upsert(&refreshed).await.unwrap();
        assert_eq!(second.id, stored.id);
        assert_eq!(second.width, 1024);
    }

    #[tokio::test]
    async fn job_transition_is_compare_and_set() {
        let repo = MemoryJobs::default();
        let job = JobRecord::new(JobPayload::Redistribute);
        repo.insert(&job).await.unwrap();

        repo.transition(job.id, JobState::Pending, JobState::Running, None)
            .await
            .unwrap();

        // A second worker believing the job is still Pending loses the race.
        let stale = repo
            .transition(job.id, JobState::Pending, JobState::Running, None)
            .await;
        assert!(matches!(stale, Err(CoreError::Conflict(_))));

        // Illegal edge is rejected even with the right expectation.
        let illegal = repo
            .transition(job.id, JobState::Running, JobState::Running, None)
            .await;
        assert!(matches!(
            illegal,
            Err(CoreError::IllegalTransition { .. })
        ));
    }

    #[tokio::test]
    async fn completed_jobs_cannot_resume() {
        let repo = MemoryJobs::default();
        let job = JobRecord::new(JobPayload::Redistribute);
        repo.insert(&job).await.unwrap();
        repo.transition(job.id, JobState::Pending, JobState::Running, None)
            .await
            .unwrap();
        let done = repo
            .transition(job.id, JobState::Running, JobState::Completed, None)
            .await
            .unwrap();
        assert!(!done.can_resume);
        assert!(done.completed_at.is_some());
        assert!(repo.reclaim_resumable().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_running_jobs_are_reclaimed() {
        let repo = MemoryJobs::default();
        let job = JobRecord::new(JobPayload::Redistribute);
        repo.insert(&job).await.unwrap();
        repo.transition(job.id, JobState::Pending, JobState::Running, None)
            .await
            .unwrap();

        let future_cutoff = Utc::now() + chrono::Duration::seconds(60);
        let reclaimed = repo.reclaim_stale(future_cutoff).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].state, JobState::Pending);
        assert!(reclaimed[0].can_resume);
    }
}
