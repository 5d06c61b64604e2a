//! Admin operations: everything here reduces to repository writes plus job
//! enqueues on the worker pool.

use std::path::PathBuf;
use std::sync::Arc;

use rand::Rng;
use tracing::info;
use vitrine_model::{
    BulkAddParams, CacheRoot, Collection, CollectionId, CollectionKind,
    CollectionSettings, DomainEvent, JobPayload, JobRecord, ScanParams,
};

use crate::error::{CoreError, Result};
use crate::jobs::{JobRegistry, WorkerPool};
use crate::longpath::LongPath;
use crate::persistence::{
    CacheRootsRepository as _, CollectionsRepository as _, Repositories,
};

#[derive(Clone)]
pub struct AdminService {
    repos: Repositories,
    registry: JobRegistry,
    pool: Arc<WorkerPool>,
    longpath: LongPath,
}

impl std::fmt::Debug for AdminService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminService").finish_non_exhaustive()
    }
}

impl AdminService {
    pub fn new(
        repos: Repositories,
        registry: JobRegistry,
        pool: Arc<WorkerPool>,
        longpath: LongPath,
    ) -> Self {
        Self {
            repos,
            registry,
            pool,
            longpath,
        }
    }

    async fn enqueue_and_dispatch(
        &self,
        payload: JobPayload,
    ) -> Result<JobRecord> {
        let job = self.registry.enqueue(payload).await?;
        self.pool.submit(job.id).await?;
        Ok(job)
    }

    /// Register a collection. The container kind is inferred from the path
    /// and fixed from here on; `auto_scan` enqueues the first walk.
    pub async fn create_collection(
        &self,
        name: Option<String>,
        path: PathBuf,
        settings: CollectionSettings,
    ) -> Result<(Collection, Option<JobRecord>)> {
        if !self.longpath.exists(&path).await? {
            return Err(CoreError::Validation(format!(
                "collection path does not exist: {}",
                path.display()
            )));
        }
        let kind = CollectionKind::from_path(&path).ok_or_else(|| {
            CoreError::Validation(format!(
                "not a folder or supported archive: {}",
                path.display()
            ))
        })?;
        let name = name.unwrap_or_else(|| {
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string_lossy().into_owned())
        });

        let collection =
            Collection::new(name, path, kind, settings);
        self.repos.collections.insert(&collection).await?;
        info!(
            collection = %collection.id,
            kind = %collection.kind,
            "collection created"
        );

        let job = if collection.settings.auto_scan {
            Some(
                self.enqueue_and_dispatch(JobPayload::ScanCollection(
                    ScanParams {
                        collection_id: collection.id,
                    },
                ))
                .await?,
            )
        } else {
            None
        };
        Ok((collection, job))
    }

    pub async fn get_collection(
        &self,
        id: CollectionId,
    ) -> Result<Collection> {
        self.repos
            .collections
            .get(id)
            .await?
            .filter(|c| !c.is_deleted())
            .ok_or_else(|| CoreError::NotFound(format!("collection {id}")))
    }

    pub async fn list_collections(&self) -> Result<Vec<Collection>> {
        self.repos.collections.list().await
    }

    /// Soft delete; images and artifacts stay until a purge pass. The
    /// emitted event carries only the id.
    pub async fn delete_collection(
        &self,
        id: CollectionId,
    ) -> Result<Vec<DomainEvent>> {
        if !self.repos.collections.soft_delete(id).await? {
            return Err(CoreError::NotFound(format!("collection {id}")));
        }
        Ok(vec![DomainEvent::CollectionDeleted { collection_id: id }])
    }

    /// Uniform pick over non-deleted collections: one count, one indexed
    /// fetch at a random offset.
    pub async fn random_collection(&self) -> Result<Option<Collection>> {
        let count = self.repos.collections.count().await?;
        if count == 0 {
            return Ok(None);
        }
        let offset = rand::thread_rng().gen_range(0..count);
        self.repos.collections.get_at_offset(offset).await
    }

    pub async fn scan_collection(
        &self,
        id: CollectionId,
    ) -> Result<JobRecord> {
        self.get_collection(id).await?;
        self.enqueue_and_dispatch(JobPayload::ScanCollection(ScanParams {
            collection_id: id,
        }))
        .await
    }

    pub async fn regenerate_thumbnails(
        &self,
        id: CollectionId,
    ) -> Result<JobRecord> {
        self.get_collection(id).await?;
        self.enqueue_and_dispatch(JobPayload::RegenerateThumbnails(
            ScanParams { collection_id: id },
        ))
        .await
    }

    pub async fn bulk_add(
        &self,
        params: BulkAddParams,
    ) -> Result<JobRecord> {
        if !self.longpath.exists(&params.parent_path).await? {
            return Err(CoreError::Validation(format!(
                "bulk-add parent does not exist: {}",
                params.parent_path.display()
            )));
        }
        self.enqueue_and_dispatch(JobPayload::BulkAdd(params)).await
    }

    pub async fn redistribute_cache(&self) -> Result<JobRecord> {
        self.enqueue_and_dispatch(JobPayload::Redistribute).await
    }

    /// Register a cache root and make sure its directory exists.
    pub async fn add_cache_root(
        &self,
        name: String,
        path: PathBuf,
        max_size_bytes: Option<u64>,
        priority: i32,
    ) -> Result<CacheRoot> {
        self.longpath.ensure_dir(&path).await?;
        let mut root = CacheRoot::new(name, path);
        root.max_size_bytes = max_size_bytes;
        root.priority = priority;
        self.repos.cache_roots.insert(&root).await?;
        info!(cache_root = %root.id, "cache root registered");
        Ok(root)
    }

    pub async fn list_cache_roots(&self) -> Result<Vec<CacheRoot>> {
        self.repos.cache_roots.list().await
    }
}
