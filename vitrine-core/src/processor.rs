//! The per-image pipeline and the only writer to the artifact store.
//!
//! For every item: probe, persist the image record, produce the missing
//! thumbnail and cache variants, then report progress. Item errors are
//! captured into the job record and never fail the whole job; cancellation
//! and pause are observed between items.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use vitrine_model::{
    ArtifactSpec, BulkAddParams, Collection, CollectionKind,
    CollectionSettings, DomainEvent, EncodeFormat, ImageId, ImageRecord,
    JobPayload, JobProgress, JobRecord, ScanParams, VariantKind,
};

use crate::archive::{open_source, ArchiveSource, EntryMeta};
use crate::artifact_store::{fingerprint, ArtifactStore};
use crate::codec::ImageCodec;
use crate::error::{CoreError, Result};
use crate::jobs::{JobContext, JobExecutor};
use crate::longpath::LongPath;
use crate::placement::PlacementEngine;
use crate::persistence::{
    CacheRootsRepository as _, CollectionsRepository as _,
    ImagesRepository as _, Repositories,
};
use crate::read_cache::ReadCache;

/// Items handled per batch before yielding back to the scheduler. A
/// tunable, not a contract.
pub const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Clone)]
pub struct ImageProcessor {
    repos: Repositories,
    placement: PlacementEngine,
    store: ArtifactStore,
    codec: ImageCodec,
    read_cache: Arc<ReadCache>,
    longpath: LongPath,
    batch_size: usize,
}

impl std::fmt::Debug for ImageProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageProcessor")
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

/// Which variants a job run is responsible for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VariantPlan {
    thumbnails: bool,
    cache: bool,
}

impl ImageProcessor {
    pub fn new(
        repos: Repositories,
        placement: PlacementEngine,
        store: ArtifactStore,
        codec: ImageCodec,
        read_cache: Arc<ReadCache>,
        longpath: LongPath,
    ) -> Self {
        Self {
            repos,
            placement,
            store,
            codec,
            read_cache,
            longpath,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// The artifact parameters for one variant of one image, derived from
    /// the collection's settings. Thumbnails always encode as jpeg; cache
    /// variants follow the configured cache format.
    pub fn variant_spec(
        settings: &CollectionSettings,
        image: &ImageRecord,
        variant: VariantKind,
    ) -> ArtifactSpec {
        match variant {
            VariantKind::Thumbnail => ArtifactSpec {
                image_id: image.id,
                variant,
                width: settings.thumbnail_width,
                height: settings.thumbnail_height,
                quality: settings.clamped_quality(),
                format: EncodeFormat::Jpeg,
            },
            VariantKind::Cache => ArtifactSpec {
                image_id: image.id,
                variant,
                width: settings.cache_width,
                height: settings.cache_height,
                quality: settings.clamped_quality(),
                format: settings.cache_format,
            },
        }
    }

    fn artifact_ttl(settings: &CollectionSettings) -> Option<Duration> {
        settings.cache_expiration_secs.map(Duration::from_secs)
    }

    async fn load_collection(
        &self,
        params: &ScanParams,
    ) -> Result<Collection> {
        let collection = self
            .repos
            .collections
            .get(params.collection_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "collection {}",
                    params.collection_id
                ))
            })?;
        if collection.is_deleted() {
            return Err(CoreError::NotFound(format!(
                "collection {} is deleted",
                collection.id
            )));
        }
        Ok(collection)
    }

    fn source_for(&self, collection: &Collection) -> Arc<dyn ArchiveSource> {
        Arc::from(open_source(
            collection.kind,
            &collection.path,
            self.longpath,
        ))
    }

    async fn list_entries(
        source: &Arc<dyn ArchiveSource>,
    ) -> Result<Vec<EntryMeta>> {
        let source = source.clone();
        tokio::task::spawn_blocking(move || source.entries())
            .await
            .map_err(|err| {
                CoreError::Internal(format!("listing task panicked: {err}"))
            })?
    }

    async fn read_entry(
        source: &Arc<dyn ArchiveSource>,
        entry: &EntryMeta,
    ) -> Result<Vec<u8>> {
        let source = source.clone();
        let entry = entry.clone();
        tokio::task::spawn_blocking(move || {
            let mut reader = source.open(&entry)?;
            let mut bytes = Vec::with_capacity(entry.size_bytes as usize);
            std::io::Read::read_to_end(&mut reader, &mut bytes)?;
            Ok(bytes)
        })
        .await
        .map_err(|err| {
            CoreError::Internal(format!("read task panicked: {err}"))
        })?
    }

    /// Produce and store one variant unless a valid artifact already
    /// exists. Returns the written byte count, or `None` when skipped.
    async fn ensure_variant(
        &self,
        collection: &Collection,
        image: &ImageRecord,
        source_bytes: &Arc<Vec<u8>>,
        variant: VariantKind,
    ) -> Result<Option<u64>> {
        let spec =
            Self::variant_spec(&collection.settings, image, variant);
        let fp = fingerprint(&spec);
        let ttl = Self::artifact_ttl(&collection.settings);
        let root =
            self.placement.root_for_collection(collection.id).await?;

        if self
            .store
            .is_valid(&root.path, &fp, spec.format, ttl)
            .await?
        {
            return Ok(None);
        }

        let codec = self.codec;
        let bytes = source_bytes.clone();
        let rendered = tokio::task::spawn_blocking(move || {
            codec.render_variant(
                &bytes,
                spec.width,
                spec.height,
                spec.quality,
                spec.format,
            )
        })
        .await
        .map_err(|err| {
            CoreError::Internal(format!("codec task panicked: {err}"))
        })??;

        let token = self
            .placement
            .reserve(root.id, rendered.len() as u64)
            .await?;
        let stored = match self
            .store
            .write(&root.path, &fp, spec.format, &rendered)
            .await
        {
            Ok(stored) => stored,
            Err(err) => {
                self.placement.abort(token).await;
                return Err(err);
            }
        };
        self.placement.commit(token, stored.size_bytes).await?;
        debug!(
            image_id = %image.id,
            variant = %variant,
            bytes = stored.size_bytes,
            "artifact stored"
        );
        Ok(Some(stored.size_bytes))
    }

    /// Synchronous production for the HTTP read path, run under the read
    /// cache's single-flight guard. Returns the encoded bytes after
    /// committing them to the artifact store.
    pub async fn produce_for_read(
        &self,
        collection: &Collection,
        image: &ImageRecord,
        spec: ArtifactSpec,
    ) -> Result<Vec<u8>> {
        let source = self.source_for(collection);
        let entry = EntryMeta {
            relative_path: image.relative_path.clone(),
            size_bytes: image.file_size_bytes,
        };
        let source_bytes = Self::read_entry(&source, &entry).await?;

        let codec = self.codec;
        let rendered = {
            let bytes = source_bytes;
            tokio::task::spawn_blocking(move || {
                codec.render_variant(
                    &bytes,
                    spec.width,
                    spec.height,
                    spec.quality,
                    spec.format,
                )
            })
            .await
            .map_err(|err| {
                CoreError::Internal(format!("codec task panicked: {err}"))
            })??
        };

        let fp = fingerprint(&spec);
        let root =
            self.placement.root_for_collection(collection.id).await?;
        let token = self
            .placement
            .reserve(root.id, rendered.len() as u64)
            .await?;
        match self
            .store
            .write(&root.path, &fp, spec.format, &rendered)
            .await
        {
            Ok(stored) => {
                self.placement.commit(token, stored.size_bytes).await?;
            }
            Err(err) => {
                self.placement.abort(token).await;
                return Err(err);
            }
        }
        Ok(rendered)
    }

    /// Consume a buffer of domain events. Image invalidations drop every
    /// derived artifact from all three tiers; collection deletions only
    /// clear the memory and shared tiers, leaving the files for a purge.
    pub async fn apply_events(
        &self,
        events: &[DomainEvent],
    ) -> Result<()> {
        for event in events {
            match event {
                DomainEvent::ImageInvalidated { image_id } => {
                    let Some(image) =
                        self.repos.images.get(*image_id).await?
                    else {
                        continue;
                    };
                    let Some(collection) = self
                        .repos
                        .collections
                        .get(image.collection_id)
                        .await?
                    else {
                        continue;
                    };
                    let root = self
                        .placement
                        .root_for_collection(collection.id)
                        .await?;
                    for variant in
                        [VariantKind::Thumbnail, VariantKind::Cache]
                    {
                        let spec = Self::variant_spec(
                            &collection.settings,
                            &image,
                            variant,
                        );
                        self.read_cache
                            .invalidate(
                                &root,
                                &fingerprint(&spec),
                                spec.format,
                            )
                            .await?;
                    }
                    debug!(image_id = %image_id, "image invalidated");
                }
                DomainEvent::CollectionDeleted { collection_id } => {
                    let Some(collection) =
                        self.repos.collections.get(*collection_id).await?
                    else {
                        continue;
                    };
                    let images = self
                        .repos
                        .images
                        .list_by_collection(*collection_id)
                        .await?;
                    for image in &images {
                        for variant in
                            [VariantKind::Thumbnail, VariantKind::Cache]
                        {
                            let spec = Self::variant_spec(
                                &collection.settings,
                                image,
                                variant,
                            );
                            self.read_cache
                                .forget(&fingerprint(&spec))
                                .await;
                        }
                    }
                    info!(
                        collection_id = %collection_id,
                        images = images.len(),
                        "collection entries dropped from cache tiers"
                    );
                }
            }
        }
        Ok(())
    }

    /// One scan item: probe, upsert the record, produce missing variants.
    /// A source whose size or dimensions changed since the last scan gets
    /// an invalidation event before its variants are rebuilt. Returns the
    /// canonical image record.
    async fn process_entry(
        &self,
        collection: &Collection,
        source: &Arc<dyn ArchiveSource>,
        entry: &EntryMeta,
        job: &JobRecord,
        plan: VariantPlan,
        known_id: Option<ImageId>,
    ) -> Result<Option<ImageRecord>> {
        let bytes = Arc::new(Self::read_entry(source, entry).await?);

        let codec = self.codec;
        let probe = {
            let bytes = bytes.clone();
            tokio::task::spawn_blocking(move || codec.probe(&bytes))
                .await
                .map_err(|err| {
                    CoreError::Internal(format!(
                        "probe task panicked: {err}"
                    ))
                })??
        };

        let new_size = entry.size_bytes.max(bytes.len() as u64);
        let mut events = Vec::new();
        if let Some(id) = known_id {
            if let Some(previous) = self.repos.images.get(id).await? {
                let replaced = previous.file_size_bytes != new_size
                    || previous.width != probe.width
                    || previous.height != probe.height;
                if replaced {
                    events.push(DomainEvent::ImageInvalidated {
                        image_id: id,
                    });
                }
            }
        }
        self.apply_events(&events).await?;

        let record = ImageRecord::new(
            collection.id,
            entry.relative_path.clone(),
            new_size,
            probe.width,
            probe.height,
            probe.format,
        );
        let record = self.repos.images.upsert(&record).await?;

        if job.already_handled(&record.id) {
            return Ok(None);
        }

        if plan.thumbnails {
            self.ensure_variant(
                collection,
                &record,
                &bytes,
                VariantKind::Thumbnail,
            )
            .await?;
        }
        if plan.cache {
            self.ensure_variant(
                collection,
                &record,
                &bytes,
                VariantKind::Cache,
            )
            .await?;
        }
        Ok(Some(record))
    }

    /// Shared driver for scan and generate jobs: walk the entries, retry
    /// items with backoff, report progress, refresh collection statistics.
    async fn run_collection_job(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
        params: &ScanParams,
        plan: VariantPlan,
    ) -> Result<()> {
        let collection = self.load_collection(params).await?;
        let source = self.source_for(&collection);
        let entries = Self::list_entries(&source).await?;

        ctx.registry
            .set_total_items(job.id, entries.len() as u64)
            .await?;
        info!(
            job_id = %job.id,
            collection = %collection.id,
            entries = entries.len(),
            "collection walk started"
        );

        let mut image_count: u64 = 0;
        let mut total_size: u64 = 0;
        // Path → id map so failures after registration land in
        // failed_item_ids with their id.
        let mut known: HashMap<String, ImageId> = self
            .repos
            .images
            .list_by_collection(collection.id)
            .await?
            .into_iter()
            .map(|image| (image.relative_path, image.id))
            .collect();

        for batch in entries.chunks(self.batch_size) {
            for entry in batch {
                ctx.check_cancelled(job.id)?;

                let mut outcome = None;
                let mut last_err: Option<CoreError> = None;
                for attempt in 0..=ctx.retry.max_attempts {
                    if attempt > 0 {
                        tokio::time::sleep(
                            ctx.retry.delay_for(attempt),
                        )
                        .await;
                        ctx.check_cancelled(job.id)?;
                    }
                    match self
                        .process_entry(
                            &collection,
                            &source,
                            entry,
                            job,
                            plan,
                            known.get(&entry.relative_path).copied(),
                        )
                        .await
                    {
                        Ok(result) => {
                            outcome = Some(result);
                            last_err = None;
                            break;
                        }
                        Err(err) if err.is_job_fatal() => {
                            return Err(err)
                        }
                        Err(err @ CoreError::Cancelled(_)) => {
                            return Err(err)
                        }
                        Err(err) => last_err = Some(err),
                    }
                }

                match (outcome, last_err) {
                    (Some(Some(record)), _) => {
                        image_count += 1;
                        total_size += record.file_size_bytes;
                        known.insert(
                            record.relative_path.clone(),
                            record.id,
                        );
                        ctx.report(JobProgress::completed(
                            job.id, record.id,
                        ))
                        .await;
                    }
                    // Already handled on a previous run; counts stand.
                    (Some(None), _) => {
                        image_count += 1;
                    }
                    (None, Some(err)) => {
                        warn!(
                            job_id = %job.id,
                            entry = entry.relative_path,
                            "item failed after retries: {err}"
                        );
                        let failed_ids = known
                            .get(&entry.relative_path)
                            .map(|id| vec![*id])
                            .unwrap_or_default();
                        ctx.report(JobProgress {
                            job_id: job.id,
                            completed_delta: 0,
                            failed_delta: 1,
                            skipped_delta: 0,
                            processed_ids: Vec::new(),
                            failed_ids,
                        })
                        .await;
                    }
                    (None, None) => unreachable!(
                        "item loop ends with outcome or error"
                    ),
                }
            }
            // Yield between batches so cancellation and progress
            // persistence get a chance to run.
            tokio::task::yield_now().await;
        }

        let mut refreshed = collection.clone();
        refreshed.stats.image_count = image_count;
        refreshed.stats.total_size_bytes = total_size;
        refreshed.stats.last_scanned_at = Some(Utc::now());
        refreshed.updated_at = Utc::now();
        self.repos.collections.update(&refreshed).await?;
        Ok(())
    }

    /// Regeneration first invalidates every thumbnail fingerprint, then a
    /// normal generate pass recomputes the missing artifacts.
    async fn run_regenerate_thumbnails(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
        params: &ScanParams,
    ) -> Result<()> {
        let collection = self.load_collection(params).await?;
        let images = self
            .repos
            .images
            .list_by_collection(collection.id)
            .await?;
        let root =
            self.placement.root_for_collection(collection.id).await?;

        for image in &images {
            ctx.check_cancelled(job.id)?;
            let spec = Self::variant_spec(
                &collection.settings,
                image,
                VariantKind::Thumbnail,
            );
            self.read_cache
                .invalidate(&root, &fingerprint(&spec), spec.format)
                .await?;
        }
        info!(
            job_id = %job.id,
            collection = %collection.id,
            invalidated = images.len(),
            "thumbnail fingerprints invalidated"
        );

        self.run_collection_job(
            job,
            ctx,
            params,
            VariantPlan {
                thumbnails: true,
                cache: false,
            },
        )
        .await
    }

    /// Enumerate children of a parent directory and enqueue one scan per
    /// new collection, honoring the prefix filter.
    async fn run_bulk_add(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
        params: &BulkAddParams,
    ) -> Result<()> {
        let mut dir =
            tokio::fs::read_dir(&params.parent_path).await.map_err(|err| {
                CoreError::NotFound(format!(
                    "bulk-add parent {}: {err}",
                    params.parent_path.display()
                ))
            })?;

        let mut candidates = Vec::new();
        while let Some(child) = dir.next_entry().await? {
            let path = child.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            if let Some(prefix) = &params.prefix {
                if !name.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            let Some(kind) = CollectionKind::from_path(&path) else {
                continue;
            };
            if kind == CollectionKind::Folder && !params.include_subfolders
            {
                continue;
            }
            candidates.push((name, path, kind));
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        ctx.registry
            .set_total_items(job.id, candidates.len() as u64)
            .await?;

        let mut updated = job.clone();
        let mut child_ids = match &updated.payload {
            JobPayload::BulkAdd(p) => p.child_job_ids.clone(),
            _ => Vec::new(),
        };

        for (name, path, kind) in candidates {
            ctx.check_cancelled(job.id)?;

            if self
                .repos
                .collections
                .find_by_path(&path)
                .await?
                .is_some()
            {
                ctx.report(JobProgress::skipped(job.id, 1)).await;
                continue;
            }
            if !params.auto_add {
                ctx.report(JobProgress::skipped(job.id, 1)).await;
                continue;
            }

            let collection = Collection::new(
                name,
                path,
                kind,
                CollectionSettings::default(),
            );
            self.repos.collections.insert(&collection).await?;

            let child = ctx
                .registry
                .enqueue(JobPayload::ScanCollection(ScanParams {
                    collection_id: collection.id,
                }))
                .await?;
            child_ids.push(child.id);
            let _ = ctx.dispatch.send(child.id).await;

            ctx.report(JobProgress {
                job_id: job.id,
                completed_delta: 1,
                failed_delta: 0,
                skipped_delta: 0,
                processed_ids: Vec::new(),
                failed_ids: Vec::new(),
            })
            .await;
        }

        if let JobPayload::BulkAdd(p) = &mut updated.payload {
            p.child_job_ids = child_ids;
        }
        ctx.registry.update_payload(&updated).await?;
        Ok(())
    }

    /// Move every collection onto its planned root, migrating existing
    /// artifacts through the reserve/commit protocol. Collections already
    /// on their target are skipped, which is what makes a resumed
    /// redistribute converge.
    async fn run_redistribute(
        &self,
        job: &JobRecord,
        ctx: &JobContext,
    ) -> Result<()> {
        let collections = self.repos.collections.list().await?;
        let ids: Vec<_> = collections.iter().map(|c| c.id).collect();
        let plan = self.placement.plan_redistribution(&ids).await?;
        ctx.registry
            .set_total_items(job.id, plan.len() as u64)
            .await?;

        for (collection_id, target_root_id) in plan {
            ctx.check_cancelled(job.id)?;

            let Some(collection) =
                collections.iter().find(|c| c.id == collection_id)
            else {
                continue;
            };
            let current = self
                .placement
                .root_for_collection(collection_id)
                .await?;
            if current.id == target_root_id {
                ctx.report(JobProgress::skipped(job.id, 1)).await;
                continue;
            }

            let target = self
                .repos
                .cache_roots
                .get(target_root_id)
                .await?
                .ok_or_else(|| {
                    CoreError::NotFound(format!(
                        "cache root {target_root_id}"
                    ))
                })?;

            let images = self
                .repos
                .images
                .list_by_collection(collection_id)
                .await?;
            for image in &images {
                for variant in
                    [VariantKind::Thumbnail, VariantKind::Cache]
                {
                    let spec = Self::variant_spec(
                        &collection.settings,
                        image,
                        variant,
                    );
                    let fp = fingerprint(&spec);
                    let Some(stat) = self
                        .store
                        .stat(&current.path, &fp, spec.format, None)
                        .await?
                    else {
                        continue;
                    };

                    let token = self
                        .placement
                        .reserve(target.id, stat.size_bytes)
                        .await?;
                    let bytes =
                        tokio::fs::read(&stat.path).await?;
                    match self
                        .store
                        .write(&target.path, &fp, spec.format, &bytes)
                        .await
                    {
                        Ok(stored) => {
                            self.placement
                                .commit(token, stored.size_bytes)
                                .await?;
                        }
                        Err(err) => {
                            self.placement.abort(token).await;
                            return Err(err);
                        }
                    }
                    if let Some(freed) = self
                        .store
                        .delete(&current.path, &fp, spec.format)
                        .await?
                    {
                        self.placement
                            .release(current.id, freed)
                            .await?;
                    }
                }
            }

            self.placement.bind(collection_id, target.id).await?;
            ctx.report(JobProgress {
                job_id: job.id,
                completed_delta: 1,
                failed_delta: 0,
                skipped_delta: 0,
                processed_ids: Vec::new(),
                failed_ids: Vec::new(),
            })
            .await;
        }
        Ok(())
    }
}

#[async_trait]
impl JobExecutor for ImageProcessor {
    async fn execute(&self, job: JobRecord, ctx: JobContext) -> Result<()> {
        match job.payload.clone() {
            JobPayload::ScanCollection(params) => {
                let collection = self.load_collection(&params).await?;
                let plan = VariantPlan {
                    thumbnails: collection.settings.generate_thumbnails,
                    cache: collection.settings.generate_cache,
                };
                self.run_collection_job(&job, &ctx, &params, plan).await
            }
            JobPayload::GenerateThumbnails(params) => {
                self.run_collection_job(
                    &job,
                    &ctx,
                    &params,
                    VariantPlan {
                        thumbnails: true,
                        cache: false,
                    },
                )
                .await
            }
            JobPayload::GenerateCache(params) => {
                self.run_collection_job(
                    &job,
                    &ctx,
                    &params,
                    VariantPlan {
                        thumbnails: false,
                        cache: true,
                    },
                )
                .await
            }
            JobPayload::RegenerateThumbnails(params) => {
                self.run_regenerate_thumbnails(&job, &ctx, &params).await
            }
            JobPayload::BulkAdd(params) => {
                self.run_bulk_add(&job, &ctx, &params).await
            }
            JobPayload::Redistribute => {
                self.run_redistribute(&job, &ctx).await
            }
        }
    }
}
