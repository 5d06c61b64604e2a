//! Wiring: construct the core services once and hand them to the router.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{info, warn};
use vitrine_core::persistence::{
    CacheRootsRepository as _, Repositories,
};
use vitrine_core::read_cache::{MemoryTier, ReadCache, RedisTier};
use vitrine_core::{
    AdminService, ArtifactStore, ImageCodec, ImageProcessor, JobRegistry,
    LongPath, PlacementEngine, WorkerPool,
};
use vitrine_model::CacheRoot;

use crate::config::Config;
use crate::state::AppState;

/// Register configured cache roots that are not in the store yet. Returns
/// how many active roots exist afterwards.
pub async fn sync_cache_roots(
    config: &Config,
    repos: &Repositories,
    longpath: LongPath,
) -> vitrine_core::Result<usize> {
    let existing = repos.cache_roots.list().await?;
    for configured in &config.cache.roots {
        if existing.iter().any(|r| r.path == configured.path) {
            continue;
        }
        longpath.ensure_dir(&configured.path).await?;
        let mut root = CacheRoot::new(
            configured.name.clone(),
            configured.path.clone(),
        );
        root.max_size_bytes = configured.max_size_bytes;
        root.priority = configured.priority;
        repos.cache_roots.insert(&root).await?;
        info!(
            cache_root = %root.id,
            path = %root.path.display(),
            "registered configured cache root"
        );
    }
    Ok(repos
        .cache_roots
        .list()
        .await?
        .iter()
        .filter(|root| root.is_active)
        .count())
}

/// Assemble the full application state over the given repositories. The L2
/// tier connects only when enabled; a connection failure degrades to the
/// two remaining tiers rather than blocking startup.
pub async fn build_state(config: &Config, repos: Repositories) -> AppState {
    let longpath = LongPath::new(config.path.safe_limit);
    let store = ArtifactStore::new(longpath);
    let placement = PlacementEngine::new(
        repos.cache_roots.clone(),
        repos.bindings.clone(),
    );

    let l2 = if config.cache.l2.enabled {
        match RedisTier::connect(&config.cache.l2.url, config.l2_ttl())
            .await
        {
            Ok(tier) => Some(tier),
            Err(err) => {
                warn!("l2 cache disabled, redis unreachable: {err}");
                None
            }
        }
    } else {
        None
    };

    let read_cache = Arc::new(ReadCache::new(
        MemoryTier::new(config.cache.l1.max_bytes, config.l1_ttl()),
        l2,
        store.clone(),
        placement.clone(),
    ));
    let processor = Arc::new(ImageProcessor::new(
        repos.clone(),
        placement.clone(),
        store,
        ImageCodec,
        read_cache.clone(),
        longpath,
    ));
    let registry = JobRegistry::new(repos.jobs.clone());
    let pool = WorkerPool::start(
        registry.clone(),
        processor.clone(),
        config.scheduler_config(),
    );
    let admin = AdminService::new(
        repos.clone(),
        registry.clone(),
        pool.clone(),
        longpath,
    );

    AppState {
        repos,
        registry,
        pool,
        admin,
        placement,
        processor,
        read_cache,
        resize_permits: Arc::new(Semaphore::new(
            config.resize.concurrent_limit.max(1),
        )),
        resize_wait: config.resize_wait(),
    }
}
