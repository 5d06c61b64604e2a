use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use vitrine_core::{
    AdminService, ImageProcessor, JobRegistry, PlacementEngine, ReadCache,
    WorkerPool,
};
use vitrine_core::persistence::Repositories;

/// Everything the handlers need, constructed once at startup and injected;
/// no process-wide singletons.
#[derive(Clone)]
pub struct AppState {
    pub repos: Repositories,
    pub registry: JobRegistry,
    pub pool: Arc<WorkerPool>,
    pub admin: AdminService,
    pub placement: PlacementEngine,
    pub processor: Arc<ImageProcessor>,
    pub read_cache: Arc<ReadCache>,
    /// Global bound on concurrent synchronous resizes.
    pub resize_permits: Arc<Semaphore>,
    /// How long a read waits for a permit before 503 TooBusy.
    pub resize_wait: Duration,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field(
                "resize_permits",
                &self.resize_permits.available_permits(),
            )
            .field("resize_wait", &self.resize_wait)
            .finish()
    }
}
