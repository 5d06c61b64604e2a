use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vitrine_model::{
    JobId, JobKind, JobPayload, JobProgress, JobRecord, JobState,
};

use crate::error::{CoreError, Result};
use crate::persistence::JobsRepository;

/// Durable job bookkeeping plus the in-process interrupt tokens workers
/// poll between items. State changes go through the repository's
/// compare-and-set so concurrent controllers cannot lose transitions.
#[derive(Clone)]
pub struct JobRegistry {
    repo: Arc<dyn JobsRepository>,
    interrupts: Arc<DashMap<JobId, CancellationToken>>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("interrupts", &self.interrupts.len())
            .finish()
    }
}

impl JobRegistry {
    pub fn new(repo: Arc<dyn JobsRepository>) -> Self {
        Self {
            repo,
            interrupts: Arc::new(DashMap::new()),
        }
    }

    pub async fn enqueue(&self, payload: JobPayload) -> Result<JobRecord> {
        let record = JobRecord::new(payload);
        self.repo.insert(&record).await?;
        info!(job_id = %record.id, kind = %record.kind(), "job enqueued");
        Ok(record)
    }

    pub async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.repo.get(id).await
    }

    pub async fn require(&self, id: JobId) -> Result<JobRecord> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {id}")))
    }

    pub async fn list(
        &self,
        state: Option<JobState>,
        kind: Option<JobKind>,
    ) -> Result<Vec<JobRecord>> {
        self.repo.list(state, kind).await
    }

    /// Claim a pending job for execution.
    pub async fn start(&self, id: JobId) -> Result<JobRecord> {
        self.repo
            .transition(id, JobState::Pending, JobState::Running, None)
            .await
    }

    pub async fn complete(&self, id: JobId) -> Result<JobRecord> {
        self.repo
            .transition(id, JobState::Running, JobState::Completed, None)
            .await
    }

    pub async fn fail(
        &self,
        id: JobId,
        message: impl Into<String>,
    ) -> Result<JobRecord> {
        self.repo
            .transition(
                id,
                JobState::Running,
                JobState::Failed,
                Some(message.into()),
            )
            .await
    }

    /// Pause a running job; the worker observes the interrupt and stops at
    /// the next checkpoint, leaving the record resumable.
    pub async fn pause(&self, id: JobId) -> Result<JobRecord> {
        let record = self
            .repo
            .transition(id, JobState::Running, JobState::Paused, None)
            .await?;
        self.fire_interrupt(id);
        Ok(record)
    }

    /// Return a paused job to the pending queue; the caller resubmits it to
    /// the worker pool.
    pub async fn resume(&self, id: JobId) -> Result<JobRecord> {
        self.repo
            .transition(id, JobState::Paused, JobState::Pending, None)
            .await
    }

    /// Cooperative cancel. Idempotent: cancelling a cancelled job is a
    /// no-op that returns the unchanged record.
    pub async fn cancel(&self, id: JobId) -> Result<JobRecord> {
        let current = self.require(id).await?;
        if current.state == JobState::Cancelled {
            return Ok(current);
        }
        let record = self
            .repo
            .transition(id, current.state, JobState::Cancelled, None)
            .await?;
        self.fire_interrupt(id);
        info!(job_id = %id, "job cancelled");
        Ok(record)
    }

    /// Send a running job back to pending for a scheduler-level retry.
    pub async fn requeue(&self, id: JobId) -> Result<JobRecord> {
        self.repo
            .transition(id, JobState::Running, JobState::Pending, None)
            .await
    }

    pub async fn apply_progress(
        &self,
        progress: &JobProgress,
    ) -> Result<()> {
        self.repo.apply_progress(progress).await
    }

    pub async fn set_total_items(&self, id: JobId, total: u64) -> Result<()> {
        self.repo.set_total_items(id, total).await
    }

    pub async fn update_payload(&self, job: &JobRecord) -> Result<()> {
        self.repo.update_payload(job).await
    }

    /// A fresh interrupt token for one execution attempt. Replaces any
    /// previous token so a resumed job starts uninterrupted.
    pub fn fresh_interrupt(&self, id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.interrupts.insert(id, token.clone());
        token
    }

    pub fn clear_interrupt(&self, id: JobId) {
        self.interrupts.remove(&id);
    }

    fn fire_interrupt(&self, id: JobId) {
        if let Some(entry) = self.interrupts.get(&id) {
            entry.value().cancel();
        }
    }

    /// Watchdog sweep: running jobs whose progress is older than the
    /// threshold go back to pending for reclamation.
    pub async fn reclaim_stale(
        &self,
        watchdog: std::time::Duration,
    ) -> Result<Vec<JobRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(watchdog).unwrap_or_else(|_| {
                chrono::Duration::seconds(300)
            });
        self.repo.reclaim_stale(cutoff).await
    }

    /// Startup recovery: every resumable Running/Paused job returns to the
    /// pending queue.
    pub async fn reclaim_resumable(&self) -> Result<Vec<JobRecord>> {
        let reclaimed = self.repo.reclaim_resumable().await?;
        if !reclaimed.is_empty() {
            info!(
                count = reclaimed.len(),
                "reclaimed interrupted jobs for resumption"
            );
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryJobs;
    use vitrine_model::ScanParams;

    fn registry() -> JobRegistry {
        JobRegistry::new(Arc::new(MemoryJobs::default()))
    }

    fn scan_payload() -> JobPayload {
        JobPayload::ScanCollection(ScanParams {
            collection_id: vitrine_model::CollectionId::new(),
        })
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let registry = registry();
        let job = registry.enqueue(scan_payload()).await.unwrap();

        let first = registry.cancel(job.id).await.unwrap();
        assert_eq!(first.state, JobState::Cancelled);
        assert!(!first.can_resume);

        let second = registry.cancel(job.id).await.unwrap();
        assert_eq!(second.state, JobState::Cancelled);
        assert_eq!(second.completed_at, first.completed_at);
    }

    #[tokio::test]
    async fn pause_fires_the_interrupt() {
        let registry = registry();
        let job = registry.enqueue(scan_payload()).await.unwrap();
        registry.start(job.id).await.unwrap();

        let token = registry.fresh_interrupt(job.id);
        assert!(!token.is_cancelled());

        let paused = registry.pause(job.id).await.unwrap();
        assert_eq!(paused.state, JobState::Paused);
        assert!(token.is_cancelled());

        let resumed = registry.resume(job.id).await.unwrap();
        assert_eq!(resumed.state, JobState::Pending);
        assert!(resumed.can_resume);
    }

    #[tokio::test]
    async fn completing_a_cancelled_job_conflicts() {
        let registry = registry();
        let job = registry.enqueue(scan_payload()).await.unwrap();
        registry.start(job.id).await.unwrap();
        registry.cancel(job.id).await.unwrap();

        assert!(matches!(
            registry.complete(job.id).await,
            Err(CoreError::Conflict(_))
        ));
    }
}
