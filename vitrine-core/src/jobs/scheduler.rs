use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vitrine_model::{JobId, JobKind, JobProgress, JobRecord, JobState};

use crate::error::{CoreError, Result};

use super::registry::JobRegistry;

/// Per-attempt exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u16,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
            jitter_ratio: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u16) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as u32;
        let base = self
            .backoff_base
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.backoff_max);
        let jitter_span = base.as_millis() as f64 * self.jitter_ratio;
        let jitter =
            rand::thread_rng().gen_range(0.0..=jitter_span.max(1.0));
        base + Duration::from_millis(jitter as u64)
    }
}

/// Worker pool tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    /// Max parallelism per job kind; kinds not listed fall back to
    /// `default_concurrency`.
    pub concurrency_per_kind: HashMap<JobKind, usize>,
    pub default_concurrency: usize,
    /// Wall-clock budget per job; breach fails the job with "timeout".
    pub job_timeout: Duration,
    /// Running jobs with progress older than this are reclaimed.
    pub watchdog: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let mut concurrency_per_kind = HashMap::new();
        concurrency_per_kind.insert(JobKind::ScanCollection, 2);
        concurrency_per_kind.insert(JobKind::GenerateThumbnails, 4);
        concurrency_per_kind.insert(JobKind::GenerateCache, 2);
        concurrency_per_kind.insert(JobKind::RegenerateThumbnails, 2);
        concurrency_per_kind.insert(JobKind::BulkAdd, 1);
        concurrency_per_kind.insert(JobKind::Redistribute, 1);
        Self {
            worker_count: num_cpus::get().clamp(2, 8),
            concurrency_per_kind,
            default_concurrency: 2,
            job_timeout: Duration::from_secs(60 * 60),
            watchdog: Duration::from_secs(300),
            retry: RetryPolicy::default(),
        }
    }
}

/// Traffic on the progress channel: deltas from workers, plus a barrier a
/// worker sends before a terminal transition so the drained counts are
/// visible to whoever reads the finished record.
#[derive(Debug)]
pub enum ProgressMessage {
    Delta(JobProgress),
    Flush(tokio::sync::oneshot::Sender<()>),
}

/// Handles a worker passes to the executing pipeline.
#[derive(Clone)]
pub struct JobContext {
    pub registry: JobRegistry,
    /// Cooperative interrupt, fired on cancel and pause.
    pub cancel: CancellationToken,
    /// Progress updates flow to a dedicated updater task, which serializes
    /// them per job.
    pub progress: mpsc::Sender<ProgressMessage>,
    /// Hands follow-up jobs (bulk-add children) back to the pool.
    pub dispatch: mpsc::Sender<JobId>,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl JobContext {
    /// Send one progress delta; failures only mean the pool is shutting
    /// down, so they are logged rather than propagated.
    pub async fn report(&self, progress: JobProgress) {
        if self
            .progress
            .send(ProgressMessage::Delta(progress))
            .await
            .is_err()
        {
            warn!("progress channel closed, update dropped");
        }
    }

    pub fn check_cancelled(&self, job_id: JobId) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled(format!("job {job_id}")));
        }
        Ok(())
    }
}

/// Executes one job to completion. Implemented by the image pipeline.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, job: JobRecord, ctx: JobContext) -> Result<()>;
}

/// Fixed-size worker pool over a dispatch channel.
///
/// Workers pull job ids, claim them with a compare-and-set start, enforce
/// per-kind concurrency with semaphores, and run the executor under the
/// job's wall-clock budget. A watchdog task reclaims stalled jobs.
pub struct WorkerPool {
    registry: JobRegistry,
    dispatch: mpsc::Sender<JobId>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    pub fn start(
        registry: JobRegistry,
        executor: Arc<dyn JobExecutor>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel::<JobId>(1024);
        let (progress_tx, mut progress_rx) =
            mpsc::channel::<ProgressMessage>(1024);
        let shutdown = CancellationToken::new();
        let dispatch_rx = Arc::new(Mutex::new(dispatch_rx));

        let semaphores: HashMap<JobKind, Arc<Semaphore>> = [
            JobKind::ScanCollection,
            JobKind::GenerateThumbnails,
            JobKind::GenerateCache,
            JobKind::RegenerateThumbnails,
            JobKind::BulkAdd,
            JobKind::Redistribute,
        ]
        .into_iter()
        .map(|kind| {
            let cap = config
                .concurrency_per_kind
                .get(&kind)
                .copied()
                .unwrap_or(config.default_concurrency)
                .max(1);
            (kind, Arc::new(Semaphore::new(cap)))
        })
        .collect();

        let mut handles = Vec::new();

        // Dedicated updater task: the single consumer serializes progress
        // writes per job, keeping completed_items monotonic.
        {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                while let Some(message) = progress_rx.recv().await {
                    match message {
                        ProgressMessage::Delta(progress) => {
                            if let Err(err) =
                                registry.apply_progress(&progress).await
                            {
                                warn!(
                                    job_id = %progress.job_id,
                                    "progress update failed: {err}"
                                );
                            }
                        }
                        ProgressMessage::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            }));
        }

        for worker_index in 0..config.worker_count.max(1) {
            let registry = registry.clone();
            let executor = executor.clone();
            let config = config.clone();
            let semaphores = semaphores.clone();
            let dispatch_rx = dispatch_rx.clone();
            let dispatch_tx = dispatch_tx.clone();
            let progress_tx = progress_tx.clone();
            let shutdown = shutdown.clone();

            handles.push(tokio::spawn(async move {
                debug!(worker = worker_index, "worker started");
                loop {
                    let next = {
                        let mut rx = dispatch_rx.lock().await;
                        tokio::select! {
                            _ = shutdown.cancelled() => None,
                            id = rx.recv() => id,
                        }
                    };
                    let Some(job_id) = next else { break };
                    run_one(
                        job_id,
                        &registry,
                        executor.as_ref(),
                        &config,
                        &semaphores,
                        &dispatch_tx,
                        &progress_tx,
                    )
                    .await;
                }
                debug!(worker = worker_index, "worker stopped");
            }));
        }

        // Watchdog: stalled Running jobs return to Pending and get
        // redispatched.
        {
            let registry = registry.clone();
            let dispatch_tx = dispatch_tx.clone();
            let shutdown = shutdown.clone();
            let watchdog = config.watchdog;
            handles.push(tokio::spawn(async move {
                let period = (watchdog / 2).max(Duration::from_secs(1));
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(
                    tokio::time::MissedTickBehavior::Skip,
                );
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match registry.reclaim_stale(watchdog).await {
                        Ok(reclaimed) => {
                            for job in reclaimed {
                                warn!(
                                    job_id = %job.id,
                                    "reclaimed stalled job"
                                );
                                let _ = dispatch_tx.send(job.id).await;
                            }
                        }
                        Err(err) => {
                            warn!("watchdog sweep failed: {err}")
                        }
                    }
                }
            }));
        }

        Arc::new(Self {
            registry,
            dispatch: dispatch_tx,
            shutdown,
            handles: Mutex::new(handles),
        })
    }

    /// Queue a job id for execution.
    pub async fn submit(&self, job_id: JobId) -> Result<()> {
        self.dispatch.send(job_id).await.map_err(|_| {
            CoreError::Internal("worker pool is shut down".to_string())
        })
    }

    /// Startup recovery: reclaim interrupted jobs, then dispatch every
    /// pending job.
    pub async fn recover(&self) -> Result<usize> {
        self.registry.reclaim_resumable().await?;
        let pending = self
            .registry
            .list(Some(JobState::Pending), None)
            .await?;
        let count = pending.len();
        for job in pending {
            self.submit(job.id).await?;
        }
        if count > 0 {
            info!(count, "dispatched recovered jobs");
        }
        Ok(count)
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    /// Stop accepting work and wait for workers to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one(
    job_id: JobId,
    registry: &JobRegistry,
    executor: &dyn JobExecutor,
    config: &SchedulerConfig,
    semaphores: &HashMap<JobKind, Arc<Semaphore>>,
    dispatch_tx: &mpsc::Sender<JobId>,
    progress_tx: &mpsc::Sender<ProgressMessage>,
) {
    let record = match registry.get(job_id).await {
        Ok(Some(record)) if record.state == JobState::Pending => record,
        Ok(_) => return,
        Err(err) => {
            warn!(job_id = %job_id, "job fetch failed: {err}");
            return;
        }
    };

    let semaphore = semaphores
        .get(&record.kind())
        .cloned()
        .expect("semaphore per kind");
    let _permit = match semaphore.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    // Claim: a cancel racing this start simply wins.
    let record = match registry.start(job_id).await {
        Ok(record) => record,
        Err(CoreError::Conflict(_)) => return,
        Err(err) => {
            warn!(job_id = %job_id, "job start failed: {err}");
            return;
        }
    };

    info!(job_id = %job_id, kind = %record.kind(), "job running");
    let ctx = JobContext {
        registry: registry.clone(),
        cancel: registry.fresh_interrupt(job_id),
        progress: progress_tx.clone(),
        dispatch: dispatch_tx.clone(),
        retry: config.retry,
    };

    let outcome = tokio::time::timeout(
        config.job_timeout,
        executor.execute(record.clone(), ctx),
    )
    .await;
    registry.clear_interrupt(job_id);

    // Barrier: make sure every delta this run sent has been folded into
    // the record before the terminal transition lands.
    let (ack_tx, ack_rx) = tokio::sync::oneshot::channel();
    if progress_tx
        .send(ProgressMessage::Flush(ack_tx))
        .await
        .is_ok()
    {
        let _ = ack_rx.await;
    }

    match outcome {
        Err(_elapsed) => {
            error!(job_id = %job_id, "job exceeded wall-clock budget");
            let _ = registry.fail(job_id, "timeout").await;
        }
        Ok(Ok(())) => match registry.complete(job_id).await {
            Ok(done) => {
                info!(
                    job_id = %job_id,
                    completed = done.completed_items,
                    failed = done.failed_items,
                    skipped = done.skipped_items,
                    "job completed"
                );
            }
            // Pause/cancel landed first; their state stands.
            Err(CoreError::Conflict(_)) => {}
            Err(err) => {
                warn!(job_id = %job_id, "job completion failed: {err}")
            }
        },
        Ok(Err(CoreError::Cancelled(_))) => {
            debug!(job_id = %job_id, "job stopped at interrupt");
        }
        Ok(Err(err)) if err.is_job_fatal() => {
            // Infrastructure trouble: retry with backoff up to the budget.
            if record.attempts < config.retry.max_attempts {
                let delay = config.retry.delay_for(record.attempts);
                warn!(
                    job_id = %job_id,
                    attempt = record.attempts,
                    "job hit infrastructure error, retrying in {delay:?}: {err}"
                );
                if registry.requeue(job_id).await.is_ok() {
                    let dispatch_tx = dispatch_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = dispatch_tx.send(job_id).await;
                    });
                }
            } else {
                error!(job_id = %job_id, "job retry budget exhausted: {err}");
                let _ = registry.fail(job_id, err.to_string()).await;
            }
        }
        Ok(Err(err)) => {
            error!(job_id = %job_id, "job failed: {err}");
            let _ = registry.fail(job_id, err.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::memory::MemoryJobs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vitrine_model::{CollectionId, JobPayload, ScanParams};

    struct CountingExecutor {
        runs: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl JobExecutor for CountingExecutor {
        async fn execute(
            &self,
            job: JobRecord,
            ctx: JobContext,
        ) -> Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && run == 0 {
                return Err(CoreError::InfrastructureUnavailable(
                    "database flake".to_string(),
                ));
            }
            ctx.report(JobProgress::skipped(job.id, 1)).await;
            Ok(())
        }
    }

    fn scan_payload() -> JobPayload {
        JobPayload::ScanCollection(ScanParams {
            collection_id: CollectionId::new(),
        })
    }

    fn quick_config() -> SchedulerConfig {
        SchedulerConfig {
            worker_count: 2,
            job_timeout: Duration::from_secs(5),
            watchdog: Duration::from_secs(60),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(50),
                jitter_ratio: 0.0,
            },
            ..SchedulerConfig::default()
        }
    }

    async fn wait_for_state(
        registry: &JobRegistry,
        id: JobId,
        state: JobState,
    ) -> JobRecord {
        for _ in 0..200 {
            if let Some(record) = registry.get(id).await.unwrap() {
                if record.state == state {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached {state}");
    }

    #[tokio::test]
    async fn pool_runs_a_job_to_completion() {
        let registry =
            JobRegistry::new(Arc::new(MemoryJobs::default()));
        let executor = Arc::new(CountingExecutor {
            runs: AtomicUsize::new(0),
            fail_first: false,
        });
        let pool = WorkerPool::start(
            registry.clone(),
            executor.clone(),
            quick_config(),
        );

        let job = registry.enqueue(scan_payload()).await.unwrap();
        pool.submit(job.id).await.unwrap();

        let done =
            wait_for_state(&registry, job.id, JobState::Completed).await;
        assert_eq!(done.skipped_items, 1);
        assert_eq!(executor.runs.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn infrastructure_errors_retry_then_succeed() {
        let registry =
            JobRegistry::new(Arc::new(MemoryJobs::default()));
        let executor = Arc::new(CountingExecutor {
            runs: AtomicUsize::new(0),
            fail_first: true,
        });
        let pool = WorkerPool::start(
            registry.clone(),
            executor.clone(),
            quick_config(),
        );

        let job = registry.enqueue(scan_payload()).await.unwrap();
        pool.submit(job.id).await.unwrap();

        let done =
            wait_for_state(&registry, job.id, JobState::Completed).await;
        assert_eq!(executor.runs.load(Ordering::SeqCst), 2);
        assert!(done.attempts >= 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn recover_dispatches_interrupted_jobs() {
        let repo = Arc::new(MemoryJobs::default());
        let registry = JobRegistry::new(repo.clone());

        // Simulate a crash mid-run: the record is stuck in Running.
        let job = registry.enqueue(scan_payload()).await.unwrap();
        registry.start(job.id).await.unwrap();

        let executor = Arc::new(CountingExecutor {
            runs: AtomicUsize::new(0),
            fail_first: false,
        });
        let pool = WorkerPool::start(
            registry.clone(),
            executor,
            quick_config(),
        );
        let recovered = pool.recover().await.unwrap();
        assert_eq!(recovered, 1);

        wait_for_state(&registry, job.id, JobState::Completed).await;
        pool.shutdown().await;
    }
}
