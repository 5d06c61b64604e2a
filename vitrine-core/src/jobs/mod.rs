//! Durable, resumable background work: the registry tracks job records and
//! cooperative interrupts; the scheduler owns the worker pool, the dispatch
//! and progress channels, and the stale-job watchdog.

pub mod registry;
pub mod scheduler;

pub use registry::JobRegistry;
pub use scheduler::{
    JobContext, JobExecutor, ProgressMessage, RetryPolicy,
    SchedulerConfig, WorkerPool,
};
