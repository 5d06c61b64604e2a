//! Core library for the Vitrine image platform.
//!
//! The subsystems live leaves-first: the long-path adapter and archive
//! readers at the bottom, then the codec adapter, the placement engine and
//! artifact store, the three-tier read cache, and the job runtime with its
//! image pipeline on top. Repositories are ports; Postgres and in-memory
//! implementations ship side by side.

pub mod admin;
pub mod archive;
pub mod artifact_store;
pub mod codec;
pub mod error;
pub mod jobs;
pub mod longpath;
pub mod persistence;
pub mod placement;
pub mod processor;
pub mod read_cache;

pub use admin::AdminService;
pub use archive::{open_source, ArchiveSource, EntryMeta};
pub use artifact_store::{fingerprint, ArtifactStore};
pub use codec::ImageCodec;
pub use error::{CoreError, Result};
pub use jobs::{
    JobContext, JobExecutor, JobRegistry, RetryPolicy, SchedulerConfig,
    WorkerPool,
};
pub use longpath::LongPath;
pub use placement::{PlacementEngine, PlacementToken};
pub use processor::ImageProcessor;
pub use read_cache::{MemoryTier, ReadCache, RedisTier};
