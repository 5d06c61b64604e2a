use std::path::PathBuf;

use sqlx::error::DatabaseError as _;
use thiserror::Error;
use vitrine_model::JobState;

/// Error taxonomy for the cache and job subsystem.
///
/// Per-item errors (`ArchiveCorrupt`, `UnsupportedFormat`, decode failures)
/// are captured into job records and never fail a whole job; only
/// `InfrastructureUnavailable` does, after the scheduler's retry budget.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("illegal job transition: {from} -> {to}")]
    IllegalTransition { from: JobState, to: JobState },

    #[error("path too long, directory portion exceeds safe limit: {0}")]
    PathTooLong(PathBuf),

    #[error("archive corrupt: {0}")]
    ArchiveCorrupt(String),

    #[error("unsupported container format: {0}")]
    UnsupportedFormat(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("no active cache root")]
    NoActiveCacheRoot,

    #[error("cache capacity exceeded on root {root}: need {needed} bytes")]
    CacheCapacityExceeded { root: String, needed: u64 },

    #[error("too busy: resize concurrency limit reached")]
    TooBusy,

    #[error("timeout")]
    Timeout,

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("infrastructure unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Whether this error fails the surrounding job rather than the item.
    pub fn is_job_fatal(&self) -> bool {
        matches!(
            self,
            Self::InfrastructureUnavailable(_)
                | Self::NoActiveCacheRoot
                | Self::Timeout
        )
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => {
                Self::NotFound("row not found".to_string())
            }
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                Self::Conflict(db.to_string())
            }
            other => Self::InfrastructureUnavailable(other.to_string()),
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::InfrastructureUnavailable(format!("redis: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
