//! Content-addressed on-disk layout for derived artifacts.
//!
//! Artifacts live at `<root>/<first-two-hex>/<fingerprint>.<ext>`; the
//! two-level shard keeps directory entry counts bounded. Writes are atomic:
//! temp sibling in the shard directory, flush + fsync, rename. A zero-byte
//! or expired file is treated as absent and deleted on discovery.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;
use vitrine_model::{ArtifactSpec, EncodeFormat, Fingerprint};

use crate::error::{CoreError, Result};
use crate::longpath::LongPath;

/// Compute the fingerprint for an artifact spec: SHA-256 over the spec's
/// canonical serialization, lowercase hex.
pub fn fingerprint(spec: &ArtifactSpec) -> Fingerprint {
    let digest = Sha256::digest(spec.canonical_string().as_bytes());
    Fingerprint::from_hex(hex::encode(digest))
        .expect("sha256 digest is 64 hex chars")
}

/// Result of a successful artifact write.
#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Filesystem metadata for a stored artifact.
#[derive(Debug, Clone)]
pub struct ArtifactStat {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactStat {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Outcome of a validity-checked read.
#[derive(Debug)]
pub enum ArtifactLookup {
    Valid(Vec<u8>),
    /// Present but zero-byte or past its TTL; the file has been unlinked
    /// and the freed size is reported so counters can follow.
    Evicted { freed_bytes: u64 },
    Missing,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    longpath: LongPath,
}

impl ArtifactStore {
    pub fn new(longpath: LongPath) -> Self {
        Self { longpath }
    }

    /// The fingerprint → path function. Deterministic and total; no disk
    /// access happens here.
    pub fn artifact_path(
        &self,
        root: &Path,
        fingerprint: &Fingerprint,
        format: EncodeFormat,
    ) -> PathBuf {
        root.join(fingerprint.shard())
            .join(format!("{fingerprint}.{}", format.extension()))
    }

    /// Atomic write: temp sibling file, flush, fsync, rename. Returns the
    /// actual byte count for the placement commit.
    pub async fn write(
        &self,
        root: &Path,
        fingerprint: &Fingerprint,
        format: EncodeFormat,
        bytes: &[u8],
    ) -> Result<StoredArtifact> {
        let final_path = self.artifact_path(root, fingerprint, format);
        let shard_dir = final_path
            .parent()
            .ok_or_else(|| {
                CoreError::Internal(format!(
                    "artifact path has no parent: {}",
                    final_path.display()
                ))
            })?
            .to_path_buf();
        self.longpath.ensure_dir(&shard_dir).await?;

        let temp_path = shard_dir.join(format!(
            "{fingerprint}.tmp-{}",
            Uuid::new_v4().simple()
        ));
        let safe_temp = self.longpath.safe_path(&temp_path)?;
        let mut file = tokio::fs::File::create(&safe_temp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let safe_final = self.longpath.safe_path(&final_path)?;
        if let Err(err) = tokio::fs::rename(&safe_temp, &safe_final).await {
            let _ = tokio::fs::remove_file(&safe_temp).await;
            return Err(err.into());
        }

        Ok(StoredArtifact {
            path: safe_final,
            size_bytes: bytes.len() as u64,
        })
    }

    /// Metadata lookup. Zero-byte files read as absent.
    pub async fn stat(
        &self,
        root: &Path,
        fingerprint: &Fingerprint,
        format: EncodeFormat,
        ttl: Option<std::time::Duration>,
    ) -> Result<Option<ArtifactStat>> {
        let path = self.artifact_path(root, fingerprint, format);
        let safe = self.longpath.safe_path(&path)?;
        let meta = match tokio::fs::metadata(&safe).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        if meta.len() == 0 {
            return Ok(None);
        }
        let created_at = system_time_to_utc(
            meta.modified().unwrap_or(SystemTime::now()),
        );
        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .map(|ttl| created_at + ttl)
        });
        Ok(Some(ArtifactStat {
            path: safe,
            size_bytes: meta.len(),
            created_at,
            expires_at,
        }))
    }

    /// Whether a usable (present, non-empty, unexpired) artifact exists.
    pub async fn is_valid(
        &self,
        root: &Path,
        fingerprint: &Fingerprint,
        format: EncodeFormat,
        ttl: Option<std::time::Duration>,
    ) -> Result<bool> {
        Ok(self
            .stat(root, fingerprint, format, ttl)
            .await?
            .is_some_and(|stat| !stat.is_expired(Utc::now())))
    }

    /// Read with validity checks. Stale and zero-byte files are evicted in
    /// place; the caller settles the counters.
    pub async fn read_valid(
        &self,
        root: &Path,
        fingerprint: &Fingerprint,
        format: EncodeFormat,
        ttl: Option<std::time::Duration>,
    ) -> Result<ArtifactLookup> {
        let Some(stat) =
            self.stat(root, fingerprint, format, ttl).await?
        else {
            // A zero-byte leftover still occupies a directory entry.
            let path = self.artifact_path(root, fingerprint, format);
            if self.longpath.remove_file(&path).await? {
                warn!(
                    fingerprint = %fingerprint,
                    "evicted zero-byte artifact"
                );
                return Ok(ArtifactLookup::Evicted { freed_bytes: 0 });
            }
            return Ok(ArtifactLookup::Missing);
        };

        if stat.is_expired(Utc::now()) {
            let freed = stat.size_bytes;
            let _ = tokio::fs::remove_file(&stat.path).await;
            return Ok(ArtifactLookup::Evicted { freed_bytes: freed });
        }

        match tokio::fs::read(&stat.path).await {
            Ok(bytes) => Ok(ArtifactLookup::Valid(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(ArtifactLookup::Missing)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Idempotent delete. Returns the freed byte count when a file was
    /// actually removed.
    pub async fn delete(
        &self,
        root: &Path,
        fingerprint: &Fingerprint,
        format: EncodeFormat,
    ) -> Result<Option<u64>> {
        let path = self.artifact_path(root, fingerprint, format);
        let safe = self.longpath.safe_path(&path)?;
        let size = match tokio::fs::metadata(&safe).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        match tokio::fs::remove_file(&safe).await {
            Ok(()) => Ok(Some(size)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
