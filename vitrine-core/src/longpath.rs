//! Filesystem access with protection against host path-length limits.
//!
//! Every filesystem call the crate makes goes through [`LongPath`]. Paths
//! within the configured safe limit pass through untouched; longer paths get
//! their basename truncated and suffixed with a short stable hash of the
//! full original basename, so two over-long siblings that differ only past
//! the truncation boundary still map to distinct files.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{CoreError, Result};

/// Default maximum path length considered safe across host platforms.
pub const DEFAULT_SAFE_LIMIT: usize = 250;

/// Number of hex characters of the basename digest kept in a safe name.
const HASH_SUFFIX_LEN: usize = 8;

/// Extensions longer than this are treated as part of the name and dropped
/// during truncation rather than preserved.
const MAX_PRESERVED_EXT: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct LongPath {
    safe_limit: usize,
}

impl Default for LongPath {
    fn default() -> Self {
        Self::new(DEFAULT_SAFE_LIMIT)
    }
}

impl LongPath {
    pub fn new(safe_limit: usize) -> Self {
        Self { safe_limit }
    }

    pub fn safe_limit(&self) -> usize {
        self.safe_limit
    }

    /// Map a candidate path to one whose length fits the safe limit.
    ///
    /// Already-safe paths are returned unchanged, which also makes the
    /// function idempotent: a derived safe path fits the limit and passes
    /// through on a second application.
    pub fn safe_path(&self, path: &Path) -> Result<PathBuf> {
        let rendered = path.to_string_lossy();
        if rendered.chars().count() <= self.safe_limit {
            return Ok(path.to_path_buf());
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| CoreError::PathTooLong(path.to_path_buf()))?;
        let parent = path.parent().unwrap_or_else(|| Path::new(""));
        let parent_len = parent.to_string_lossy().chars().count();

        let digest = Sha256::digest(file_name.as_bytes());
        let suffix = hex::encode(&digest[..HASH_SUFFIX_LEN / 2]);

        let (stem, ext) = split_name(&file_name);
        let ext_part = match ext {
            Some(ext) if ext.chars().count() <= MAX_PRESERVED_EXT => {
                format!(".{ext}")
            }
            _ => String::new(),
        };

        // parent + '/' + stem_prefix + '-' + hash + ext must fit.
        let fixed = parent_len
            + 1
            + 1
            + HASH_SUFFIX_LEN
            + ext_part.chars().count();
        if fixed > self.safe_limit {
            return Err(CoreError::PathTooLong(path.to_path_buf()));
        }

        let keep = self.safe_limit - fixed;
        let stem_prefix: String = stem.chars().take(keep).collect();
        let safe_name = format!("{stem_prefix}-{suffix}{ext_part}");
        Ok(parent.join(safe_name))
    }

    /// Resolve a candidate path for reading. Files written through this
    /// adapter live at their safe paths, so that alternate wins when it
    /// exists; a file that genuinely sits at an over-long original path
    /// (the host allows it, the adapter never rewrote it) is opened where
    /// it is.
    pub fn resolve_read(&self, path: &Path) -> Result<PathBuf> {
        let safe = match self.safe_path(path) {
            Ok(safe) => safe,
            Err(CoreError::PathTooLong(_)) if path.exists() => {
                return Ok(path.to_path_buf());
            }
            Err(err) => return Err(err),
        };
        if safe.as_path() != path && !safe.exists() && path.exists() {
            return Ok(path.to_path_buf());
        }
        Ok(safe)
    }

    pub async fn exists(&self, path: &Path) -> Result<bool> {
        let safe = self.safe_path(path)?;
        Ok(tokio::fs::try_exists(&safe).await.unwrap_or(false))
    }

    pub async fn stat(&self, path: &Path) -> Result<std::fs::Metadata> {
        let safe = self.safe_path(path)?;
        Ok(tokio::fs::metadata(&safe).await?)
    }

    pub async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let safe = self.safe_path(path)?;
        Ok(tokio::fs::read(&safe).await?)
    }

    /// Write bytes and flush them to disk before returning.
    pub async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let safe = self.safe_path(path)?;
        let mut file = tokio::fs::File::create(&safe).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn ensure_dir(&self, path: &Path) -> Result<()> {
        let safe = self.safe_path(path)?;
        Ok(tokio::fs::create_dir_all(&safe).await?)
    }

    /// Unlink a file. Missing files are not an error.
    pub async fn remove_file(&self, path: &Path) -> Result<bool> {
        let safe = self.safe_path(path)?;
        match tokio::fs::remove_file(&safe).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from = self.safe_path(from)?;
        let to = self.safe_path(to)?;
        Ok(tokio::fs::rename(&from, &to).await?)
    }

    pub async fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let from = self.safe_path(from)?;
        let to = self.safe_path(to)?;
        Ok(tokio::fs::copy(&from, &to).await?)
    }

    pub async fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let safe = self.safe_path(path)?;
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&safe).await?;
        while let Some(entry) = reader.next_entry().await? {
            entries.push(entry.path());
        }
        Ok(entries)
    }
}

fn split_name(name: &str) -> (&str, Option<&str>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            (stem, Some(ext))
        }
        _ => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render_len(path: &Path) -> usize {
        path.to_string_lossy().chars().count()
    }

    #[test]
    fn short_paths_pass_through() {
        let lp = LongPath::new(250);
        let path = Path::new("/cache/aa/bb.jpg");
        assert_eq!(lp.safe_path(path).unwrap(), path);
    }

    #[test]
    fn long_basename_is_truncated_and_hashed() {
        let lp = LongPath::new(100);
        let path = PathBuf::from(format!("/data/{}.jpg", "x".repeat(200)));
        let safe = lp.safe_path(&path).unwrap();
        assert!(render_len(&safe) <= 100);
        assert_eq!(safe.extension().unwrap(), "jpg");
        assert!(safe.starts_with("/data"));
    }

    #[test]
    fn safe_path_is_idempotent() {
        let lp = LongPath::new(100);
        let path = PathBuf::from(format!("/data/{}.jpg", "x".repeat(200)));
        let once = lp.safe_path(&path).unwrap();
        let twice = lp.safe_path(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn siblings_differing_past_boundary_stay_distinct() {
        let lp = LongPath::new(100);
        let a = PathBuf::from(format!("/data/{}a.jpg", "x".repeat(200)));
        let b = PathBuf::from(format!("/data/{}b.jpg", "x".repeat(200)));
        let safe_a = lp.safe_path(&a).unwrap();
        let safe_b = lp.safe_path(&b).unwrap();
        assert_ne!(safe_a, safe_b);
    }

    #[test]
    fn oversize_directory_fails() {
        let lp = LongPath::new(60);
        let path =
            PathBuf::from(format!("/{}/short.jpg", "d".repeat(100)));
        match lp.safe_path(&path) {
            Err(CoreError::PathTooLong(_)) => {}
            other => panic!("expected PathTooLong, got {other:?}"),
        }
    }

    #[test]
    fn resolve_read_prefers_existing_locations() {
        let dir = tempfile::tempdir().unwrap();
        let limit = render_len(dir.path()) + 30;
        let lp = LongPath::new(limit);

        // Short paths resolve to themselves.
        let short = dir.path().join("a.bin");
        assert_eq!(lp.resolve_read(&short).unwrap(), short);

        // A file living at its over-long original path is read in place.
        let long = dir.path().join(format!("{}.bin", "x".repeat(100)));
        std::fs::write(&long, b"original").unwrap();
        assert_eq!(lp.resolve_read(&long).unwrap(), long);

        // Once the safe alternate exists, it wins.
        let safe = lp.safe_path(&long).unwrap();
        std::fs::write(&safe, b"rewritten").unwrap();
        assert_eq!(lp.resolve_read(&long).unwrap(), safe);
    }

    #[tokio::test]
    async fn write_then_read_round_trips_over_long_names() {
        let dir = tempfile::tempdir().unwrap();
        let lp = LongPath::new(
            render_len(dir.path()) + 40,
        );
        let long = dir.path().join(format!("{}.bin", "n".repeat(120)));
        lp.write(&long, b"payload").await.unwrap();
        assert!(lp.exists(&long).await.unwrap());
        assert_eq!(lp.read(&long).await.unwrap(), b"payload");
        assert!(lp.remove_file(&long).await.unwrap());
        assert!(!lp.remove_file(&long).await.unwrap());
    }
}
