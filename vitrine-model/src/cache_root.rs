use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{CacheRootId, CollectionId};

/// A directory designated for artifact storage, with its own size and file
/// count budget. Inactive roots receive no new placements but continue to
/// serve reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRoot {
    pub id: CacheRootId,
    pub name: String,
    pub path: PathBuf,
    /// Capacity ceiling; `None` disables enforcement (the fill ratio then
    /// assumes a 1 GiB denominator for placement ordering).
    pub max_size_bytes: Option<u64>,
    pub current_size_bytes: u64,
    pub file_count: u64,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl CacheRoot {
    pub fn new(name: impl Into<String>, path: PathBuf) -> Self {
        Self {
            id: CacheRootId::new(),
            name: name.into(),
            path,
            max_size_bytes: None,
            current_size_bytes: 0,
            file_count: 0,
            priority: 0,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    /// Fill ratio used by placement ordering. Roots without a configured
    /// ceiling are compared as if they held 1 GiB.
    pub fn fill_ratio(&self) -> f64 {
        const FALLBACK_DENOMINATOR: u64 = 1 << 30;
        let max = match self.max_size_bytes {
            Some(0) | None => FALLBACK_DENOMINATOR,
            Some(max) => max,
        };
        self.current_size_bytes as f64 / max as f64
    }
}

/// Exclusive association of a collection to one cache root. Exactly one
/// non-deleted binding exists per collection; rebinding requires a
/// redistribute (or purge) pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionCacheBinding {
    pub collection_id: CollectionId,
    pub cache_root_id: CacheRootId,
    pub bound_at: DateTime<Utc>,
}

impl CollectionCacheBinding {
    pub fn new(collection_id: CollectionId, cache_root_id: CacheRootId) -> Self {
        Self {
            collection_id,
            cache_root_id,
            bound_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_ratio_uses_gib_fallback() {
        let mut root = CacheRoot::new("a", PathBuf::from("/cache/a"));
        root.current_size_bytes = 1 << 29;
        assert!((root.fill_ratio() - 0.5).abs() < f64::EPSILON);

        root.max_size_bytes = Some(1 << 30);
        assert!((root.fill_ratio() - 0.5).abs() < f64::EPSILON);

        root.max_size_bytes = Some(1 << 29);
        assert!((root.fill_ratio() - 1.0).abs() < f64::EPSILON);
    }
}
