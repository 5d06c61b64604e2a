//! Three-tier artifact read path: process memory, shared store, disk.
//!
//! L1 is a sharded byte-bounded LRU with a short TTL. L2 is redis and
//! optional; when disabled reads skip straight to the artifact store. A
//! miss everywhere invokes the producer under a per-fingerprint
//! single-flight guard so concurrent readers share one decode.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use redis::{aio::ConnectionManager, AsyncCommands};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use vitrine_model::{CacheRoot, EncodeFormat, Fingerprint};

use crate::artifact_store::{ArtifactLookup, ArtifactStore};
use crate::error::Result;
use crate::placement::PlacementEngine;

const L1_SHARDS: usize = 16;

struct L1Entry {
    bytes: Arc<Vec<u8>>,
    inserted_at: Instant,
}

struct L1Shard {
    entries: LruCache<String, L1Entry>,
    bytes: u64,
}

/// In-process LRU tier, sharded for lock granularity.
pub struct MemoryTier {
    shards: Vec<Mutex<L1Shard>>,
    shard_capacity: u64,
    ttl: Duration,
}

impl std::fmt::Debug for MemoryTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTier")
            .field("shards", &self.shards.len())
            .field("shard_capacity", &self.shard_capacity)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl MemoryTier {
    pub fn new(max_bytes: u64, ttl: Duration) -> Self {
        let shard_capacity = (max_bytes / L1_SHARDS as u64).max(1);
        let shards = (0..L1_SHARDS)
            .map(|_| {
                Mutex::new(L1Shard {
                    entries: LruCache::unbounded(),
                    bytes: 0,
                })
            })
            .collect();
        Self {
            shards,
            shard_capacity,
            ttl,
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<L1Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        let mut shard = self.shard_for(key).lock().expect("l1 shard lock");
        let expired = match shard.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                return Some(entry.bytes.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            if let Some(entry) = shard.entries.pop(key) {
                shard.bytes -= entry.bytes.len() as u64;
            }
        }
        None
    }

    pub fn insert(&self, key: String, bytes: Arc<Vec<u8>>) {
        let size = bytes.len() as u64;
        if size > self.shard_capacity {
            return;
        }
        let mut shard = self.shard_for(&key).lock().expect("l1 shard lock");
        if let Some(previous) = shard.entries.push(
            key,
            L1Entry {
                bytes,
                inserted_at: Instant::now(),
            },
        ) {
            shard.bytes -= previous.1.bytes.len() as u64;
        }
        shard.bytes += size;
        while shard.bytes > self.shard_capacity {
            match shard.entries.pop_lru() {
                Some((_, entry)) => {
                    shard.bytes -= entry.bytes.len() as u64
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &str) {
        let mut shard = self.shard_for(key).lock().expect("l1 shard lock");
        if let Some(entry) = shard.entries.pop(key) {
            shard.bytes -= entry.bytes.len() as u64;
        }
    }

    #[cfg(test)]
    fn total_bytes(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.lock().expect("l1 shard lock").bytes)
            .sum()
    }
}

/// Redis-backed shared tier.
#[derive(Clone)]
pub struct RedisTier {
    conn: ConnectionManager,
    ttl: Duration,
}

impl std::fmt::Debug for RedisTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTier")
            .field("connection", &"ConnectionManager")
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl RedisTier {
    pub async fn connect(url: &str, ttl: Duration) -> Result<Self> {
        info!("connecting to redis cache at {url}");
        let client = redis::Client::open(url)
            .map_err(crate::error::CoreError::from)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn, ttl })
    }

    fn key(fingerprint: &str) -> String {
        format!("artifact:v1:{fingerprint}")
    }

    pub async fn get(&self, fingerprint: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> =
            conn.get(Self::key(fingerprint)).await?;
        Ok(value)
    }

    pub async fn set(&self, fingerprint: &str, bytes: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(
            Self::key(fingerprint),
            bytes,
            self.ttl.as_secs(),
        )
        .await?;
        Ok(())
    }

    pub async fn delete(&self, fingerprint: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::key(fingerprint)).await?;
        Ok(())
    }
}

type Flight = Arc<OnceCell<Arc<Vec<u8>>>>;

/// The assembled read path.
pub struct ReadCache {
    l1: MemoryTier,
    l2: Option<RedisTier>,
    store: ArtifactStore,
    placement: PlacementEngine,
    flights: DashMap<String, Flight>,
}

impl std::fmt::Debug for ReadCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadCache")
            .field("l1", &self.l1)
            .field("l2_enabled", &self.l2.is_some())
            .field("in_flight", &self.flights.len())
            .finish()
    }
}

impl ReadCache {
    pub fn new(
        l1: MemoryTier,
        l2: Option<RedisTier>,
        store: ArtifactStore,
        placement: PlacementEngine,
    ) -> Self {
        Self {
            l1,
            l2,
            store,
            placement,
            flights: DashMap::new(),
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Resolve a fingerprint to bytes with the fewest trips, producing
    /// under single-flight on a full miss. The producer is responsible for
    /// committing the artifact to the store before returning its bytes.
    pub async fn get_or_produce<F, Fut>(
        &self,
        root: &CacheRoot,
        fingerprint: &Fingerprint,
        format: EncodeFormat,
        ttl: Option<Duration>,
        producer: F,
    ) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let key = fingerprint.as_str().to_string();

        if let Some(bytes) = self.l1.get(&key) {
            return Ok(bytes);
        }

        if let Some(l2) = &self.l2 {
            match l2.get(&key).await {
                Ok(Some(bytes)) => {
                    let bytes = Arc::new(bytes);
                    self.l1.insert(key, bytes.clone());
                    return Ok(bytes);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("l2 read failed, falling through: {err}")
                }
            }
        }

        let flight = self
            .flights
            .entry(key.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let result = flight
            .get_or_try_init(|| async {
                match self
                    .store
                    .read_valid(&root.path, fingerprint, format, ttl)
                    .await?
                {
                    ArtifactLookup::Valid(bytes) => {
                        let bytes = Arc::new(bytes);
                        self.populate_upper(&key, &bytes).await;
                        return Ok(bytes);
                    }
                    ArtifactLookup::Evicted { freed_bytes } => {
                        if freed_bytes > 0 {
                            let _ = self
                                .placement
                                .release(root.id, freed_bytes)
                                .await;
                        }
                    }
                    ArtifactLookup::Missing => {}
                }

                debug!(fingerprint = %key, "artifact miss, producing");
                let bytes = Arc::new(producer().await?);
                self.populate_upper(&key, &bytes).await;
                Ok(bytes)
            })
            .await
            .cloned();

        self.flights
            .remove_if(&key, |_, value| Arc::ptr_eq(value, &flight));

        result
    }

    async fn populate_upper(&self, key: &str, bytes: &Arc<Vec<u8>>) {
        if let Some(l2) = &self.l2 {
            if let Err(err) = l2.set(key, bytes).await {
                warn!("l2 populate failed: {err}");
            }
        }
        self.l1.insert(key.to_string(), bytes.clone());
    }

    /// Drop a fingerprint from the memory and shared tiers only, leaving
    /// the on-disk artifact in place. Used when the file must survive for
    /// a later purge pass (soft-deleted collections).
    pub async fn forget(&self, fingerprint: &Fingerprint) {
        let key = fingerprint.as_str();
        self.l1.remove(key);
        if let Some(l2) = &self.l2 {
            if let Err(err) = l2.delete(key).await {
                warn!("l2 forget failed: {err}");
            }
        }
    }

    /// Remove a fingerprint from every tier. Idempotent: invalidating an
    /// unknown fingerprint succeeds and does nothing.
    pub async fn invalidate(
        &self,
        root: &CacheRoot,
        fingerprint: &Fingerprint,
        format: EncodeFormat,
    ) -> Result<()> {
        let key = fingerprint.as_str();
        self.l1.remove(key);
        if let Some(l2) = &self.l2 {
            if let Err(err) = l2.delete(key).await {
                warn!("l2 invalidate failed: {err}");
            }
        }
        if let Some(freed) =
            self.store.delete(&root.path, fingerprint, format).await?
        {
            self.placement.release(root.id, freed).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arc_bytes(len: usize, fill: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![fill; len])
    }

    #[test]
    fn l1_hits_until_ttl_expiry() {
        let tier =
            MemoryTier::new(1 << 20, Duration::from_millis(50));
        tier.insert("a".into(), arc_bytes(10, 1));
        assert!(tier.get("a").is_some());

        std::thread::sleep(Duration::from_millis(60));
        assert!(tier.get("a").is_none());
        assert_eq!(tier.total_bytes(), 0);
    }

    #[test]
    fn l1_evicts_least_recently_used_when_over_budget() {
        // One shard's budget is max_bytes / 16; keys may land anywhere, so
        // overfill a single key's shard deterministically by reusing it.
        let tier = MemoryTier::new(16 * 100, Duration::from_secs(60));
        tier.insert("k".into(), arc_bytes(80, 1));
        tier.insert("k".into(), arc_bytes(90, 2));
        assert_eq!(tier.get("k").unwrap().len(), 90);
        assert!(tier.total_bytes() <= 100);
    }

    #[test]
    fn l1_rejects_entries_larger_than_a_shard() {
        let tier = MemoryTier::new(16 * 100, Duration::from_secs(60));
        tier.insert("big".into(), arc_bytes(101, 1));
        assert!(tier.get("big").is_none());
    }

    #[test]
    fn l1_remove_is_idempotent() {
        let tier = MemoryTier::new(1 << 20, Duration::from_secs(60));
        tier.insert("a".into(), arc_bytes(10, 1));
        tier.remove("a");
        tier.remove("a");
        assert!(tier.get("a").is_none());
    }
}
