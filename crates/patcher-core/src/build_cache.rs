//! Content-addressed cache of successful builds.
//!
//! Keys are derived from the patch digest and the builder module. Only
//! successful results are ever stored, so a failing build for the same bytes
//! is always retried. Same-key requests are single-flighted through
//! [`BuildCache::lock`]; optional persistence shares the cache between
//! processes (the builder gateway runs once per agent invocation).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::cas::fs::ShardedStore;
use crate::cas::Digest;
use crate::domain::{BuildResult, Result};

/// Cache key: one entry per (patch bytes, builder module).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(Digest);

impl CacheKey {
    pub fn new(patch: &Digest, builder_module: &str) -> Self {
        CacheKey(Digest::compute_parts(&[
            patch.as_bytes(),
            builder_module.as_bytes(),
        ]))
    }

    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    /// `store` calls refused because the result was not a success.
    pub refused: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    refused: AtomicU64,
}

type InFlightMap = HashMap<CacheKey, Arc<Mutex<()>>>;

/// Single-flight guard returned by [`BuildCache::lock`]. Dropping it lets
/// the next same-key request in and forgets the key once nobody waits.
pub struct InFlightGuard<'a> {
    key: CacheKey,
    in_flight: &'a SyncMutex<InFlightMap>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        // Waiters clone the slot under this lock, so a count of one means
        // only the map still holds it.
        if in_flight
            .get(&self.key)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            in_flight.remove(&self.key);
        }
    }
}

/// Build cache shared by every build request in a run.
#[derive(Debug)]
pub struct BuildCache {
    entries: Mutex<HashMap<CacheKey, BuildResult>>,
    in_flight: SyncMutex<InFlightMap>,
    store: Option<ShardedStore>,
    counters: Counters,
}

impl Default for BuildCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl BuildCache {
    /// Process-local cache.
    pub fn in_memory() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            in_flight: SyncMutex::new(HashMap::new()),
            store: None,
            counters: Counters::default(),
        }
    }

    /// Cache backed by JSON blobs under `root/objects/`.
    pub fn persistent(root: impl AsRef<Path>) -> Result<Self> {
        let store = ShardedStore::new(root)?;
        Ok(Self {
            store: Some(store),
            ..Self::in_memory()
        })
    }

    /// Acquire the single-flight guard for `key`.
    ///
    /// Hold it across lookup → build → store. A concurrent request for the
    /// same key waits here and then observes the stored result (or rebuilds
    /// if the first attempt failed).
    pub async fn lock(&self, key: &CacheKey) -> InFlightGuard<'_> {
        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(in_flight.entry(*key).or_default())
        };
        InFlightGuard {
            key: *key,
            in_flight: &self.in_flight,
            guard: Some(slot.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn in_flight_keys(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Look up a successful build. Returned results have `cache_hit` set.
    pub async fn lookup(&self, key: &CacheKey) -> Option<BuildResult> {
        let mut entries = self.entries.lock().await;
        if let Some(hit) = entries.get(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(mark_hit(hit.clone()));
        }

        if let Some(persisted) = self.load_persisted(key) {
            entries.insert(*key, persisted.clone());
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(mark_hit(persisted));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a successful build. Returns `false` (and stores nothing) for
    /// anything but a success, or when an entry already exists.
    pub async fn store(&self, key: &CacheKey, result: &BuildResult) -> Result<bool> {
        if !result.is_success() {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            warn!(
                event = "build_cache.store_refused",
                key = %key.digest().short(),
                status = %result.status,
            );
            return Ok(false);
        }

        let mut entries = self.entries.lock().await;
        if entries.contains_key(key) {
            return Ok(false);
        }

        let mut entry = result.clone();
        entry.cache_hit = false;

        if let Some(store) = &self.store {
            let blob = serde_json::to_vec(&entry)?;
            store.put(key.digest(), &blob)?;
        }
        entries.insert(*key, entry);
        self.counters.stores.fetch_add(1, Ordering::Relaxed);
        debug!(event = "build_cache.stored", key = %key.digest().short());
        Ok(true)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            stores: self.counters.stores.load(Ordering::Relaxed),
            refused: self.counters.refused.load(Ordering::Relaxed),
        }
    }

    fn load_persisted(&self, key: &CacheKey) -> Option<BuildResult> {
        let store = self.store.as_ref()?;
        let blob = match store.get(key.digest()) {
            Ok(blob) => blob?,
            Err(e) => {
                warn!(event = "build_cache.read_failed", key = %key.digest().short(), error = %e);
                return None;
            }
        };

        match serde_json::from_slice::<BuildResult>(&blob) {
            Ok(result) if result.is_success() => Some(result),
            Ok(_) | Err(_) => {
                // Never serve a corrupt or non-success blob; drop it so the
                // next build replaces it.
                warn!(event = "build_cache.corrupt_entry", key = %key.digest().short());
                let _ = store.remove(key.digest());
                None
            }
        }
    }
}

fn mark_hit(mut result: BuildResult) -> BuildResult {
    result.cache_hit = true;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{BuildId, ExecStatus, LogBundle};

    fn key(patch: &[u8]) -> CacheKey {
        CacheKey::new(&Digest::compute(patch), "inc-builder-asan")
    }

    fn ok_result(id: &str) -> BuildResult {
        BuildResult::success(
            BuildId::new(id),
            LogBundle::default().with_artifact("build.log", "ok"),
        )
    }

    #[tokio::test]
    async fn store_then_lookup_marks_hit() {
        let cache = BuildCache::in_memory();
        let k = key(b"diff");
        assert!(cache.lookup(&k).await.is_none());
        assert!(cache.store(&k, &ok_result("b1")).await.unwrap());

        let hit = cache.lookup(&k).await.unwrap();
        assert!(hit.cache_hit);
        assert_eq!(hit.build_id, Some(BuildId::new("b1")));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                stores: 1,
                refused: 0
            }
        );
    }

    #[tokio::test]
    async fn failures_and_timeouts_are_never_stored() {
        let cache = BuildCache::in_memory();
        let k = key(b"diff");
        let failed = BuildResult::failed(ExecStatus::Failure(2), LogBundle::default());
        let timed_out = BuildResult::failed(ExecStatus::Timeout, LogBundle::default());

        assert!(!cache.store(&k, &failed).await.unwrap());
        assert!(!cache.store(&k, &timed_out).await.unwrap());
        assert!(cache.lookup(&k).await.is_none());
        assert_eq!(cache.stats().refused, 2);
    }

    #[tokio::test]
    async fn first_store_is_authoritative() {
        let cache = BuildCache::in_memory();
        let k = key(b"diff");
        assert!(cache.store(&k, &ok_result("first")).await.unwrap());
        assert!(!cache.store(&k, &ok_result("second")).await.unwrap());
        let hit = cache.lookup(&k).await.unwrap();
        assert_eq!(hit.build_id, Some(BuildId::new("first")));
    }

    #[tokio::test]
    async fn builder_module_is_part_of_key() {
        let digest = Digest::compute(b"diff");
        assert_ne!(
            CacheKey::new(&digest, "inc-builder-asan"),
            CacheKey::new(&digest, "inc-builder-ubsan")
        );
    }

    #[tokio::test]
    async fn persistent_cache_is_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let k = key(b"shared");
        {
            let cache = BuildCache::persistent(dir.path()).unwrap();
            cache.store(&k, &ok_result("persisted")).await.unwrap();
        }
        let reopened = BuildCache::persistent(dir.path()).unwrap();
        let hit = reopened.lookup(&k).await.unwrap();
        assert!(hit.cache_hit);
        assert_eq!(hit.build_id, Some(BuildId::new("persisted")));
    }

    #[tokio::test]
    async fn corrupt_persisted_entry_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let k = key(b"corrupt");
        let store = ShardedStore::new(dir.path()).unwrap();
        store.put(k.digest(), b"{not json").unwrap();

        let cache = BuildCache::persistent(dir.path()).unwrap();
        assert!(cache.lookup(&k).await.is_none());
        assert!(store.get(k.digest()).unwrap().is_none());
    }

    #[tokio::test]
    async fn lock_serializes_same_key() {
        let cache = Arc::new(BuildCache::in_memory());
        let k = key(b"race");
        let guard = cache.lock(&k).await;

        let contender = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let _g = cache.lock(&k).await;
                cache.lookup(&k).await
            })
        };

        tokio::task::yield_now().await;
        cache.store(&k, &ok_result("winner")).await.unwrap();
        drop(guard);

        let seen = contender.await.unwrap().unwrap();
        assert_eq!(seen.build_id, Some(BuildId::new("winner")));
        assert_eq!(cache.in_flight_keys(), 0);
    }

    #[tokio::test]
    async fn released_keys_are_forgotten() {
        let cache = BuildCache::in_memory();
        for patch in [b"one".as_slice(), b"two", b"three"] {
            let _guard = cache.lock(&key(patch)).await;
            assert_eq!(cache.in_flight_keys(), 1);
        }
        assert_eq!(cache.in_flight_keys(), 0);
    }
}
