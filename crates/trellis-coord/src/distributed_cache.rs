use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use trellis_common::{CacheKey, CoordError, CoordResult};
use trellis_meta::MetaStore;

/// Envelope persisted in the `MetaStore` for every cached value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    /// Wall-clock creation time, ms since epoch.
    pub created_at_ms: i64,
    pub ttl_seconds: u64,
    pub namespace: String,
}

impl CacheEntry {
    /// Backends may round TTLs up (etcd leases are whole seconds), so the
    /// envelope carries its own deadline as well.
    fn is_expired(&self, now_ms: i64) -> bool {
        let ttl_ms = i64::try_from(self.ttl_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
        now_ms >= self.created_at_ms.saturating_add(ttl_ms)
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    fills: AtomicU64,
    coalesced: AtomicU64,
    rejected: AtomicU64,
}

/// Point-in-time copy of the cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Factory invocations by `get_or_compute`.
    pub fills: u64,
    /// Callers that waited on another caller's fill and were served by it.
    pub coalesced: u64,
    /// Values refused because they were not plain data.
    pub rejected: u64,
}

/// One in-progress fill of a key. The leader publishes the admitted value
/// here, so waiters are served even when nothing was written to the store.
#[derive(Debug, Default)]
struct Flight {
    gate: Mutex<()>,
    value: OnceLock<serde_json::Value>,
}

/// Cross-execution, TTL-bound cache for plain data. Every value goes through
/// JSON before it is stored, and anything that does not is refused.
pub struct DistributedCache {
    store: Arc<dyn MetaStore>,
    inflight: DashMap<String, Arc<Flight>>,
    stampede_wait: Duration,
    counters: Counters,
}

impl std::fmt::Debug for DistributedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCache")
            .field("inflight", &self.inflight.len())
            .field("stampede_wait", &self.stampede_wait)
            .finish()
    }
}

impl DistributedCache {
    pub fn new(store: Arc<dyn MetaStore>, stampede_wait: Duration) -> Self {
        Self {
            store,
            inflight: DashMap::new(),
            stampede_wait,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            fills: self.counters.fills.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
        }
    }

    /// `Ok(None)` is a miss; a stored `false`, `0` or `null` comes back as
    /// `Some`.
    pub async fn get<T>(&self, key: &CacheKey) -> CoordResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let value = self.lookup(key).await?;
        let counter = if value.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }

    async fn lookup<T>(&self, key: &CacheKey) -> CoordResult<Option<T>>
    where
        T: DeserializeOwned,
    {
        let Some((bytes, _rev)) = self.store.get(key.as_str()).await.map_err(CoordError::Store)? else {
            return Ok(None);
        };

        let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(key=%key, error=%e, "dropping undecodable cache envelope");
                self.store.delete(key.as_str()).await.map_err(CoordError::Store)?;
                return Ok(None);
            }
        };

        if entry.is_expired(Utc::now().timestamp_millis()) {
            self.store.delete(key.as_str()).await.map_err(CoordError::Store)?;
            return Ok(None);
        }

        match serde_json::from_value::<T>(entry.value) {
            Ok(v) => Ok(Some(v)),
            // Another reader may want this entry under its own type.
            Err(e) => {
                tracing::debug!(key=%key, error=%e, "cached value does not match requested type");
                Ok(None)
            }
        }
    }

    /// Stores `value` for `ttl_seconds`. A zero TTL stores nothing.
    ///
    /// The value is serialized before anything is written, so a rejected
    /// value leaves the existing entry for `key` untouched.
    pub async fn set<T>(&self, key: &CacheKey, value: &T, ttl_seconds: u64) -> CoordResult<()>
    where
        T: Serialize + ?Sized,
    {
        let value = self.admit(key, value)?;
        self.put_entry(key, value, ttl_seconds).await
    }

    async fn put_entry(&self, key: &CacheKey, value: serde_json::Value, ttl_seconds: u64) -> CoordResult<()> {
        if ttl_seconds == 0 {
            tracing::debug!(key=%key, "ttl is zero, not caching");
            return Ok(());
        }

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at_ms: Utc::now().timestamp_millis(),
            ttl_seconds,
            namespace: key.namespace().to_string(),
        };
        let bytes = serde_json::to_vec(&entry).map_err(|e| CoordError::Store(e.into()))?;
        self.store
            .put(key.as_str(), bytes, Some(ttl_seconds.saturating_mul(1000)))
            .await
            .map_err(CoordError::Store)?;
        Ok(())
    }

    fn admit<T>(&self, key: &CacheKey, value: &T) -> CoordResult<serde_json::Value>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_value(value).map_err(|e| {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::error!(key=%key, error=%e, "refusing non-data value for distributed cache");
            CoordError::SerializationViolation {
                key: key.to_string(),
                reason: e.to_string(),
            }
        })
    }

    pub async fn remove(&self, key: &CacheKey) -> CoordResult<bool> {
        self.store.delete(key.as_str()).await.map_err(CoordError::Store)
    }

    /// Removes every entry whose key starts with `prefix`.
    pub async fn remove_prefix(&self, prefix: &str) -> CoordResult<u64> {
        self.store.delete_prefix(prefix).await.map_err(CoordError::Store)
    }

    /// Returns the cached value, or runs `factory` once and caches its result.
    ///
    /// Concurrent misses on the same key in this process share one fill: the
    /// first caller runs `factory` while the rest wait, up to the stampede
    /// wait, and then take its value, even with a zero TTL. A waiter that gives up computes the
    /// value itself. A failed factory caches nothing; the next waiter in line
    /// takes over the fill.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl_seconds: u64,
        factory: F,
    ) -> CoordResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(v) = self.get(key).await? {
            return Ok(v);
        }

        let flight = self.inflight.entry(key.to_string()).or_default().clone();

        let result = self.fill(key, ttl_seconds, factory, &flight).await;

        self.inflight.remove_if(key.as_str(), |_, f| {
            Arc::ptr_eq(f, &flight) && Arc::strong_count(f) == 2
        });
        result
    }

    async fn fill<T, F, Fut>(
        &self,
        key: &CacheKey,
        ttl_seconds: u64,
        factory: F,
        flight: &Arc<Flight>,
    ) -> CoordResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let _guard: Option<MutexGuard<'_, ()>> =
            match tokio::time::timeout(self.stampede_wait, flight.gate.lock()).await {
                Ok(guard) => Some(guard),
                Err(_) => {
                    tracing::warn!(
                        key=%key,
                        wait_ms = self.stampede_wait.as_millis() as u64,
                        "in-flight fill did not finish in time, computing independently"
                    );
                    None
                }
            };

        let shared = flight
            .value
            .get()
            .and_then(|v| serde_json::from_value::<T>(v.clone()).ok());
        let shared = match shared {
            Some(v) => Some(v),
            None => self.lookup(key).await?,
        };
        if let Some(v) = shared {
            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return Ok(v);
        }

        self.counters.fills.fetch_add(1, Ordering::Relaxed);
        let value = factory().await.map_err(CoordError::Compute)?;
        let admitted = self.admit(key, &value)?;
        // Only the first fill of this flight is published.
        let _ = flight.value.set(admitted.clone());
        self.put_entry(key, admitted, ttl_seconds).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;

    use serde::Serialize;
    use trellis_common::CacheKeyBuilder;
    use trellis_meta::MemoryMetaStore;

    use super::*;
    use crate::handle::Capability;

    fn key(id: &str) -> CacheKey {
        CacheKeyBuilder::new().build_key(Some("t1"), "answers", id).unwrap()
    }

    fn cache() -> Arc<DistributedCache> {
        Arc::new(DistributedCache::new(
            Arc::new(MemoryMetaStore::new()),
            Duration::from_secs(5),
        ))
    }

    #[derive(Serialize)]
    struct WithCallback {
        title: String,
        on_change: Capability,
    }

    #[tokio::test]
    async fn test_miss_is_distinct_from_falsy_values() {
        let cache = cache();
        assert_eq!(cache.get::<bool>(&key("missing")).await.unwrap(), None);

        cache.set(&key("flag"), &false, 60).await.unwrap();
        cache.set(&key("zero"), &0u32, 60).await.unwrap();
        cache.set(&key("null"), &Option::<u32>::None, 60).await.unwrap();

        assert_eq!(cache.get::<bool>(&key("flag")).await.unwrap(), Some(false));
        assert_eq!(cache.get::<u32>(&key("zero")).await.unwrap(), Some(0));
        assert_eq!(cache.get::<Option<u32>>(&key("null")).await.unwrap(), Some(None));

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 3);
    }

    #[tokio::test]
    async fn test_set_rejects_callable_and_keeps_previous_value() {
        let cache = cache();
        let k = key("board-title");
        cache.set(&k, &"old title", 60).await.unwrap();

        let bad = WithCallback {
            title: "new title".into(),
            on_change: Capability::new(|args| async move { Ok(args) }),
        };
        let err = cache.set(&k, &bad, 60).await.unwrap_err();
        assert!(matches!(err, CoordError::SerializationViolation { .. }));

        assert_eq!(cache.get::<String>(&k).await.unwrap().as_deref(), Some("old title"));
        assert_eq!(cache.stats().rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let cache = cache();
        cache.set(&key("a"), &"v", 2).await.unwrap();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert!(cache.get::<String>(&key("a")).await.unwrap().is_some());
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(cache.get::<String>(&key("a")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_stored() {
        let cache = cache();
        cache.set(&key("a"), &1u8, 0).await.unwrap();
        assert_eq!(cache.get::<u8>(&key("a")).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_get_or_compute_single_flight() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&key("summary"), 60, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(vec![1u32, 2, 3])
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), vec![1, 2, 3]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().fills, 1);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_or_compute_zero_ttl_shares_one_fill() {
        let cache = cache();
        let calls = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(&key("live-quote"), 0, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(String::from("42.17"))
                    })
                    .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "42.17");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.fills, 1);
        assert_eq!(stats.coalesced, 7);
        // Nothing outlives the flight.
        assert_eq!(cache.get::<String>(&key("live-quote")).await.unwrap(), None);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_compute_rejects_non_data_result() {
        let cache = cache();
        let k = key("pairs");

        let err = cache
            .get_or_compute(&k, 60, || async {
                let mut pairs: HashMap<(u8, u8), u8> = HashMap::new();
                pairs.insert((1, 2), 3);
                Ok(pairs)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::SerializationViolation { .. }));
        assert_eq!(cache.stats().rejected, 1);
        assert_eq!(cache.get::<serde_json::Value>(&k).await.unwrap(), None);
        assert!(cache.inflight.is_empty());
    }

    #[tokio::test]
    async fn test_get_with_other_type_keeps_entry() {
        let cache = cache();
        let k = key("label");
        cache.set(&k, &"quarterly", 60).await.unwrap();

        assert_eq!(cache.get::<u64>(&k).await.unwrap(), None);
        assert_eq!(cache.get::<String>(&k).await.unwrap().as_deref(), Some("quarterly"));
    }

    #[tokio::test]
    async fn test_failed_factory_caches_nothing() {
        let cache = cache();
        let k = key("flaky");
        let err = cache
            .get_or_compute::<u32, _, _>(&k, 60, || async { Err(anyhow::anyhow!("sheet unavailable")) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoordError::Compute(_)));

        let v = cache.get_or_compute(&k, 60, || async { Ok(7u32) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn test_undecodable_entry_is_a_miss() {
        let store = Arc::new(MemoryMetaStore::new());
        let cache = DistributedCache::new(store.clone(), Duration::from_secs(1));
        store.put("t1:answers:junk", b"not json".to_vec(), None).await.unwrap();

        assert_eq!(cache.get::<u32>(&key("junk")).await.unwrap(), None);
        assert!(store.get("t1:answers:junk").await.unwrap().is_none());
    }
}
