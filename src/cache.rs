//! Entity caches with explicit eviction policies

use crate::error::Result;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct Slot<V> {
    value: V,
    written: Instant,
}

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V>>>;

// ============================================================================
// Size + TTL cache
// ============================================================================

/// Bounded map with a TTL measured from the last write. Concurrent
/// misses for the same key join a single in-flight fetch; a failed
/// fetch reaches every waiter and is never stored.
pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<K, Slot<V>>>,
    inflight: Mutex<HashMap<K, SharedFetch<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn peek(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|slot| slot.written.elapsed() < self.ttl)
            .map(|slot| slot.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock();
        entries.retain(|_, slot| slot.written.elapsed() < self.ttl);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, slot)| slot.written)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            key,
            Slot {
                value,
                written: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }

    /// Cached value, or join/start the one in-flight fetch for `key`.
    pub async fn get_or_fetch<F, Fut>(self: &Arc<Self>, key: K, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>> + Send + 'static,
    {
        if let Some(value) = self.peek(&key) {
            return Ok(value);
        }
        let shared = {
            let mut inflight = self.inflight.lock();
            if let Some(existing) = inflight.get(&key) {
                existing.clone()
            } else {
                let cache = Arc::clone(self);
                let task_key = key.clone();
                let fut = fetch();
                let shared = async move {
                    let result = fut.await;
                    if let Ok(value) = &result {
                        cache.insert(task_key.clone(), value.clone());
                    }
                    cache.inflight.lock().remove(&task_key);
                    result
                }
                .boxed()
                .shared();
                inflight.insert(key.clone(), shared.clone());
                shared
            }
        };
        shared.await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

// ============================================================================
// Opportunistic online-status cache
// ============================================================================

/// uuid -> online flag with "ask again later" semantics: lookups never
/// block, a miss reports offline and kicks off at most one background
/// probe per uuid. Entries expire on a short TTL.
pub struct OnlineStatusCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Slot<bool>>>,
    probing: Mutex<HashSet<String>>,
}

impl OnlineStatusCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
            probing: Mutex::new(HashSet::new()),
        }
    }

    /// Cached flag or a conservative `false` while the probe runs in
    /// the background.
    pub fn get<F, Fut>(self: &Arc<Self>, uuid: &str, probe: F) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        if let Some(slot) = self.entries.lock().get(uuid) {
            if slot.written.elapsed() < self.ttl {
                return slot.value;
            }
        }
        {
            let mut probing = self.probing.lock();
            if !probing.insert(uuid.to_string()) {
                return false;
            }
        }
        let cache = Arc::clone(self);
        let uuid = uuid.to_string();
        let fut = probe();
        tokio::spawn(async move {
            match fut.await {
                Ok(online) => {
                    cache.entries.lock().insert(
                        uuid.clone(),
                        Slot {
                            value: online,
                            written: Instant::now(),
                        },
                    );
                }
                // no cache update on failure, the next lookup re-probes
                Err(err) => log::debug!("online probe for {uuid} failed: {err}"),
            }
            cache.probing.lock().remove(&uuid);
        });
        false
    }
}

// ============================================================================
// Single-flight TTL cell
// ============================================================================

/// TTL-gated cell with at most one refresh in flight. The gate is a
/// mutex held across the whole fetch-and-store, so callers arriving
/// during a refresh wait for its result instead of fetching again, and
/// the stored value is visible before any waiter proceeds.
pub struct SingleFlightCell<V> {
    ttl: Duration,
    generation: AtomicU64,
    state: tokio::sync::Mutex<Option<Slot<V>>>,
}

impl<V: Clone> SingleFlightCell<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            generation: AtomicU64::new(0),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// The cached value when fresh (and not forced), otherwise the
    /// result of `refresh`. A forced caller that queued behind another
    /// refresh takes that refresh's value rather than stacking its own.
    pub async fn get_or_refresh<F, Fut>(&self, force: bool, refresh: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        let seen = self.generation.load(Ordering::Acquire);
        let mut state = self.state.lock().await;
        if let Some(slot) = state.as_ref() {
            let fresh = slot.written.elapsed() < self.ttl;
            let refreshed_while_waiting = self.generation.load(Ordering::Acquire) != seen;
            if (fresh && !force) || refreshed_while_waiting {
                return Ok(slot.value.clone());
            }
        }
        let value = refresh().await?;
        *state = Some(Slot {
            value: value.clone(),
            written: Instant::now(),
        });
        self.generation.fetch_add(1, Ordering::AcqRel);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test(start_paused = true)]
    async fn ttl_cache_expires_and_bounds() {
        let cache: TtlCache<String, u32> = TtlCache::new(2, Duration::from_secs(300));
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.peek(&"a".to_string()), Some(1));

        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(cache.peek(&"a".to_string()), None);

        cache.insert("a".to_string(), 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("b".to_string(), 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.insert("c".to_string(), 3);
        // the oldest write was evicted to stay within capacity
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.peek(&"a".to_string()), None);
        assert_eq!(cache.peek(&"b".to_string()), Some(2));
        assert_eq!(cache.peek(&"c".to_string()), Some(3));
    }

    #[tokio::test]
    async fn ttl_cache_single_flight() {
        let cache: Arc<TtlCache<String, u32>> =
            Arc::new(TtlCache::new(10, Duration::from_secs(300)));
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch("key".to_string(), move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(7)
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 7);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_cache_does_not_store_failures() {
        let cache: Arc<TtlCache<String, u32>> =
            Arc::new(TtlCache::new(10, Duration::from_secs(300)));

        let result = cache
            .get_or_fetch("key".to_string(), || async {
                Err(Error::Network("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.peek(&"key".to_string()), None);

        // the next call fetches again and succeeds
        let value = cache
            .get_or_fetch("key".to_string(), || async { Ok(9) })
            .await
            .unwrap();
        assert_eq!(value, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn online_cache_returns_false_then_populates() {
        let cache = Arc::new(OnlineStatusCache::new(Duration::from_secs(60)));
        let probes = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let probes = Arc::clone(&probes);
            let online = cache.get("abc", move || async move {
                probes.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            });
            // conservative default while the probe is pending
            assert!(!online);
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert!(cache.get("abc", || async { Ok(false) }));
    }

    #[tokio::test(start_paused = true)]
    async fn single_flight_cell_honors_ttl_and_force() {
        let cell: SingleFlightCell<u32> = SingleFlightCell::new(Duration::from_secs(300));
        let calls = AtomicUsize::new(0);
        let fetch = || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(5) }
        };

        assert_eq!(cell.get_or_refresh(false, fetch).await.unwrap(), 5);
        assert_eq!(cell.get_or_refresh(false, fetch).await.unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        cell.get_or_refresh(false, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        cell.get_or_refresh(true, fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_flight_cell_failure_keeps_stale_value() {
        let cell: SingleFlightCell<u32> = SingleFlightCell::new(Duration::from_secs(300));
        cell.get_or_refresh(false, || async { Ok(1) }).await.unwrap();

        let failed = cell
            .get_or_refresh(true, || async { Err(Error::Network("down".into())) })
            .await;
        assert!(failed.is_err());

        // stale value survives the failed refresh
        let value = cell
            .get_or_refresh(false, || async { Err(Error::Network("down".into())) })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }
}
