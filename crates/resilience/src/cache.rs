//! Time-bounded memoization store.
//!
//! Entries expire based on age since write, independent of how often they are
//! read. The TTL is supplied per read, so one cache can serve callers with
//! different freshness needs. Expired entries are evicted lazily by the read
//! that notices them, and eagerly by [`TtlCache::sweep`] for keys nobody reads
//! again.
//!
//! Backed by process memory: fine for a single instance, but every replica of
//! a horizontally scaled deployment would keep its own copy.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock, elapsed};
use crate::lock;

/// A cached payload and the instant it was written.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: JsonValue,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to serialize cache value for {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    stats: CacheStats,
}

/// In-memory TTL cache keyed by opaque strings.
pub struct TtlCache {
    name: String,
    clock: Arc<dyn Clock>,
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for TtlCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl TtlCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read `key` if it was written no more than `ttl` ago.
    ///
    /// A stale entry, or one whose payload no longer decodes as `T`, is a miss
    /// and is removed.
    pub fn get<T: DeserializeOwned>(&self, key: &str, ttl: Duration) -> Option<T> {
        let now = self.clock.now();
        let mut state = lock(&self.state);

        let Some(entry) = state.entries.get(key) else {
            state.stats.misses += 1;
            return None;
        };

        if elapsed(entry.created_at, now) > ttl {
            state.entries.remove(key);
            state.stats.evictions += 1;
            state.stats.misses += 1;
            debug!(cache = %self.name, key, "evicted expired entry");
            return None;
        }

        match serde_json::from_value::<T>(entry.value.clone()) {
            Ok(value) => {
                state.stats.hits += 1;
                Some(value)
            }
            Err(e) => {
                state.entries.remove(key);
                state.stats.evictions += 1;
                state.stats.misses += 1;
                warn!(cache = %self.name, key, error = %e, "dropping undecodable cache entry");
                None
            }
        }
    }

    /// Store `value` under `key`, stamped with the current time.
    pub fn set<T: Serialize + ?Sized>(&self, key: impl Into<String>, value: &T) -> Result<(), CacheError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|source| CacheError::Serialize {
            key: key.clone(),
            source,
        })?;
        let entry = CacheEntry {
            value,
            created_at: self.clock.now(),
        };
        lock(&self.state).entries.insert(key, entry);
        Ok(())
    }

    /// Return the cached value, or run `fetch` on a genuine miss and cache its
    /// success. Errors from `fetch` are returned and never cached.
    pub async fn get_or_insert_with<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(hit) = self.get(key, ttl) {
            return Ok(hit);
        }

        let value = fetch().await?;
        if let Err(e) = self.set(key, &value) {
            warn!(cache = %self.name, error = %e, "failed to cache fetched value");
        }
        Ok(value)
    }

    pub fn remove(&self, key: &str) -> Option<CacheEntry> {
        lock(&self.state).entries.remove(key)
    }

    /// Whether an entry is physically stored, regardless of age.
    pub fn contains_key(&self, key: &str) -> bool {
        lock(&self.state).entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.state).entries.clear();
    }

    /// Purge every entry older than `retention`. Returns how many were removed.
    pub fn sweep(&self, retention: Duration) -> usize {
        let now = self.clock.now();
        let mut state = lock(&self.state);

        let before = state.entries.len();
        state
            .entries
            .retain(|_, entry| elapsed(entry.created_at, now) <= retention);
        let removed = before - state.entries.len();
        state.stats.evictions += removed as u64;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            size: state.entries.len(),
            ..state.stats
        }
    }

    /// Run [`sweep`](Self::sweep) every `interval` on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, retention: Duration) -> SweeperHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let name = self.name.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.sweep(retention);
                if removed > 0 {
                    info!(cache = %name, removed, "swept expired cache entries");
                }
            }
            debug!(cache = %name, "cache sweeper stopped");
        });

        SweeperHandle { join }
    }
}

/// Handle for the background sweep task.
#[derive(Debug)]
pub struct SweeperHandle {
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweeper.
    pub fn shutdown(self) {
        self.join.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde::Deserialize;

    use super::*;
    use crate::clock::ManualClock;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Insight {
        summary: String,
        score: f64,
    }

    fn cache() -> (TtlCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::starting_now());
        (TtlCache::with_clock("ai-analysis", clock.clone()), clock)
    }

    fn insight() -> Insight {
        Insight {
            summary: "margin compressing".into(),
            score: 0.42,
        }
    }

    #[test]
    fn hit_before_ttl_then_miss_and_evict_after() {
        let (cache, clock) = cache();
        let ttl = Duration::from_secs(3600);
        cache.set("t1:margin", &insight()).unwrap();

        clock.advance(Duration::from_secs(3599));
        assert_eq!(cache.get::<Insight>("t1:margin", ttl), Some(insight()));

        // Exactly at the TTL the entry is still fresh.
        clock.advance(Duration::from_secs(1));
        assert!(cache.get::<Insight>("t1:margin", ttl).is_some());

        clock.advance(Duration::from_secs(1));
        assert_eq!(cache.get::<Insight>("t1:margin", ttl), None);
        assert!(!cache.contains_key("t1:margin"));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.evictions, stats.size), (2, 1, 1, 0));
    }

    #[test]
    fn ttl_is_chosen_per_read() {
        let (cache, clock) = cache();
        cache.set("k", &1u32).unwrap();
        clock.advance(Duration::from_secs(120));

        assert_eq!(cache.get::<u32>("k", Duration::from_secs(300)), Some(1));
        assert_eq!(cache.get::<u32>("k", Duration::from_secs(60)), None);
        // The short-TTL read evicted it for everyone.
        assert_eq!(cache.get::<u32>("k", Duration::from_secs(300)), None);
    }

    #[test]
    fn overwrite_restarts_the_clock() {
        let (cache, clock) = cache();
        cache.set("k", &1u32).unwrap();
        clock.advance(Duration::from_secs(50));
        cache.set("k", &2u32).unwrap();
        clock.advance(Duration::from_secs(50));

        assert_eq!(cache.get::<u32>("k", Duration::from_secs(60)), Some(2));
    }

    #[test]
    fn undecodable_payload_is_a_miss() {
        let (cache, _clock) = cache();
        cache.set("k", "not an insight").unwrap();

        assert_eq!(cache.get::<Insight>("k", Duration::from_secs(60)), None);
        assert!(!cache.contains_key("k"));
    }

    #[test]
    fn sweep_purges_entries_past_retention() {
        let (cache, clock) = cache();
        cache.set("old", &1u32).unwrap();
        clock.advance(Duration::from_secs(7200));
        cache.set("new", &2u32).unwrap();
        clock.advance(Duration::from_secs(10));

        assert_eq!(cache.sweep(Duration::from_secs(3600)), 1);
        assert!(!cache.contains_key("old"));
        assert!(cache.contains_key("new"));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn get_or_insert_with_only_fetches_on_miss() {
        let (cache, clock) = cache();
        let calls = AtomicU32::new(0);
        let ttl = Duration::from_secs(60);

        for _ in 0..3 {
            let value: Result<Insight, String> = cache
                .get_or_insert_with("k", ttl, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(insight())
                })
                .await;
            assert_eq!(value.unwrap(), insight());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(61));
        let _: Result<Insight, String> = cache
            .get_or_insert_with("k", ttl, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(insight())
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_errors_are_not_cached() {
        let (cache, _clock) = cache();

        let err: Result<Insight, &str> = cache
            .get_or_insert_with("k", Duration::from_secs(60), || async { Err("llm down") })
            .await;
        assert_eq!(err.unwrap_err(), "llm down");
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_purges_and_stops_with_the_cache() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache = Arc::new(TtlCache::with_clock("sweep", clock.clone()));
        cache.set("k", &1u32).unwrap();

        let handle = cache.spawn_sweeper(Duration::from_secs(60), Duration::from_secs(600));
        clock.advance(Duration::from_secs(601));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(cache.is_empty());

        drop(cache);
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(handle.is_finished());
    }
}
