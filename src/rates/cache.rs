//! Generic time-boxed key→value cache.
//!
//! An entry is valid while `now - stored_at <= ttl`. Expired entries are
//! removed lazily on read and proactively by an optional background sweep,
//! which bounds memory when keys are never read again.
//!
//! The cache is an explicitly constructed instance: callers own it, share
//! it via `Arc`, and own the sweeper's lifecycle through the returned
//! [`SweeperHandle`]. Nothing here is global.
//!
//! Writes are last-writer-wins. Two tasks racing on the same key at most
//! duplicate the work that produced the value; for immutable facts (like a
//! historical exchange rate) both writers store the same value.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

struct CacheEntry<V> {
    value: V,
    stored_at: Instant,
}

/// A string-keyed cache whose entries expire `ttl` after being stored.
pub struct TimedCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TimedCache<V> {
    /// Create a cache whose entries live for `ttl` after each `set`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch a value if present and not expired.
    ///
    /// An expired entry is evicted on the spot and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() <= self.ttl => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value under `key`, stamped with the current time.
    pub fn set(&self, key: impl Into<String>, value: V) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| e.stored_at.elapsed() <= self.ttl);
        before - entries.len()
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send + Sync + 'static> TimedCache<V> {
    /// Start a background task that purges expired entries every `period`.
    ///
    /// The task holds only a `Weak` reference: it stops on its own when the
    /// cache is dropped, and the returned handle aborts it on drop, so the
    /// sweep can never outlive either owner.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> SweeperHandle {
        let weak: Weak<TimedCache<V>> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately; skip it so a fresh cache
            // is not swept before anything is stored.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        let removed = cache.purge_expired();
                        if removed > 0 {
                            debug!("Cache sweep evicted {} expired entries", removed);
                        }
                    }
                    None => break,
                }
            }
        });
        SweeperHandle { task }
    }
}

/// Owner handle for a cache sweep task. Aborts the task on drop.
pub struct SweeperHandle {
    task: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    /// Stop the sweep immediately.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl() {
        let cache = TimedCache::new(Duration::from_secs(60));
        cache.set("CHF,EUR,2024-03-01", 1.04_f64);
        assert_eq!(cache.get("CHF,EUR,2024-03-01"), Some(1.04));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn miss_after_ttl_purges_entry() {
        let cache = TimedCache::new(Duration::from_millis(20));
        cache.set("k", 7_u32);
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0, "expired entry must be evicted on read");
    }

    #[test]
    fn zero_is_a_legitimate_cached_value() {
        let cache = TimedCache::new(Duration::from_secs(60));
        cache.set("k", 0.0_f64);
        assert_eq!(cache.get("k"), Some(0.0));
    }

    #[test]
    fn set_overwrites_and_restamps() {
        let cache = TimedCache::new(Duration::from_millis(50));
        cache.set("k", 1_u8);
        std::thread::sleep(Duration::from_millis(30));
        cache.set("k", 2_u8);
        std::thread::sleep(Duration::from_millis(30));
        // 60 ms after the first set but only 30 ms after the second.
        assert_eq!(cache.get("k"), Some(2));
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = TimedCache::new(Duration::from_millis(25));
        cache.set("old", 1_u8);
        std::thread::sleep(Duration::from_millis(40));
        cache.set("fresh", 2_u8);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get("fresh"), Some(2));
        assert_eq!(cache.get("old"), None);
    }

    #[tokio::test]
    async fn sweeper_evicts_without_reads() {
        let cache = Arc::new(TimedCache::new(Duration::from_millis(10)));
        cache.set("k", 1_u8);
        let handle = cache.spawn_sweeper(Duration::from_millis(15));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.len(), 0, "sweep must evict independently of reads");
        handle.stop();
    }

    #[tokio::test]
    async fn sweeper_stops_when_cache_dropped() {
        let cache = Arc::new(TimedCache::<u8>::new(Duration::from_millis(10)));
        let handle = cache.spawn_sweeper(Duration::from_millis(10));
        drop(cache);
        tokio::time::sleep(Duration::from_millis(40)).await;
        // The task exits on its own once the weak upgrade fails.
        assert!(handle.task.is_finished());
    }
}
