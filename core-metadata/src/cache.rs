//! Resolved-query cache
//!
//! Bounded LRU with time-based expiry. Both hits and misses are cached so a
//! catalog that does not know a song is not asked again until the entry
//! goes stale.

use crate::types::MetadataQueryResult;
use bridge_traits::time::Clock;
use chrono::Duration as ChronoDuration;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

pub struct MetadataCache {
    entries: Mutex<LruCache<String, MetadataQueryResult>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MetadataCache {
    pub fn new(capacity: usize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            clock,
        }
    }

    /// Fresh entry for `key`. Expired entries are dropped on access.
    pub async fn get(&self, key: &str) -> Option<MetadataQueryResult> {
        let mut entries = self.entries.lock().await;
        let fresh = match entries.get(key) {
            Some(entry) => self.is_fresh(entry),
            None => return None,
        };
        if fresh {
            entries.get(key).cloned()
        } else {
            trace!(key = key, "Metadata cache entry expired");
            entries.pop(key);
            None
        }
    }

    pub async fn insert(&self, result: MetadataQueryResult) {
        self.entries.lock().await.put(result.key.clone(), result);
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.entries.lock().await.pop(key).is_some()
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn is_fresh(&self, entry: &MetadataQueryResult) -> bool {
        let expiry = ChronoDuration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| entry.fetched_at.checked_add_signed(ttl));
        match expiry {
            Some(expires_at) => self.clock.now() < expires_at,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex as StdMutex;

    struct ManualClock(StdMutex<DateTime<Utc>>);

    impl ManualClock {
        fn advance(&self, by: ChronoDuration) {
            let mut now = self.0.lock().unwrap();
            *now += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn entry(key: &str, at: DateTime<Utc>) -> MetadataQueryResult {
        MetadataQueryResult::not_found(key.to_string(), at)
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock(StdMutex::new(start)));
        let cache = MetadataCache::new(8, Duration::from_secs(60), clock.clone());

        cache.insert(entry("k", start)).await;
        clock.advance(ChronoDuration::seconds(59));
        assert!(cache.get("k").await.is_some());

        clock.advance(ChronoDuration::seconds(1));
        assert!(cache.get("k").await.is_none());
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_capacity_evicts_least_recent() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock(StdMutex::new(now)));
        let cache = MetadataCache::new(2, Duration::from_secs(60), clock);

        cache.insert(entry("a", now)).await;
        cache.insert(entry("b", now)).await;
        cache.get("a").await;
        cache.insert(entry("c", now)).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let now = Utc::now();
        let clock = Arc::new(ManualClock(StdMutex::new(now)));
        let cache = MetadataCache::new(4, Duration::from_secs(60), clock);

        cache.insert(entry("a", now)).await;
        cache.insert(entry("b", now)).await;

        assert!(cache.invalidate("a").await);
        assert!(!cache.invalidate("a").await);
        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
