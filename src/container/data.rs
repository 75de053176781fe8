//! Data Container Module
//!
//! In-memory entry map with LRU eviction and expiry handling. The container is
//! not synchronized; owners wrap it in a lock.

use std::collections::HashMap;

use crate::container::{ContainerStats, LruTracker};
use crate::store::{current_timestamp_ms, CacheEntry};
use crate::types::{CacheKey, CacheValue};

// == Data Container ==
/// In-memory entries of one cache on one node.
#[derive(Debug)]
pub struct DataContainer<K, V> {
    entries: HashMap<K, CacheEntry<K, V>>,
    lru: LruTracker<K>,
    stats: ContainerStats,
    /// None means unbounded
    max_entries: Option<usize>,
}

impl<K: CacheKey, V: CacheValue> DataContainer<K, V> {
    // == Constructor ==
    /// Creates a container holding at most `max_entries` entries.
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            entries: HashMap::new(),
            lru: LruTracker::new(),
            stats: ContainerStats::new(),
            max_entries,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn capacity(&self) -> Option<usize> {
        self.max_entries
    }

    // == Get ==
    /// Returns a live entry and refreshes its recency and idle time.
    ///
    /// An expired entry is removed and counted as a miss.
    pub fn get(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        let now = current_timestamp_ms();
        match self.entries.get_mut(key) {
            Some(entry) if entry.is_expired_at(now) => {
                self.entries.remove(key);
                self.lru.remove(key);
                self.stats.record_miss();
                None
            }
            Some(entry) => {
                entry.metadata.touch();
                let found = entry.clone();
                self.lru.touch(key);
                self.stats.record_hit();
                Some(found)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Returns a live entry without touching statistics or recency.
    pub fn peek(&self, key: &K) -> Option<&CacheEntry<K, V>> {
        self.entries.get(key).filter(|entry| !entry.is_expired())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.peek(key).is_some()
    }

    // == Put ==
    /// Inserts or replaces an entry.
    ///
    /// Returns the entries evicted to stay within capacity, oldest first.
    pub fn put(&mut self, entry: CacheEntry<K, V>) -> Vec<CacheEntry<K, V>> {
        let key = entry.key.clone();
        let mut evicted = Vec::new();

        if !self.entries.contains_key(&key) {
            if let Some(max) = self.max_entries {
                while self.entries.len() >= max {
                    let Some(oldest) = self.lru.evict_oldest() else {
                        break;
                    };
                    if let Some(old) = self.entries.remove(&oldest) {
                        self.stats.record_eviction();
                        evicted.push(old);
                    }
                }
            }
        }

        self.entries.insert(key.clone(), entry);
        self.lru.touch(&key);
        self.stats.record_store();
        evicted
    }

    // == Remove ==
    pub fn remove(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        let removed = self.entries.remove(key)?;
        self.lru.remove(key);
        Some(removed)
    }

    /// Removes an entry on request, counting it as an eviction.
    pub fn evict(&mut self, key: &K) -> Option<CacheEntry<K, V>> {
        let evicted = self.remove(key)?;
        self.stats.record_eviction();
        Some(evicted)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.lru.clear();
    }

    // == Cleanup Expired ==
    /// Removes all expired entries, returning how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = current_timestamp_ms();
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            self.entries.remove(key);
            self.lru.remove(key);
        }
        expired.len()
    }

    /// Keys of all live entries.
    pub fn keys(&self) -> Vec<K> {
        let now = current_timestamp_ms();
        self.entries
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.key.clone())
            .collect()
    }

    /// Clones of all live entries.
    pub fn entries(&self) -> Vec<CacheEntry<K, V>> {
        let now = current_timestamp_ms();
        self.entries
            .values()
            .filter(|entry| !entry.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record_passivation(&mut self) {
        self.stats.record_passivation();
    }

    pub fn record_activation(&mut self) {
        self.stats.record_activation();
    }

    // == Stats ==
    pub fn stats(&self) -> ContainerStats {
        let mut stats = self.stats.clone();
        stats.set_total_entries(self.entries.len());
        stats
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Metadata;
    use std::thread::sleep;
    use std::time::Duration;

    fn entry(key: &str, value: &str) -> CacheEntry<String, String> {
        CacheEntry::new(key.to_string(), value.to_string())
    }

    #[test]
    fn test_put_and_get() {
        let mut container = DataContainer::unbounded();
        assert!(container.put(entry("k1", "v1")).is_empty());

        assert_eq!(container.get(&"k1".to_string()).unwrap().value, "v1");
        assert_eq!(container.len(), 1);
        assert_eq!(container.stats().hits, 1);
    }

    #[test]
    fn test_get_missing_counts_miss() {
        let mut container: DataContainer<String, String> = DataContainer::unbounded();
        assert!(container.get(&"nope".to_string()).is_none());
        assert_eq!(container.stats().misses, 1);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let mut container = DataContainer::new(Some(1));
        container.put(entry("k1", "v1"));
        assert!(container.put(entry("k1", "v2")).is_empty());
        assert_eq!(container.get(&"k1".to_string()).unwrap().value, "v2");
    }

    #[test]
    fn test_lru_eviction_returns_evicted() {
        let mut container = DataContainer::new(Some(2));
        container.put(entry("k1", "v1"));
        container.put(entry("k2", "v2"));
        container.get(&"k1".to_string());

        let evicted = container.put(entry("k3", "v3"));

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "k2");
        assert_eq!(container.len(), 2);
        assert!(container.contains(&"k1".to_string()));
        assert!(container.contains(&"k3".to_string()));
        assert_eq!(container.stats().evictions, 1);
    }

    #[test]
    fn test_expired_entry_removed_on_read() {
        let mut container = DataContainer::unbounded();
        container.put(CacheEntry::with_metadata(
            "k".to_string(),
            "v".to_string(),
            Metadata::with_lifespan(Duration::from_millis(20)),
        ));

        sleep(Duration::from_millis(40));

        assert!(container.get(&"k".to_string()).is_none());
        assert!(container.is_empty());
        assert_eq!(container.stats().misses, 1);
    }

    #[test]
    fn test_max_idle_refreshed_by_access() {
        let mut container = DataContainer::unbounded();
        container.put(CacheEntry::with_metadata(
            "k".to_string(),
            "v".to_string(),
            Metadata::new(None, Some(Duration::from_millis(150))),
        ));

        for _ in 0..4 {
            sleep(Duration::from_millis(60));
            assert!(container.get(&"k".to_string()).is_some());
        }
    }

    #[test]
    fn test_purge_expired_keeps_live() {
        let mut container = DataContainer::unbounded();
        container.put(entry("live", "v"));
        container.put(CacheEntry::with_metadata(
            "dead".to_string(),
            "v".to_string(),
            Metadata::with_lifespan(Duration::from_millis(10)),
        ));

        sleep(Duration::from_millis(30));

        assert_eq!(container.purge_expired(), 1);
        assert_eq!(container.keys(), vec!["live".to_string()]);
    }

    #[test]
    fn test_evict_counts_eviction() {
        let mut container = DataContainer::unbounded();
        container.put(entry("k", "v"));
        assert!(container.evict(&"k".to_string()).is_some());
        assert!(container.evict(&"k".to_string()).is_none());
        assert_eq!(container.stats().evictions, 1);
    }

    #[test]
    fn test_clear() {
        let mut container = DataContainer::new(Some(10));
        container.put(entry("a", "1"));
        container.put(entry("b", "2"));
        container.clear();
        assert!(container.is_empty());
        assert_eq!(container.stats().total_entries, 0);
    }
}
