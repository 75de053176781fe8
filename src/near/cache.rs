//! Near cache maps: unbounded and LRU-bounded.

use std::collections::HashMap;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::container::LruTracker;
use crate::types::{CacheKey, CacheValue};

/// A value with the server-side version it was read at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedValue<V> {
    pub version: i64,
    pub value: V,
}

impl<V> VersionedValue<V> {
    pub fn new(value: V, version: i64) -> Self {
        Self { version, value }
    }
}

/// Client-side cache of previously fetched values.
///
/// Implementations are internally synchronized. A miss is never an error.
pub trait NearCache<K, V>: Send + Sync {
    fn put(&self, key: K, value: VersionedValue<V>);

    /// Inserts only when no entry exists. Returns true if inserted.
    fn put_if_absent(&self, key: K, value: VersionedValue<V>) -> bool;

    fn remove(&self, key: &K) -> Option<VersionedValue<V>>;

    fn get(&self, key: &K) -> Option<VersionedValue<V>>;

    fn clear(&self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builds the near cache map for a capacity; `None` is unbounded.
pub fn near_cache_for<K: CacheKey, V: CacheValue>(max_entries: Option<usize>) -> Box<dyn NearCache<K, V>> {
    match max_entries {
        Some(capacity) => Box::new(BoundedNearCache::new(capacity)),
        None => Box::new(UnboundedNearCache::new()),
    }
}

// == Unbounded ==
/// Concurrent map without a size limit.
#[derive(Debug)]
pub struct UnboundedNearCache<K, V> {
    entries: RwLock<HashMap<K, VersionedValue<V>>>,
}

impl<K, V> Default for UnboundedNearCache<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: CacheKey, V: CacheValue> UnboundedNearCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<K: CacheKey, V: CacheValue> NearCache<K, V> for UnboundedNearCache<K, V> {
    fn put(&self, key: K, value: VersionedValue<V>) {
        self.entries.write().insert(key, value);
    }

    fn put_if_absent(&self, key: K, value: VersionedValue<V>) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            return false;
        }
        entries.insert(key, value);
        true
    }

    fn remove(&self, key: &K) -> Option<VersionedValue<V>> {
        self.entries.write().remove(key)
    }

    fn get(&self, key: &K) -> Option<VersionedValue<V>> {
        self.entries.read().get(key).cloned()
    }

    fn clear(&self) {
        self.entries.write().clear();
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

// == Bounded ==
#[derive(Debug)]
struct LruMap<K, V> {
    entries: HashMap<K, VersionedValue<V>>,
    lru: LruTracker<K>,
}

/// LRU map that never holds more than `capacity` entries.
///
/// Reads reorder recency, so every operation takes the single lock exclusively.
#[derive(Debug)]
pub struct BoundedNearCache<K, V> {
    inner: Mutex<LruMap<K, V>>,
    capacity: usize,
}

impl<K: CacheKey, V: CacheValue> BoundedNearCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruMap {
                entries: HashMap::new(),
                lru: LruTracker::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn insert(&self, map: &mut LruMap<K, V>, key: K, value: VersionedValue<V>) {
        if !map.entries.contains_key(&key) {
            while map.entries.len() >= self.capacity {
                let Some(oldest) = map.lru.evict_oldest() else {
                    break;
                };
                map.entries.remove(&oldest);
            }
        }
        map.lru.touch(&key);
        map.entries.insert(key, value);
    }
}

impl<K: CacheKey, V: CacheValue> NearCache<K, V> for BoundedNearCache<K, V> {
    fn put(&self, key: K, value: VersionedValue<V>) {
        let mut map = self.inner.lock();
        self.insert(&mut map, key, value);
    }

    fn put_if_absent(&self, key: K, value: VersionedValue<V>) -> bool {
        let mut map = self.inner.lock();
        if map.entries.contains_key(&key) {
            return false;
        }
        self.insert(&mut map, key, value);
        true
    }

    fn remove(&self, key: &K) -> Option<VersionedValue<V>> {
        let mut map = self.inner.lock();
        map.lru.remove(key);
        map.entries.remove(key)
    }

    fn get(&self, key: &K) -> Option<VersionedValue<V>> {
        let mut map = self.inner.lock();
        let found = map.entries.get(key).cloned()?;
        map.lru.touch(key);
        Some(found)
    }

    fn clear(&self) {
        let mut map = self.inner.lock();
        map.entries.clear();
        map.lru.clear();
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }
}
