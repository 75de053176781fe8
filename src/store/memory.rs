//! In-memory cache store.
//!
//! Keeps entries in a map guarded by a `parking_lot::RwLock`. Instances created
//! through a `StoreRegistry` under the same name share one map, which is how
//! several nodes are given a single shared store.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::error::{CacheError, Result};
use crate::store::entry::current_timestamp_ms;
use crate::store::{
    CacheEntry, CacheStore, StoreContext, StoreLifecycle, StoreOp, StoreRegistry, StoreState,
    StoreStats,
};
use crate::types::{CacheKey, CacheValue};

/// Entries and counters of one (possibly shared) in-memory store.
#[derive(Debug)]
pub struct SharedStoreData<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<K, V>>>,
    stats: StoreStats,
}

impl<K, V> Default for SharedStoreData<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            stats: StoreStats::new(),
        }
    }
}

// == In-Memory Store ==
/// Map-backed `CacheStore`.
#[derive(Debug)]
pub struct InMemoryStore<K, V> {
    name: String,
    data: Arc<SharedStoreData<K, V>>,
    lifecycle: StoreLifecycle,
    available: AtomicBool,
}

impl<K: CacheKey, V: CacheValue> InMemoryStore<K, V> {
    /// Creates a private store.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_data(name.into(), Arc::new(SharedStoreData::default()))
    }

    /// Creates a store backed by the registry entry `name`, creating it on first use.
    pub fn shared(name: impl Into<String>, registry: &StoreRegistry) -> Result<Self> {
        let name = name.into();
        let data = registry.get_or_create::<SharedStoreData<K, V>>(&name)?;
        Ok(Self::with_data(name, data))
    }

    fn with_data(name: String, data: Arc<SharedStoreData<K, V>>) -> Self {
        Self {
            lifecycle: StoreLifecycle::new(name.clone()),
            name,
            data,
            available: AtomicBool::new(true),
        }
    }

    /// Simulates an unreachable backend: every operation fails with
    /// `StoreUnavailable` until availability is restored.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn stats(&self) -> &StoreStats {
        &self.data.stats
    }

    /// Number of raw entries, expired ones included.
    pub fn raw_len(&self) -> usize {
        self.data.entries.read().len()
    }

    fn check(&self, operation: &str) -> Result<()> {
        self.lifecycle.ensure_started(operation)?;
        if !self.available.load(Ordering::SeqCst) {
            return Err(CacheError::StoreUnavailable(format!(
                "{} on store {}",
                operation, self.name
            )));
        }
        Ok(())
    }

    /// Collects up to `limit` live entries and evicts expired ones.
    fn collect_live(&self, limit: Option<usize>) -> Vec<CacheEntry<K, V>> {
        let now = current_timestamp_ms();
        let mut expired = Vec::new();
        let mut live = Vec::new();
        {
            let entries = self.data.entries.read();
            for (key, entry) in entries.iter() {
                if entry.is_expired_at(now) {
                    expired.push(key.clone());
                } else if limit.map_or(true, |l| live.len() < l) {
                    live.push(entry.clone());
                }
            }
        }
        if !expired.is_empty() {
            let mut entries = self.data.entries.write();
            for key in expired {
                if entries.get(&key).is_some_and(|e| e.is_expired_at(now)) {
                    entries.remove(&key);
                }
            }
        }
        live
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for InMemoryStore<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StoreContext) -> Result<()> {
        self.data.stats.record(StoreOp::Init);
        debug!(
            "Initialized in-memory store {} for cache {} (shared={})",
            self.name, ctx.cache_name, ctx.shared
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.lifecycle.start(|| {
            self.data.stats.record(StoreOp::Start);
            debug!("Started in-memory store {}", self.name);
            Ok(())
        })
    }

    fn stop(&self) -> Result<()> {
        self.lifecycle.stop(|| {
            debug!("Stopped in-memory store {}", self.name);
            Ok(())
        })
    }

    fn state(&self) -> StoreState {
        self.lifecycle.state()
    }

    fn load(&self, key: &K) -> Result<Option<CacheEntry<K, V>>> {
        self.check("load")?;
        self.data.stats.record(StoreOp::Load);

        let found = self.data.entries.read().get(key).cloned();
        match found {
            Some(entry) if entry.is_expired() => {
                trace!("Entry {:?} in store {} expired on load", key, self.name);
                let mut entries = self.data.entries.write();
                if entries.get(key).is_some_and(|e| e.is_expired()) {
                    entries.remove(key);
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn store(&self, entry: CacheEntry<K, V>) -> Result<()> {
        self.check("store")?;
        self.data.stats.record(StoreOp::Write);
        trace!("Store {:?} in store {}", entry.key, self.name);
        self.data.entries.write().insert(entry.key.clone(), entry);
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<bool> {
        self.check("remove")?;
        self.data.stats.record(StoreOp::Delete);
        Ok(self.data.entries.write().remove(key).is_some())
    }

    fn load_all(&self) -> Result<Vec<CacheEntry<K, V>>> {
        self.check("load_all")?;
        self.data.stats.record(StoreOp::LoadAll);
        Ok(self.collect_live(None))
    }

    fn load_some(&self, limit: usize) -> Result<Vec<CacheEntry<K, V>>> {
        self.check("load_some")?;
        self.data.stats.record(StoreOp::LoadAll);
        Ok(self.collect_live(Some(limit)))
    }

    fn load_all_keys(&self, excluding: &HashSet<K>) -> Result<HashSet<K>> {
        self.check("load_all_keys")?;
        self.data.stats.record(StoreOp::LoadAll);
        Ok(self
            .collect_live(None)
            .into_iter()
            .map(|e| e.key)
            .filter(|k| !excluding.contains(k))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.check("clear")?;
        self.data.stats.record(StoreOp::Clear);
        self.data.entries.write().clear();
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize> {
        self.check("purge_expired")?;
        self.data.stats.record(StoreOp::PurgeExpired);
        let now = current_timestamp_ms();
        let mut entries = self.data.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired_at(now));
        Ok(before - entries.len())
    }
}
