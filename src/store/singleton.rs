//! Singleton store decorator.
//!
//! In a cluster sharing one physical store only the coordinator (oldest
//! member of the current view) writes; every other node drops its writes so
//! the store is not updated `num_owners` times per modification.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

use crate::error::Result;
use crate::store::{ensure_store_started, CacheEntry, CacheStore, StoreContext, StoreState};
use crate::topology::{Address, MembershipView};
use crate::types::{CacheKey, CacheValue};

/// Persists only while the local node is the cluster coordinator.
pub struct SingletonStore<K, V> {
    name: String,
    delegate: Arc<dyn CacheStore<K, V>>,
    local: Address,
    topology: watch::Receiver<Arc<MembershipView>>,
}

impl<K: CacheKey, V: CacheValue> SingletonStore<K, V> {
    pub fn new(
        delegate: Arc<dyn CacheStore<K, V>>,
        local: Address,
        topology: watch::Receiver<Arc<MembershipView>>,
    ) -> Self {
        Self {
            name: format!("singleton({})", delegate.name()),
            delegate,
            local,
            topology,
        }
    }

    /// True when the local node is the coordinator of the latest view.
    pub fn is_coordinator(&self) -> bool {
        self.topology.borrow().coordinator() == Some(&self.local)
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for SingletonStore<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StoreContext) -> Result<()> {
        self.delegate.init(ctx)
    }

    fn start(&self) -> Result<()> {
        self.delegate.start()
    }

    fn stop(&self) -> Result<()> {
        self.delegate.stop()
    }

    fn state(&self) -> StoreState {
        self.delegate.state()
    }

    fn load(&self, key: &K) -> Result<Option<CacheEntry<K, V>>> {
        self.delegate.load(key)
    }

    fn store(&self, entry: CacheEntry<K, V>) -> Result<()> {
        if self.is_coordinator() {
            return self.delegate.store(entry);
        }
        ensure_store_started(self, "store")?;
        trace!("{} is not coordinator, skipping store of {:?}", self.local, entry.key);
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<bool> {
        if self.is_coordinator() {
            return self.delegate.remove(key);
        }
        ensure_store_started(self, "remove")?;
        Ok(false)
    }

    fn load_all(&self) -> Result<Vec<CacheEntry<K, V>>> {
        self.delegate.load_all()
    }

    fn load_some(&self, limit: usize) -> Result<Vec<CacheEntry<K, V>>> {
        self.delegate.load_some(limit)
    }

    fn load_all_keys(&self, excluding: &HashSet<K>) -> Result<HashSet<K>> {
        self.delegate.load_all_keys(excluding)
    }

    fn clear(&self) -> Result<()> {
        if self.is_coordinator() {
            return self.delegate.clear();
        }
        ensure_store_started(self, "clear")
    }

    fn purge_expired(&self) -> Result<usize> {
        if self.is_coordinator() {
            return self.delegate.purge_expired();
        }
        ensure_store_started(self, "purge_expired")?;
        Ok(0)
    }

    fn size(&self) -> Result<usize> {
        self.delegate.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, StoreRegistry};
    use crate::topology::TopologyManager;

    #[test]
    fn test_only_coordinator_writes() {
        let a = Address::new("a").unwrap();
        let b = Address::new("b").unwrap();
        let topology = TopologyManager::with_members(vec![a.clone(), b.clone()], 16);
        let registry = StoreRegistry::new();

        let raw_a: Arc<dyn CacheStore<String, String>> =
            Arc::new(InMemoryStore::shared("shared", &registry).unwrap());
        let raw_b: Arc<dyn CacheStore<String, String>> =
            Arc::new(InMemoryStore::shared("shared", &registry).unwrap());
        let on_a = SingletonStore::new(raw_a, a.clone(), topology.subscribe());
        let on_b = SingletonStore::new(raw_b, b.clone(), topology.subscribe());
        on_a.start().unwrap();
        on_b.start().unwrap();

        assert!(on_a.is_coordinator());
        assert!(!on_b.is_coordinator());

        on_b.store(CacheEntry::new("k".to_string(), "from-b".to_string()))
            .unwrap();
        assert!(on_a.load(&"k".to_string()).unwrap().is_none());

        on_a.store(CacheEntry::new("k".to_string(), "from-a".to_string()))
            .unwrap();
        assert_eq!(on_b.load(&"k".to_string()).unwrap().unwrap().value, "from-a");

        // coordinator leaves, b takes over
        topology.leave(&a);
        assert!(on_b.is_coordinator());
        assert!(on_b.remove(&"k".to_string()).unwrap());
    }
}
