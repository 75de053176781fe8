//! Read-only store decorator: reads pass through, mutations are dropped.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::trace;

use crate::error::Result;
use crate::store::{ensure_store_started, CacheEntry, CacheStore, StoreContext, StoreState};
use crate::types::{CacheKey, CacheValue};

/// Wraps a store so that nothing is ever written to it.
///
/// Rejected mutations succeed without effect; `remove` reports `false`.
pub struct ReadOnlyStore<K, V> {
    name: String,
    delegate: Arc<dyn CacheStore<K, V>>,
}

impl<K: CacheKey, V: CacheValue> ReadOnlyStore<K, V> {
    pub fn new(delegate: Arc<dyn CacheStore<K, V>>) -> Self {
        Self {
            name: format!("read-only({})", delegate.name()),
            delegate,
        }
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for ReadOnlyStore<K, V> {
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
        ensure_store_started(self, "store")?;
        trace!("Read-only store {} ignores store of {:?}", self.name, entry.key);
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<bool> {
        ensure_store_started(self, "remove")?;
        trace!("Read-only store {} ignores remove of {:?}", self.name, key);
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
        ensure_store_started(self, "clear")
    }

    fn purge_expired(&self) -> Result<usize> {
        ensure_store_started(self, "purge_expired")?;
        Ok(0)
    }

    fn size(&self) -> Result<usize> {
        self.delegate.size()
    }
}
