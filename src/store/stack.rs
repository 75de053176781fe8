//! Ordered composition of store decorators.
//!
//! Stages wrap the core store one after another, in list order. The canonical
//! order built from configuration is raw → async → read-only → singleton.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::config::PersistenceConfig;
use crate::store::{AsyncStore, CacheStore, ReadOnlyStore, SingletonStore};
use crate::topology::{Address, MembershipView};
use crate::types::{CacheKey, CacheValue};

/// One decorator applied around the store built so far.
#[derive(Debug, Clone)]
pub enum StoreStage {
    /// Write-behind with a bounded modification queue
    Async { queue_size: usize },
    /// Drop every mutation
    ReadOnly,
    /// Persist only on the cluster coordinator
    Singleton {
        local: Address,
        topology: watch::Receiver<Arc<MembershipView>>,
    },
}

// == Store Stack ==
/// Builder applying `StoreStage`s around a core store.
pub struct StoreStack<K, V> {
    core: Arc<dyn CacheStore<K, V>>,
    stages: Vec<StoreStage>,
}

impl<K: CacheKey, V: CacheValue> StoreStack<K, V> {
    pub fn new(core: Arc<dyn CacheStore<K, V>>) -> Self {
        Self {
            core,
            stages: Vec::new(),
        }
    }

    /// Appends a stage; it will wrap every stage added before it.
    pub fn with(mut self, stage: StoreStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stages implied by a persistence configuration, in canonical order.
    pub fn from_config(
        core: Arc<dyn CacheStore<K, V>>,
        config: &PersistenceConfig,
        local: &Address,
        topology: &watch::Receiver<Arc<MembershipView>>,
    ) -> Self {
        let mut stack = Self::new(core);
        if config.async_store {
            stack = stack.with(StoreStage::Async {
                queue_size: config.async_queue_size,
            });
        }
        if config.ignore_modifications {
            stack = stack.with(StoreStage::ReadOnly);
        }
        if config.singleton {
            stack = stack.with(StoreStage::Singleton {
                local: local.clone(),
                topology: topology.clone(),
            });
        }
        stack
    }

    pub fn stages(&self) -> &[StoreStage] {
        &self.stages
    }

    // == Build ==
    /// Applies the stages in order and returns the outermost store.
    pub fn build(self) -> Arc<dyn CacheStore<K, V>> {
        let store = self
            .stages
            .into_iter()
            .fold(self.core, |store, stage| -> Arc<dyn CacheStore<K, V>> {
                match stage {
                    StoreStage::Async { queue_size } => Arc::new(AsyncStore::new(store, queue_size)),
                    StoreStage::ReadOnly => Arc::new(ReadOnlyStore::new(store)),
                    StoreStage::Singleton { local, topology } => {
                        Arc::new(SingletonStore::new(store, local, topology))
                    }
                }
            });
        debug!("Built store stack {}", store.name());
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CacheEntry, InMemoryStore};
    use crate::topology::TopologyManager;

    #[test]
    fn test_stages_wrap_in_order() {
        let core: Arc<dyn CacheStore<u64, String>> = Arc::new(InMemoryStore::new("raw"));
        let store = StoreStack::new(core)
            .with(StoreStage::Async { queue_size: 8 })
            .with(StoreStage::ReadOnly)
            .build();
        assert_eq!(store.name(), "read-only(async(raw))");
    }

    #[test]
    fn test_from_config_canonical_order() {
        let local = Address::new("a").unwrap();
        let topology = TopologyManager::with_members(vec![local.clone()], 8);
        let config = PersistenceConfig {
            async_store: true,
            ignore_modifications: true,
            singleton: true,
            ..PersistenceConfig::default()
        };
        let core: Arc<dyn CacheStore<u64, String>> = Arc::new(InMemoryStore::new("raw"));
        let store = StoreStack::from_config(core, &config, &local, &topology.subscribe()).build();
        assert_eq!(store.name(), "singleton(read-only(async(raw)))");
    }

    #[test]
    fn test_empty_stack_is_core() {
        let raw = Arc::new(InMemoryStore::<u64, String>::new("raw"));
        let store = StoreStack::new(raw.clone() as Arc<dyn CacheStore<u64, String>>).build();
        store.start().unwrap();
        store.store(CacheEntry::new(1, "v".to_string())).unwrap();
        assert_eq!(raw.raw_len(), 1);
    }
}
