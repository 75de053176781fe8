//! Cache Manager
//!
//! Per-node owner of caches, their stores, global state and cluster
//! membership. Nodes of one process share a `LocalCluster`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::affinity::{KeyAffinityService, KeyGenerator};
use crate::config::Config;
use crate::coordinator::{ClusterContext, ClusteredCache, Transport};
use crate::error::{CacheError, Result};
use crate::global_state::{GlobalStateManager, GlobalStateProvider, ScopedPersistentState};
use crate::near::{EventChannel, RemoteCacheFacade};
use crate::store::{CacheStore, FileStore, InMemoryStore, StoreRegistry, StoreStack};
use crate::tasks::{spawn_purge_task, CacheMap};
use crate::topology::{Address, TopologyManager};
use crate::types::{CacheKey, CacheValue};

// == Local Cluster ==
/// Membership, shared stores and per-cache channels of an in-process cluster.
pub struct LocalCluster<K, V> {
    topology: TopologyManager,
    registry: StoreRegistry,
    channels: Mutex<HashMap<String, (Arc<Transport<K, V>>, Arc<EventChannel<K, V>>)>>,
}

impl<K: CacheKey, V: CacheValue> LocalCluster<K, V> {
    pub fn new(num_segments: u32) -> Arc<Self> {
        Arc::new(Self {
            topology: TopologyManager::new(num_segments),
            registry: StoreRegistry::new(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    /// Transport and event channel of cache `name`, created on first use.
    pub fn channels(&self, name: &str) -> (Arc<Transport<K, V>>, Arc<EventChannel<K, V>>) {
        self.channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| (Arc::new(Transport::new()), Arc::new(EventChannel::new())))
            .clone()
    }
}

/// Backing store of a cache.
#[derive(Debug, Clone)]
pub enum StoreKind {
    None,
    /// Private in-memory store
    Memory,
    /// In-memory store shared by every node defining the same cache
    SharedMemory,
    /// JSON file store at the given path
    File(PathBuf),
}

/// Records node identity and membership in the global scope.
struct NodeStateProvider {
    local: Address,
    topology: TopologyManager,
}

impl GlobalStateProvider for NodeStateProvider {
    fn prepare_for_persist(&self, state: &mut ScopedPersistentState) {
        let view = self.topology.current();
        let members: Vec<&str> = view.members().iter().map(|m| m.name()).collect();
        state.set_property("node.address", self.local.name());
        state.set_int_property("topology.id", view.topology_id() as i64);
        state.set_property("topology.members", members.join(","));
    }

    fn prepare_for_restore(&self, state: &ScopedPersistentState) {
        match state.property("node.address") {
            Some(previous) if previous == self.local.name() => info!(
                "Node {} restarting, last seen in topology {}",
                previous,
                state.property("topology.id").unwrap_or("?")
            ),
            Some(previous) => warn!(
                "Global state belongs to node {}, now starting as {}",
                previous, self.local
            ),
            None => debug!("Global state carries no node identity"),
        }
    }
}

// == Cache Manager ==
pub struct CacheManager<K: CacheKey, V: CacheValue> {
    config: Config,
    local: Address,
    cluster: Arc<LocalCluster<K, V>>,
    global_state: GlobalStateManager,
    caches: CacheMap<K, V>,
    running: AtomicBool,
    purge_task: Mutex<Option<JoinHandle<()>>>,
}

impl<K: CacheKey, V: CacheValue> CacheManager<K, V> {
    pub fn new(config: Config, local: Address, cluster: Arc<LocalCluster<K, V>>) -> Self {
        let global_state = GlobalStateManager::new(&config.global_state);
        global_state.register_provider(Arc::new(NodeStateProvider {
            local: local.clone(),
            topology: cluster.topology.clone(),
        }));
        Self {
            config,
            local,
            cluster,
            global_state,
            caches: Arc::new(RwLock::new(HashMap::new())),
            running: AtomicBool::new(false),
            purge_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn address(&self) -> &Address {
        &self.local
    }

    pub fn global_state(&self) -> &GlobalStateManager {
        &self.global_state
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.cluster.topology
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // == Define Cache ==
    /// Creates cache `name` backed by `store`. On a running manager the cache
    /// starts immediately.
    pub async fn define_cache(
        &self,
        name: &str,
        store: StoreKind,
    ) -> Result<Arc<ClusteredCache<K, V>>> {
        if self.caches.read().await.contains_key(name) {
            return Err(CacheError::IllegalState(format!(
                "cache {} is already defined on {}",
                name, self.local
            )));
        }

        let topology = self.cluster.topology.subscribe();
        let core: Option<Arc<dyn CacheStore<K, V>>> = match store {
            StoreKind::None => None,
            StoreKind::Memory => Some(Arc::new(InMemoryStore::new(name))),
            StoreKind::SharedMemory => Some(Arc::new(InMemoryStore::shared(name, &self.cluster.registry)?)),
            StoreKind::File(path) => Some(Arc::new(FileStore::new(name, path))),
        };
        let store = core.map(|core| {
            StoreStack::from_config(core, &self.config.persistence, &self.local, &topology).build()
        });

        let (transport, events) = self.cluster.channels(name);
        let cache = ClusteredCache::new(
            name,
            self.config.clone(),
            ClusterContext {
                local: self.local.clone(),
                topology,
                transport,
                events,
            },
            store,
        );
        if self.is_running() {
            cache.start()?;
        }
        self.caches
            .write()
            .await
            .insert(name.to_string(), cache.clone());
        debug!("Defined cache {} on {}", name, self.local);
        Ok(cache)
    }

    pub async fn cache(&self, name: &str) -> Option<Arc<ClusteredCache<K, V>>> {
        self.caches.read().await.get(name).cloned()
    }

    pub async fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Client view of cache `name` with the configured near cache.
    pub async fn remote_cache(&self, name: &str) -> Result<RemoteCacheFacade<K, V>> {
        let cache = self
            .cache(name)
            .await
            .ok_or_else(|| CacheError::IllegalState(format!("cache {} is not defined", name)))?;
        RemoteCacheFacade::new(cache, &self.config.near_cache)
    }

    /// Key affinity service over this node's view of the cluster.
    pub fn key_affinity_service<G: KeyGenerator<K>>(&self, generator: G) -> KeyAffinityService<K> {
        KeyAffinityService::new(
            generator,
            self.cluster.topology.subscribe(),
            None,
            self.config.affinity.clone(),
        )
    }

    // == Start ==
    /// Loads global state, starts every cache, joins the cluster and starts the purge task.
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Cache manager {} already running", self.local);
            return Ok(());
        }

        if let Err(e) = self.global_state.start() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        // Caches must be reachable before other members route to this node
        let caches: Vec<_> = self.caches.read().await.values().cloned().collect();
        for cache in &caches {
            cache.start()?;
        }
        self.cluster.topology.join(self.local.clone());

        let handle = spawn_purge_task(self.caches.clone(), self.config.persistence.purge_interval);
        *self.purge_task.lock() = Some(handle);
        info!(
            "Cache manager {} started with {} caches",
            self.local,
            caches.len()
        );
        Ok(())
    }

    // == Stop ==
    /// Persists global state, stops every cache and leaves the cluster.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self.purge_task.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.global_state.stop() {
            warn!("Could not persist global state of {}: {}", self.local, e);
        }

        let caches: Vec<_> = self.caches.read().await.values().cloned().collect();
        let mut first_error = None;
        for cache in caches {
            if let Err(e) = cache.stop() {
                warn!("Stopping cache {} failed: {}", cache.name(), e);
                first_error.get_or_insert(e);
            }
        }

        self.cluster.topology.leave(&self.local);
        info!("Cache manager {} stopped", self.local);
        first_error.map_or(Ok(()), Err)
    }
}

impl<K: CacheKey, V: CacheValue> Drop for CacheManager<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.purge_task.get_mut().take() {
            handle.abort();
        }
    }
}
