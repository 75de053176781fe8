//! Integration Tests for Clustered Caches
//!
//! Runs several cache managers in one process and checks replication,
//! rebalancing, stores and preload across them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gridcache::config::{CacheMode, Config, NearCacheMode};
use gridcache::coordinator::{ClusterContext, Command, Reply, Transport};
use gridcache::near::{ClientListener, EventChannel, KeyEvent, NearCacheService};
use gridcache::store::{CacheEntry, CacheStore, FileStore, InMemoryStore};
use gridcache::{
    Address, CacheError, CacheManager, ClusteredCache, LocalCluster, StoreKind, TopologyManager,
};

// == Helper Functions ==

type Node = (CacheManager<String, String>, Arc<ClusteredCache<String, String>>);

fn config(mode: CacheMode) -> Config {
    let mut config = Config::default();
    config.clustering.mode = mode;
    config.clustering.num_owners = 2;
    config.clustering.num_segments = 32;
    config.clustering.remote_timeout = Duration::from_secs(2);
    config
}

async fn start_cluster(size: usize, config: Config, store: StoreKind) -> (Arc<LocalCluster<String, String>>, Vec<Node>) {
    let cluster = LocalCluster::new(config.clustering.num_segments);
    let mut nodes = Vec::new();
    for i in 0..size {
        let manager = CacheManager::new(
            config.clone(),
            Address::new(format!("node-{}", i)).unwrap(),
            cluster.clone(),
        );
        let cache = manager.define_cache("test", store.clone()).await.unwrap();
        manager.start().await.unwrap();
        nodes.push((manager, cache));
    }
    // let rebalancing after the joins settle
    tokio::time::sleep(Duration::from_millis(50)).await;
    (cluster, nodes)
}

fn owners_of(cluster: &LocalCluster<String, String>, key: &str, num_owners: usize) -> Vec<Address> {
    cluster
        .topology()
        .current()
        .owners(&key.to_string(), num_owners)
        .unwrap()
}

fn holders(nodes: &[Node], key: &str) -> Vec<Address> {
    nodes
        .iter()
        .filter(|(_, cache)| cache.peek_local(&key.to_string()).is_some())
        .map(|(manager, _)| manager.address().clone())
        .collect()
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// == Distributed Mode ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dist_sync_write_lands_on_owners_only() {
    let (cluster, nodes) = start_cluster(3, config(CacheMode::Distributed { sync: true }), StoreKind::None).await;

    for i in 0..20 {
        let key = format!("key-{}", i);
        let writer = &nodes[i % 3].1;
        writer.put(key.clone(), format!("value-{}", i)).await.unwrap();

        let mut expected = owners_of(&cluster, &key, 2);
        let mut actual = holders(&nodes, &key);
        expected.sort_by(|a, b| a.name().cmp(b.name()));
        actual.sort_by(|a, b| a.name().cmp(b.name()));
        assert_eq!(actual, expected, "holders of {}", key);
    }

    // every node reads every key, owner or not
    for (_, cache) in &nodes {
        for i in 0..20 {
            let value = cache.get(&format!("key-{}", i)).await.unwrap();
            assert_eq!(value, Some(format!("value-{}", i)));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_dist_sync_remove_and_versions() {
    let (_cluster, nodes) = start_cluster(3, config(CacheMode::Distributed { sync: true }), StoreKind::None).await;
    let key = "versioned".to_string();

    nodes[0].1.put(key.clone(), "a".into()).await.unwrap();
    let previous = nodes[1].1.put(key.clone(), "b".into()).await.unwrap();
    assert_eq!(previous, Some("a".to_string()));

    let versions: Vec<u64> = nodes
        .iter()
        .filter_map(|(_, cache)| cache.peek_local(&key).map(|e| e.version))
        .collect();
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0], versions[1]);

    assert_eq!(nodes[2].1.remove(&key).await.unwrap(), Some("b".to_string()));
    assert!(holders(&nodes, &key).is_empty());
    assert_eq!(nodes[0].1.get(&key).await.unwrap(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_converge() {
    let (cluster, nodes) = start_cluster(3, config(CacheMode::Distributed { sync: true }), StoreKind::None).await;
    let caches: Vec<_> = nodes.iter().map(|(_, c)| c.clone()).collect();

    let writers: Vec<_> = (0..30)
        .map(|i| {
            let cache = caches[i % 3].clone();
            tokio::spawn(async move { cache.put("hot".to_string(), format!("v{}", i)).await })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let copies: Vec<CacheEntry<String, String>> = nodes
        .iter()
        .filter_map(|(_, cache)| cache.peek_local(&"hot".to_string()))
        .collect();
    assert_eq!(copies.len(), owners_of(&cluster, "hot", 2).len());
    assert!(copies.windows(2).all(|w| w[0].value == w[1].value && w[0].version == w[1].version));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_put_if_absent_across_nodes() {
    let (_cluster, nodes) = start_cluster(3, config(CacheMode::Distributed { sync: true }), StoreKind::None).await;

    assert_eq!(nodes[0].1.put_if_absent("once".into(), "first".into()).await.unwrap(), None);
    assert_eq!(
        nodes[2].1.put_if_absent("once".into(), "second".into()).await.unwrap(),
        Some("first".to_string())
    );
    assert_eq!(nodes[1].1.get(&"once".to_string()).await.unwrap(), Some("first".to_string()));
}

// == Replicated Mode ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repl_sync_every_node_holds_every_key() {
    let (_cluster, nodes) = start_cluster(3, config(CacheMode::Replicated { sync: true }), StoreKind::None).await;

    nodes[1].1.put("everywhere".into(), "v".into()).await.unwrap();
    assert_eq!(holders(&nodes, "everywhere").len(), 3);

    nodes[0].1.clear().await.unwrap();
    for (_, cache) in &nodes {
        assert_eq!(cache.size(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_repl_async_eventually_replicates() {
    let (_cluster, nodes) = start_cluster(3, config(CacheMode::Replicated { sync: false }), StoreKind::None).await;

    nodes[2].1.put("later".into(), "v".into()).await.unwrap();
    assert!(eventually(|| holders(&nodes, "later").len() == 3).await);
}

// == Topology Changes ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leaving_node_keeps_data_available() {
    let (cluster, nodes) = start_cluster(3, config(CacheMode::Distributed { sync: true }), StoreKind::None).await;
    for i in 0..30 {
        nodes[0].1.put(format!("k{}", i), format!("v{}", i)).await.unwrap();
    }

    let (leaver, _) = &nodes[2];
    leaver.stop().await.unwrap();
    let survivors = &nodes[..2];

    // both survivors own everything once rebalancing is done
    assert!(
        eventually(|| (0..30).all(|i| holders(survivors, &format!("k{}", i)).len() == 2)).await,
        "rebalance did not restore two copies"
    );
    assert_eq!(cluster.topology().current().members().len(), 2);
    for i in 0..30 {
        assert_eq!(
            survivors[1].1.get(&format!("k{}", i)).await.unwrap(),
            Some(format!("v{}", i))
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_joining_node_receives_its_entries() {
    let config = config(CacheMode::Distributed { sync: true });
    let (cluster, mut nodes) = start_cluster(2, config.clone(), StoreKind::None).await;
    for i in 0..30 {
        nodes[0].1.put(format!("k{}", i), format!("v{}", i)).await.unwrap();
    }

    let joiner = CacheManager::new(config, Address::new("node-2").unwrap(), cluster.clone());
    let cache = joiner.define_cache("test", StoreKind::None).await.unwrap();
    joiner.start().await.unwrap();
    nodes.push((joiner, cache));

    let settled = eventually(|| {
        (0..30).all(|i| {
            let key = format!("k{}", i);
            let mut expected = owners_of(&cluster, &key, 2);
            let mut actual = holders(&nodes, &key);
            expected.sort_by(|a, b| a.name().cmp(b.name()));
            actual.sort_by(|a, b| a.name().cmp(b.name()));
            expected == actual
        })
    })
    .await;
    assert!(settled, "entries not moved to their new owners");
}

// == Stores ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shared_store_written_by_primary() {
    let mut config = config(CacheMode::Distributed { sync: true });
    config.persistence.shared = true;
    let (cluster, nodes) = start_cluster(3, config, StoreKind::SharedMemory).await;

    for i in 0..10 {
        nodes[i % 3].1.put(format!("s{}", i), "v".into()).await.unwrap();
    }

    let store = nodes[0].1.store().unwrap();
    assert_eq!(store.size().unwrap(), 10);
    assert!(cluster.registry().contains("test"));
}

#[tokio::test]
async fn test_preload_bounded_by_eviction_limit() {
    let dir = tempfile::tempdir().unwrap();

    for (max_entries, expected) in [(2i64, 2usize), (-1, 3)] {
        let path = dir.path().join(format!("preload-{}.json", max_entries));
        let seed: FileStore<String, String> = FileStore::new("seed", &path);
        seed.start().unwrap();
        for key in ["k1", "k2", "k3"] {
            seed.store(CacheEntry::new(key.to_string(), "v".to_string())).unwrap();
        }
        seed.stop().unwrap();

        let mut config = config(CacheMode::Local);
        config.clustering.eviction_max_entries = max_entries;
        config.persistence.preload = true;

        let cluster = LocalCluster::<String, String>::new(config.clustering.num_segments);
        let manager = CacheManager::new(config, Address::new("solo").unwrap(), cluster);
        let cache = manager.define_cache("preloaded", StoreKind::File(path)).await.unwrap();
        manager.start().await.unwrap();

        assert_eq!(cache.size(), expected, "max entries {}", max_entries);
        manager.stop().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_through_from_shared_store_after_restart() {
    let mut config = config(CacheMode::Distributed { sync: true });
    config.persistence.shared = true;
    let (cluster, nodes) = start_cluster(2, config.clone(), StoreKind::SharedMemory).await;
    nodes[0].1.put("durable".into(), "v".into()).await.unwrap();

    for (manager, _) in &nodes {
        manager.stop().await.unwrap();
    }

    let manager = CacheManager::new(config, Address::new("fresh").unwrap(), cluster.clone());
    let cache = manager.define_cache("test", StoreKind::SharedMemory).await.unwrap();
    manager.start().await.unwrap();

    assert_eq!(cache.size(), 0);
    assert_eq!(cache.get(&"durable".to_string()).await.unwrap(), Some("v".to_string()));

    let shared: InMemoryStore<String, String> = InMemoryStore::shared("test", cluster.registry()).unwrap();
    assert_eq!(shared.raw_len(), 1);
}

// == Failure Handling ==

/// Counts events per kind.
#[derive(Default)]
struct EventCounter {
    created: AtomicUsize,
    modified: AtomicUsize,
    removed: AtomicUsize,
}

impl EventCounter {
    fn total(&self) -> usize {
        self.created.load(Ordering::SeqCst)
            + self.modified.load(Ordering::SeqCst)
            + self.removed.load(Ordering::SeqCst)
    }
}

impl ClientListener<String> for EventCounter {
    fn on_created(&self, _event: &KeyEvent<String>) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_modified(&self, _event: &KeyEvent<String>) {
        self.modified.fetch_add(1, Ordering::SeqCst);
    }

    fn on_removed(&self, _key: &String) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_failover(&self) {}
}

/// Node "a" of a two-member view whose backup "b" runs no cache.
struct HalfStartedPair {
    _topology: TopologyManager,
    cache: Arc<ClusteredCache<String, String>>,
    transport: Arc<Transport<String, String>>,
    store: Arc<InMemoryStore<String, String>>,
    events: Arc<EventCounter>,
    key: String,
    backup: Address,
}

impl HalfStartedPair {
    fn start(mode: CacheMode) -> Self {
        let mut config = config(mode);
        config.clustering.remote_timeout = Duration::from_millis(100);

        let local = Address::new("a").unwrap();
        let backup = Address::new("b").unwrap();
        let topology = TopologyManager::with_members(vec![local.clone(), backup.clone()], 32);
        let view = topology.current();
        let key = (0..)
            .map(|i| format!("key-{}", i))
            .find(|key| view.owners(key, 1).unwrap()[0] == local)
            .unwrap();

        let transport = Arc::new(Transport::new());
        let channel = Arc::new(EventChannel::new());
        let events = Arc::new(EventCounter::default());
        channel.add_client_listener(events.clone(), false);
        let store = Arc::new(InMemoryStore::new("pair"));

        let cache = ClusteredCache::new(
            "pair",
            config,
            ClusterContext {
                local,
                topology: topology.subscribe(),
                transport: transport.clone(),
                events: channel,
            },
            Some(store.clone() as Arc<dyn CacheStore<String, String>>),
        );
        cache.start().unwrap();

        Self {
            _topology: topology,
            cache,
            transport,
            store,
            events,
            key,
            backup,
        }
    }

    /// Registers the backup with a handler acknowledging every request.
    fn start_acking_backup(&self) {
        let mut inbox = self.transport.register(self.backup.clone());
        tokio::spawn(async move {
            while let Some(envelope) = inbox.recv().await {
                assert!(matches!(envelope.command, Command::Replicate { .. }));
                if let Some(reply) = envelope.reply {
                    let _ = reply.send(Ok(Reply::Ack));
                }
            }
        });
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_write_with_unreachable_backup_applies_nothing() {
    let pair = HalfStartedPair::start(CacheMode::Distributed { sync: true });

    let result = pair.cache.put(pair.key.clone(), "v".into()).await;
    assert!(matches!(result, Err(CacheError::OwnersUnavailable(_))), "{:?}", result);
    assert!(pair.cache.peek_local(&pair.key).is_none());
    assert_eq!(pair.store.raw_len(), 0);
    assert_eq!(pair.events.total(), 0);

    // the same write is a fresh insert once the backup is up
    pair.start_acking_backup();
    assert_eq!(pair.cache.put_if_absent(pair.key.clone(), "v".into()).await.unwrap(), None);
    assert_eq!(pair.cache.peek_local(&pair.key).unwrap().version, 1);
    assert_eq!(pair.events.created.load(Ordering::SeqCst), 1);
    assert_eq!(pair.events.modified.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sync_write_times_out_when_backup_never_acks() {
    let pair = HalfStartedPair::start(CacheMode::Distributed { sync: true });
    let _silent_inbox = pair.transport.register(pair.backup.clone());

    let result = pair.cache.put(pair.key.clone(), "v".into()).await;
    assert!(matches!(result, Err(CacheError::ReplicationTimeout(_))), "{:?}", result);
    assert_eq!(pair.events.total(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_write_ignores_unreachable_backup() {
    let pair = HalfStartedPair::start(CacheMode::Distributed { sync: false });

    assert_eq!(pair.cache.put(pair.key.clone(), "v".into()).await.unwrap(), None);
    assert_eq!(pair.cache.peek_local(&pair.key).unwrap().value, "v");
    assert_eq!(pair.store.raw_len(), 1);
    assert_eq!(pair.events.created.load(Ordering::SeqCst), 1);
}

// == Event Ordering ==

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_eager_near_cache_matches_server_under_concurrent_writes() {
    let (_cluster, nodes) = start_cluster(2, config(CacheMode::Distributed { sync: true }), StoreKind::None).await;
    let caches: Vec<_> = nodes.iter().map(|(_, c)| c.clone()).collect();
    let near = NearCacheService::new(NearCacheMode::Eager, None, caches[0].events().clone()).unwrap();
    near.start().unwrap();

    for round in 0..50 {
        let key = format!("contended-{}", round);
        let writers: Vec<_> = (0..8)
            .map(|i| {
                let cache = caches[i % 2].clone();
                let key = key.clone();
                tokio::spawn(async move { cache.put(key, format!("v{}", i)).await })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let server = caches[0].get_entry(&key, gridcache::Flags::NONE).await.unwrap().unwrap();
        let cached = near.get(&key).expect("eager near cache missed a written key");
        assert_eq!(cached.value, server.value, "round {}", round);
        assert_eq!(cached.version, server.version as i64, "round {}", round);
    }
}
