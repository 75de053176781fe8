//! Integration Tests for the Key Affinity Service
//!
//! Generated keys must be primary-owned by the requested member, and a member
//! leaving the cluster must stop receiving keys.

use std::time::Duration;

use gridcache::affinity::{KeyAffinityService, RandomKeyGenerator};
use gridcache::config::{AffinityConfig, CacheMode, Config};
use gridcache::{Address, CacheError, CacheManager, ClusteredCache, LocalCluster, StoreKind};

// == Helper Functions ==

fn affinity_config(buffer_size: usize) -> AffinityConfig {
    AffinityConfig {
        buffer_size,
        ..AffinityConfig::default()
    }
}

fn members(n: usize) -> Vec<Address> {
    (0..n)
        .map(|i| Address::new(format!("member-{}", i)).unwrap())
        .collect()
}

// == Scenarios ==

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_buffer_size_keys_per_address_without_blocking_on_ownership() {
    let cluster = LocalCluster::<u64, String>::new(64);
    for member in members(3) {
        cluster.topology().join(member);
    }
    let service: KeyAffinityService<u64> = KeyAffinityService::new(
        RandomKeyGenerator,
        cluster.topology().subscribe(),
        None,
        affinity_config(8),
    );
    service.start().await;

    let view = cluster.topology().current();
    for address in view.members() {
        for _ in 0..8 {
            let key = tokio::time::timeout(Duration::from_secs(5), service.get_key_for_address(address))
                .await
                .expect("key not generated in time")
                .unwrap();
            assert_eq!(view.owners(&key, 1).unwrap()[0], *address);
        }
    }
    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_removed_address_gets_no_more_keys() {
    let cluster = LocalCluster::<u64, String>::new(64);
    let members = members(3);
    for member in &members {
        cluster.topology().join(member.clone());
    }
    let service: KeyAffinityService<u64> = KeyAffinityService::new(
        RandomKeyGenerator,
        cluster.topology().subscribe(),
        None,
        affinity_config(16),
    );
    service.start().await;

    // consume part of the buffer so generation is in progress when the member leaves
    for _ in 0..4 {
        service.get_key_for_address(&members[2]).await.unwrap();
    }
    cluster.topology().leave(&members[2]);

    let outcome = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match service.get_key_for_address(&members[2]).await {
                Err(e) => return e,
                Ok(_) => tokio::task::yield_now().await,
            }
        }
    })
    .await
    .expect("removed address kept receiving keys");
    assert!(matches!(outcome, CacheError::AddressNotInCluster(_)));
    assert_eq!(service.queue_len(&members[2]).await, None);

    // survivors are still served with keys owned under the new view
    let view = cluster.topology().current();
    let key = service.get_key_for_address(&members[0]).await.unwrap();
    assert_eq!(view.owners(&key, 1).unwrap()[0], members[0]);
    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_affinity_keys_are_stored_on_the_target_node() {
    let mut config = Config::default();
    config.clustering.mode = CacheMode::Distributed { sync: true };
    config.clustering.num_owners = 1;
    config.clustering.num_segments = 64;
    config.affinity = affinity_config(4);

    let cluster = LocalCluster::<u64, String>::new(64);
    let mut nodes: Vec<(CacheManager<u64, String>, std::sync::Arc<ClusteredCache<u64, String>>)> = Vec::new();
    for address in members(3) {
        let manager = CacheManager::new(config.clone(), address, cluster.clone());
        let cache = manager.define_cache("affine", StoreKind::None).await.unwrap();
        manager.start().await.unwrap();
        nodes.push((manager, cache));
    }

    let service = nodes[0].0.key_affinity_service(RandomKeyGenerator);
    service.start().await;

    let target = nodes[2].0.address().clone();
    let key = tokio::time::timeout(Duration::from_secs(5), service.get_key_for_address(&target))
        .await
        .unwrap()
        .unwrap();
    nodes[0].1.put(key, "pinned".into()).await.unwrap();

    assert!(nodes[2].1.peek_local(&key).is_some());
    assert!(nodes[0].1.peek_local(&key).is_none());
    assert!(nodes[1].1.peek_local(&key).is_none());
    service.stop().await;
}
