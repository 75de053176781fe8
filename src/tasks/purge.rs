//! Expiry Purge Task
//!
//! Background task that periodically removes expired entries from every
//! cache's data container and store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordinator::ClusteredCache;
use crate::types::{CacheKey, CacheValue};

/// Caches of one node, by name.
pub type CacheMap<K, V> = Arc<RwLock<HashMap<String, Arc<ClusteredCache<K, V>>>>>;

/// Spawns a background task sweeping expired entries every `interval`.
///
/// Caches added to `caches` after the task started are picked up on the next
/// sweep. Abort the returned handle to stop the task.
pub fn spawn_purge_task<K: CacheKey, V: CacheValue>(
    caches: CacheMap<K, V>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Starting expiry purge task with interval of {:?}", interval);

        loop {
            tokio::time::sleep(interval).await;

            let snapshot: Vec<_> = caches.read().await.values().cloned().collect();
            for cache in snapshot.iter().filter(|c| c.is_running()) {
                match cache.purge_expired() {
                    Ok((0, 0)) => debug!("Purge of cache {}: no expired entries", cache.name()),
                    Ok((in_memory, in_store)) => info!(
                        "Purge of cache {}: removed {} expired entries from memory, {} from store",
                        cache.name(),
                        in_memory,
                        in_store
                    ),
                    Err(e) => warn!("Purge of cache {} failed: {}", cache.name(), e),
                }
            }
        }
    })
}
