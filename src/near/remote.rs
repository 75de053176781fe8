//! Client view of a clustered cache fronted by an optional near cache.

use std::sync::Arc;

use tracing::debug;

use crate::config::{NearCacheConfig, NearCacheMode};
use crate::coordinator::{ClusteredCache, Flags};
use crate::error::Result;
use crate::near::{NearCacheService, NearCacheStatsSnapshot, VersionedValue};
use crate::types::{CacheKey, CacheValue};

/// Reads go to the near cache first and fall back to the clustered cache.
pub struct RemoteCacheFacade<K: CacheKey, V: CacheValue> {
    cache: Arc<ClusteredCache<K, V>>,
    near: Option<NearCacheService<K, V>>,
}

impl<K: CacheKey, V: CacheValue> RemoteCacheFacade<K, V> {
    /// Connects to `cache`, starting a near cache unless the mode is disabled.
    pub fn new(cache: Arc<ClusteredCache<K, V>>, config: &NearCacheConfig) -> Result<Self> {
        let near = match config.mode {
            NearCacheMode::Disabled => None,
            mode => {
                let max_entries = usize::try_from(config.max_entries).ok().filter(|m| *m > 0);
                let service = NearCacheService::new(mode, max_entries, cache.events().clone())?;
                service.start()?;
                Some(service)
            }
        };
        Ok(Self { cache, near })
    }

    pub fn near_cache(&self) -> Option<&NearCacheService<K, V>> {
        self.near.as_ref()
    }

    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.get_versioned(key).await?.map(|v| v.value))
    }

    /// Value with the version it was written at.
    pub async fn get_versioned(&self, key: &K) -> Result<Option<VersionedValue<V>>> {
        if let Some(found) = self.near.as_ref().and_then(|near| near.get(key)) {
            return Ok(Some(found));
        }

        let token = self.near.as_ref().map(|near| near.fetch_token(key));
        let Some(entry) = self.cache.get_entry(key, Flags::NONE).await? else {
            return Ok(None);
        };
        let versioned = VersionedValue::new(entry.value, entry.version as i64);
        if let (Some(near), Some(token)) = (&self.near, token) {
            if near.populate(key.clone(), versioned.clone(), token) {
                debug!("Near cache populated {:?} at version {}", key, versioned.version);
            }
        }
        Ok(Some(versioned))
    }

    pub async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        let previous = self.cache.put(key.clone(), value).await?;
        self.invalidate(&key);
        Ok(previous)
    }

    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        let previous = self.cache.remove(key).await?;
        if let Some(near) = &self.near {
            near.remove(key);
        }
        Ok(previous)
    }

    pub async fn clear(&self) -> Result<()> {
        self.cache.clear().await?;
        if let Some(near) = &self.near {
            near.clear();
        }
        Ok(())
    }

    pub fn near_stats(&self) -> Option<NearCacheStatsSnapshot> {
        self.near.as_ref().map(|near| near.stats())
    }

    /// Stops the near cache; the facade keeps working without it.
    pub fn stop(&self) {
        if let Some(near) = &self.near {
            near.stop();
        }
    }

    // Eager mode already holds the value pushed by the write's event
    fn invalidate(&self, key: &K) {
        if let Some(near) = self.near.as_ref().filter(|n| n.mode() == NearCacheMode::Invalidated) {
            near.remove(key);
        }
    }
}
