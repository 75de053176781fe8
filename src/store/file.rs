//! Single-file JSON cache store.
//!
//! The whole store is one JSON object keyed by the mapped string key. Every
//! mutation rewrites the file through a temporary file and a rename, so a
//! crash leaves either the old or the new snapshot on disk.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{CacheError, Result};
use crate::store::entry::current_timestamp_ms;
use crate::store::{
    CacheEntry, CacheStore, DefaultTwoWayKeyMapper, KeyMapper, Metadata, StoreContext,
    StoreLifecycle, StoreState,
};
use crate::types::{CacheKey, CacheValue};

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord<V> {
    value: V,
    metadata: Metadata,
    version: u64,
}

// == File Store ==
/// `CacheStore` persisting to a single JSON file.
pub struct FileStore<K, V> {
    name: String,
    path: PathBuf,
    mapper: Box<dyn KeyMapper<K>>,
    entries: RwLock<BTreeMap<String, CacheEntry<K, V>>>,
    lifecycle: StoreLifecycle,
}

impl<K: CacheKey, V: CacheValue> FileStore<K, V> {
    /// Creates a store writing to `path` with the default key mapper.
    pub fn new(name: impl Into<String>, path: impl AsRef<Path>) -> Self {
        Self::with_mapper(name, path, Box::new(DefaultTwoWayKeyMapper::<K>::new()))
    }

    pub fn with_mapper(
        name: impl Into<String>,
        path: impl AsRef<Path>,
        mapper: Box<dyn KeyMapper<K>>,
    ) -> Self {
        let name = name.into();
        Self {
            lifecycle: StoreLifecycle::new(name.clone()),
            name,
            path: path.as_ref().to_path_buf(),
            mapper,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<BTreeMap<String, CacheEntry<K, V>>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let raw = fs::read(&self.path).map_err(|e| self.unavailable("read", e))?;
        let records: BTreeMap<String, StoredRecord<V>> = serde_json::from_slice(&raw)?;
        records
            .into_iter()
            .map(|(stored_key, record)| {
                let key = self.mapper.string_to_key(&stored_key)?;
                let entry = CacheEntry {
                    key,
                    value: record.value,
                    metadata: record.metadata,
                    version: record.version,
                };
                Ok((stored_key, entry))
            })
            .collect()
    }

    fn write_file(&self, entries: &BTreeMap<String, CacheEntry<K, V>>) -> Result<()> {
        let records: BTreeMap<&String, StoredRecord<&V>> = entries
            .iter()
            .map(|(k, e)| {
                (
                    k,
                    StoredRecord {
                        value: &e.value,
                        metadata: e.metadata,
                        version: e.version,
                    },
                )
            })
            .collect();
        let bytes = serde_json::to_vec(&records)?;

        let tmp = self.path.with_extension("tmp");
        let mut file = fs::File::create(&tmp).map_err(|e| self.unavailable("write", e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| self.unavailable("write", e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.unavailable("rename", e))?;
        Ok(())
    }

    fn unavailable(&self, action: &str, err: std::io::Error) -> CacheError {
        CacheError::StoreUnavailable(format!(
            "{} {} for store {}: {}",
            action,
            self.path.display(),
            self.name,
            err
        ))
    }

    /// Applies `mutate` and persists; on a persistence failure the in-memory
    /// index is restored to its prior state.
    fn mutate<R>(
        &self,
        mutate: impl FnOnce(&mut BTreeMap<String, CacheEntry<K, V>>) -> R,
    ) -> Result<R> {
        let mut entries = self.entries.write();
        let previous = entries.clone();
        let outcome = mutate(&mut entries);
        if let Err(err) = self.write_file(&entries) {
            *entries = previous;
            return Err(err);
        }
        Ok(outcome)
    }

    fn evict_expired(&self) -> Result<usize> {
        let now = current_timestamp_ms();
        let has_expired = self.entries.read().values().any(|e| e.is_expired_at(now));
        if !has_expired {
            return Ok(0);
        }
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired_at(now));
            before - entries.len()
        })
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for FileStore<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StoreContext) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        debug!(
            "Initialized file store {} at {} for cache {}",
            self.name,
            self.path.display(),
            ctx.cache_name
        );
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.lifecycle.start(|| {
            let loaded = self.read_file()?;
            info!(
                "Started file store {} with {} entries from {}",
                self.name,
                loaded.len(),
                self.path.display()
            );
            *self.entries.write() = loaded;
            Ok(())
        })
    }

    fn stop(&self) -> Result<()> {
        self.lifecycle.stop(|| {
            let entries = self.entries.read();
            if let Err(err) = self.write_file(&entries) {
                warn!("Final flush of file store {} failed: {}", self.name, err);
                return Err(err);
            }
            debug!("Stopped file store {}", self.name);
            Ok(())
        })
    }

    fn state(&self) -> StoreState {
        self.lifecycle.state()
    }

    fn load(&self, key: &K) -> Result<Option<CacheEntry<K, V>>> {
        self.lifecycle.ensure_started("load")?;
        let stored_key = self.mapper.key_to_string(key)?;
        let found = self.entries.read().get(&stored_key).cloned();
        match found {
            Some(entry) if entry.is_expired() => {
                self.mutate(|entries| entries.remove(&stored_key))?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    fn store(&self, entry: CacheEntry<K, V>) -> Result<()> {
        self.lifecycle.ensure_started("store")?;
        let stored_key = self.mapper.key_to_string(&entry.key)?;
        self.mutate(|entries| {
            entries.insert(stored_key, entry);
        })
    }

    fn remove(&self, key: &K) -> Result<bool> {
        self.lifecycle.ensure_started("remove")?;
        let stored_key = self.mapper.key_to_string(key)?;
        if !self.entries.read().contains_key(&stored_key) {
            return Ok(false);
        }
        self.mutate(|entries| entries.remove(&stored_key).is_some())
    }

    fn load_all(&self) -> Result<Vec<CacheEntry<K, V>>> {
        self.lifecycle.ensure_started("load_all")?;
        self.evict_expired()?;
        Ok(self.entries.read().values().cloned().collect())
    }

    fn load_some(&self, limit: usize) -> Result<Vec<CacheEntry<K, V>>> {
        self.lifecycle.ensure_started("load_some")?;
        self.evict_expired()?;
        Ok(self.entries.read().values().take(limit).cloned().collect())
    }

    fn load_all_keys(&self, excluding: &HashSet<K>) -> Result<HashSet<K>> {
        self.lifecycle.ensure_started("load_all_keys")?;
        self.evict_expired()?;
        Ok(self
            .entries
            .read()
            .values()
            .map(|e| e.key.clone())
            .filter(|k| !excluding.contains(k))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.lifecycle.ensure_started("clear")?;
        self.mutate(|entries| entries.clear())
    }

    fn purge_expired(&self) -> Result<usize> {
        self.lifecycle.ensure_started("purge_expired")?;
        self.evict_expired()
    }

    fn size(&self) -> Result<usize> {
        self.lifecycle.ensure_started("size")?;
        self.evict_expired()?;
        Ok(self.entries.read().len())
    }
}
