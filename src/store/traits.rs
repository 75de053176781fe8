use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::store::CacheEntry;
use crate::types::{CacheKey, CacheValue};

// == Store State ==
/// Lifecycle of a cache store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreState::Stopped => "STOPPED",
            StoreState::Starting => "STARTING",
            StoreState::Started => "STARTED",
            StoreState::Stopping => "STOPPING",
        };
        f.write_str(name)
    }
}

/// Information handed to a store before it is started.
#[derive(Debug, Clone, Default)]
pub struct StoreContext {
    /// Name of the cache the store backs
    pub cache_name: String,
    /// Whether several nodes write to the same physical store
    pub shared: bool,
}

/// Persistent backing layer for a cache.
///
/// Every data operation is only valid in `StoreState::Started` and fails with
/// `IllegalState` otherwise. I/O failures surface as `StoreUnavailable`.
/// Implementations are single-node; cluster awareness lives in decorators and
/// the coordinator.
pub trait CacheStore<K: CacheKey, V: CacheValue>: Send + Sync {
    /// Human readable name, used in logs.
    fn name(&self) -> &str;

    /// Applies the cache context. Called once before `start`.
    fn init(&self, _ctx: &StoreContext) -> Result<()> {
        Ok(())
    }

    fn start(&self) -> Result<()>;

    fn stop(&self) -> Result<()>;

    fn state(&self) -> StoreState;

    /// Loads an entry. Expired entries are removed and reported as absent.
    fn load(&self, key: &K) -> Result<Option<CacheEntry<K, V>>>;

    /// Upserts an entry by key. Storing the same entry twice is the same as once.
    fn store(&self, entry: CacheEntry<K, V>) -> Result<()>;

    /// Removes an entry, returning whether it existed.
    fn remove(&self, key: &K) -> Result<bool>;

    /// Loads every live entry, evicting expired ones on the way.
    fn load_all(&self) -> Result<Vec<CacheEntry<K, V>>>;

    /// Loads at most `limit` live entries, evicting expired ones on the way.
    fn load_some(&self, limit: usize) -> Result<Vec<CacheEntry<K, V>>>;

    /// Keys of all live entries except those in `excluding`.
    fn load_all_keys(&self, excluding: &HashSet<K>) -> Result<HashSet<K>>;

    /// Removes every entry.
    fn clear(&self) -> Result<()>;

    /// Removes expired entries only, returning how many were removed.
    fn purge_expired(&self) -> Result<usize>;

    /// Number of live entries.
    fn size(&self) -> Result<usize> {
        Ok(self.load_all_keys(&HashSet::new())?.len())
    }

    fn contains(&self, key: &K) -> Result<bool> {
        Ok(self.load(key)?.is_some())
    }
}

/// Fails with `IllegalState` unless `store` is started.
pub fn ensure_store_started<K: CacheKey, V: CacheValue>(
    store: &dyn CacheStore<K, V>,
    operation: &str,
) -> Result<()> {
    match store.state() {
        StoreState::Started => Ok(()),
        other => Err(CacheError::IllegalState(format!(
            "{} on store {} while {}",
            operation,
            store.name(),
            other
        ))),
    }
}

// == Store Lifecycle ==
/// State machine shared by store implementations.
#[derive(Debug)]
pub struct StoreLifecycle {
    name: String,
    state: Mutex<StoreState>,
}

impl StoreLifecycle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(StoreState::Stopped),
        }
    }

    pub fn state(&self) -> StoreState {
        *self.state.lock()
    }

    /// Runs `on_start` while in `Starting`. Starting a started store is a no-op.
    pub fn start<F>(&self, on_start: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        {
            let mut state = self.state.lock();
            match *state {
                StoreState::Started => {
                    debug!("Store {} already started", self.name);
                    return Ok(());
                }
                StoreState::Stopped => *state = StoreState::Starting,
                other => {
                    return Err(CacheError::IllegalState(format!(
                        "store {} cannot start while {}",
                        self.name, other
                    )))
                }
            }
        }

        let outcome = on_start();
        *self.state.lock() = if outcome.is_ok() {
            StoreState::Started
        } else {
            StoreState::Stopped
        };
        outcome
    }

    /// Runs `on_stop` while in `Stopping`. Stopping a stopped store is a no-op.
    pub fn stop<F>(&self, on_stop: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        {
            let mut state = self.state.lock();
            match *state {
                StoreState::Stopped => return Ok(()),
                StoreState::Started => *state = StoreState::Stopping,
                other => {
                    return Err(CacheError::IllegalState(format!(
                        "store {} cannot stop while {}",
                        self.name, other
                    )))
                }
            }
        }

        let outcome = on_stop();
        *self.state.lock() = StoreState::Stopped;
        outcome
    }

    /// Fails with `IllegalState` unless the store is started.
    pub fn ensure_started(&self, operation: &str) -> Result<()> {
        let state = self.state();
        if state == StoreState::Started {
            Ok(())
        } else {
            Err(CacheError::IllegalState(format!(
                "{} on store {} while {}",
                operation, self.name, state
            )))
        }
    }
}
