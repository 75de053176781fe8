//! Near cache service: a near cache map kept consistent by remote events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::NearCacheMode;
use crate::error::{CacheError, Result};
use crate::near::{
    decode_payload, near_cache_for, ClientListener, EventChannel, KeyEvent, ListenerId, NearCache,
    VersionedValue,
};
use crate::topology::stable_hash;
use crate::types::{CacheKey, CacheValue};

const INVALIDATION_STRIPES: usize = 32;

/// Lifecycle of a near cache service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NearCacheState {
    Created,
    Started,
    Stopped,
}

// == Near Cache Stats ==
#[derive(Debug, Default)]
pub struct NearCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

/// Point-in-time copy of `NearCacheStats`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NearCacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

impl NearCacheStats {
    fn snapshot(&self) -> NearCacheStatsSnapshot {
        NearCacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }
}

// == Invalidation Stripes ==
/// Event counters per key stripe.
///
/// Every event bumps its key's stripe while holding it. A value fetched from
/// the server is only cached if its stripe did not move since the fetch began.
#[derive(Debug)]
struct InvalidationStripes {
    stripes: Vec<Mutex<u64>>,
}

impl InvalidationStripes {
    fn new() -> Self {
        Self {
            stripes: (0..INVALIDATION_STRIPES).map(|_| Mutex::new(0)).collect(),
        }
    }

    fn lock<K: std::hash::Hash>(&self, key: &K) -> MutexGuard<'_, u64> {
        self.stripes[(stable_hash(key) % self.stripes.len() as u64) as usize].lock()
    }

    fn bump_all(&self) {
        for stripe in &self.stripes {
            *stripe.lock() += 1;
        }
    }
}

// == Listener ==
/// Applies remote events to the near cache map.
struct NearCacheListener<K, V> {
    cache: Arc<dyn NearCache<K, V>>,
    stats: Arc<NearCacheStats>,
    stripes: Arc<InvalidationStripes>,
    eager: bool,
}

impl<K: CacheKey, V: CacheValue> NearCacheListener<K, V> {
    fn invalidate(&self, key: &K) {
        let mut sequence = self.stripes.lock(key);
        *sequence += 1;
        self.remove_entry(key);
    }

    fn remove_entry(&self, key: &K) {
        if self.cache.remove(key).is_some() {
            self.stats.invalidations.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn apply(&self, event: &KeyEvent<K>) {
        let payload = match (&event.payload, self.eager) {
            (Some(payload), true) => payload,
            _ => return self.invalidate(&event.key),
        };
        let mut sequence = self.stripes.lock(&event.key);
        *sequence += 1;
        match decode_payload::<K, V>(payload) {
            Ok((key, value, version)) => {
                if self.cache.get(&key).is_some_and(|cached| cached.version >= version) {
                    trace!("Ignoring eager update of {:?} at stale version {}", key, version);
                    return;
                }
                trace!("Near cache eager update of {:?} at version {}", key, version);
                self.cache.put(key, VersionedValue::new(value, version));
            }
            Err(e) => {
                warn!("Invalidating {:?} after undecodable payload: {}", event.key, e);
                self.remove_entry(&event.key);
            }
        }
    }
}

impl<K: CacheKey, V: CacheValue> ClientListener<K> for NearCacheListener<K, V> {
    fn on_created(&self, event: &KeyEvent<K>) {
        self.apply(event);
    }

    fn on_modified(&self, event: &KeyEvent<K>) {
        self.apply(event);
    }

    fn on_removed(&self, key: &K) {
        self.invalidate(key);
    }

    fn on_failover(&self) {
        debug!("Failover received, clearing near cache");
        self.stripes.bump_all();
        self.cache.clear();
    }
}

// == Near Cache Service ==
/// Near cache registered as a listener on an event channel.
pub struct NearCacheService<K: CacheKey, V: CacheValue> {
    mode: NearCacheMode,
    cache: Arc<dyn NearCache<K, V>>,
    channel: Arc<EventChannel<K, V>>,
    stats: Arc<NearCacheStats>,
    stripes: Arc<InvalidationStripes>,
    state: Mutex<(NearCacheState, Option<ListenerId>)>,
}

impl<K: CacheKey, V: CacheValue> NearCacheService<K, V> {
    /// Creates a service in `Created` state. `Disabled` mode is rejected.
    pub fn new(
        mode: NearCacheMode,
        max_entries: Option<usize>,
        channel: Arc<EventChannel<K, V>>,
    ) -> Result<Self> {
        if mode == NearCacheMode::Disabled {
            return Err(CacheError::IllegalState(
                "near cache service requires an enabled mode".to_string(),
            ));
        }
        Ok(Self {
            mode,
            cache: Arc::from(near_cache_for::<K, V>(max_entries)),
            channel,
            stats: Arc::new(NearCacheStats::default()),
            stripes: Arc::new(InvalidationStripes::new()),
            state: Mutex::new((NearCacheState::Created, None)),
        })
    }

    pub fn mode(&self) -> NearCacheMode {
        self.mode
    }

    pub fn state(&self) -> NearCacheState {
        self.state.lock().0
    }

    // == Start ==
    /// Registers the remote listener. Starting twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        match state.0 {
            NearCacheState::Started => return Ok(()),
            NearCacheState::Stopped => {
                return Err(CacheError::IllegalState(
                    "near cache service was stopped".to_string(),
                ))
            }
            NearCacheState::Created => {}
        }

        let eager = self.mode == NearCacheMode::Eager;
        let listener = Arc::new(NearCacheListener {
            cache: self.cache.clone(),
            stats: self.stats.clone(),
            stripes: self.stripes.clone(),
            eager,
        });
        let id = self.channel.add_client_listener(listener, eager);
        *state = (NearCacheState::Started, Some(id));
        info!("Near cache started in {:?} mode", self.mode);
        Ok(())
    }

    // == Stop ==
    /// Deregisters the listener and clears the near cache.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if state.0 == NearCacheState::Stopped {
            return;
        }
        if let Some(id) = state.1.take() {
            self.channel.remove_client_listener(id);
        }
        self.cache.clear();
        state.0 = NearCacheState::Stopped;
        info!("Near cache stopped");
    }

    // == Get ==
    /// Cached value, or None on a miss, when not started, or while the event
    /// channel is disconnected.
    pub fn get(&self, key: &K) -> Option<VersionedValue<V>> {
        let found = if self.state() == NearCacheState::Started && self.channel.is_connected() {
            self.cache.get(key)
        } else {
            None
        };
        let counter = if found.is_some() {
            &self.stats.hits
        } else {
            &self.stats.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn put(&self, key: K, value: VersionedValue<V>) {
        self.cache.put(key, value);
    }

    pub fn put_if_absent(&self, key: K, value: VersionedValue<V>) -> bool {
        self.cache.put_if_absent(key, value)
    }

    /// Event sequence of `key`'s stripe. Take it before fetching from the server.
    pub fn fetch_token(&self, key: &K) -> u64 {
        *self.stripes.lock(key)
    }

    /// Caches a value fetched from the server unless an event for the key's
    /// stripe arrived after `token` was taken, or a newer version is cached.
    pub fn populate(&self, key: K, value: VersionedValue<V>, token: u64) -> bool {
        let sequence = self.stripes.lock(&key);
        if *sequence != token {
            trace!("Not caching {:?}, invalidated during the fetch", key);
            return false;
        }
        if self.cache.get(&key).is_some_and(|cached| cached.version >= value.version) {
            return false;
        }
        self.cache.put(key, value);
        true
    }

    pub fn remove(&self, key: &K) -> Option<VersionedValue<V>> {
        let mut sequence = self.stripes.lock(key);
        *sequence += 1;
        self.cache.remove(key)
    }

    pub fn clear(&self) {
        self.stripes.bump_all();
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn stats(&self) -> NearCacheStatsSnapshot {
        self.stats.snapshot()
    }
}

impl<K: CacheKey, V: CacheValue> Drop for NearCacheService<K, V> {
    fn drop(&mut self) {
        if let Some(id) = self.state.get_mut().1.take() {
            self.channel.remove_client_listener(id);
        }
    }
}
