//! Write-behind store decorator.
//!
//! Writes are queued and applied to the delegate by a background task; reads
//! are answered from the pending modifications first, so a caller always sees
//! its own writes. A single flusher drains the queue in order, which keeps
//! modifications to one key FIFO.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::store::{ensure_store_started, CacheEntry, CacheStore, StoreContext, StoreState};
use crate::types::{CacheKey, CacheValue};

/// How long the flusher sleeps when no write wakes it.
const FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
enum Modification<K, V> {
    Store(CacheEntry<K, V>),
    Remove(K),
    Clear,
}

#[derive(Debug)]
struct PendingState<K, V> {
    queue: VecDeque<(u64, Modification<K, V>)>,
    /// Latest pending state per key: Some = stored, None = removed
    latest: HashMap<K, (u64, Option<CacheEntry<K, V>>)>,
    /// A clear is queued, so delegate contents are about to vanish
    clear_pending: bool,
    next_seq: u64,
}

impl<K, V> Default for PendingState<K, V> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            latest: HashMap::new(),
            clear_pending: false,
            next_seq: 0,
        }
    }
}

struct Inner<K, V> {
    delegate: Arc<dyn CacheStore<K, V>>,
    pending: Mutex<PendingState<K, V>>,
    /// Serializes flushes so queued modifications are applied in order
    flush_lock: Mutex<()>,
    queue_size: usize,
    stopped: AtomicBool,
    wake: Notify,
}

impl<K: CacheKey, V: CacheValue> Inner<K, V> {
    fn flush(&self) {
        let _guard = self.flush_lock.lock();
        let batch: Vec<(u64, Modification<K, V>)> = self.pending.lock().queue.drain(..).collect();
        if batch.is_empty() {
            return;
        }
        debug!(
            "Flushing {} modifications to store {}",
            batch.len(),
            self.delegate.name()
        );

        for (seq, modification) in batch {
            let outcome = match &modification {
                Modification::Store(entry) => self.delegate.store(entry.clone()),
                Modification::Remove(key) => self.delegate.remove(key).map(|_| ()),
                Modification::Clear => self.delegate.clear(),
            };
            if let Err(err) = outcome {
                error!(
                    "Async write to store {} failed: {}",
                    self.delegate.name(),
                    err
                );
            }

            let mut pending = self.pending.lock();
            match modification {
                Modification::Store(entry) => {
                    if pending.latest.get(&entry.key).is_some_and(|(s, _)| *s == seq) {
                        pending.latest.remove(&entry.key);
                    }
                }
                Modification::Remove(key) => {
                    if pending.latest.get(&key).is_some_and(|(s, _)| *s == seq) {
                        pending.latest.remove(&key);
                    }
                }
                Modification::Clear => {
                    if !pending.queue.iter().any(|(_, m)| matches!(m, Modification::Clear)) {
                        pending.clear_pending = false;
                    }
                }
            }
        }
    }
}

// == Async Store ==
/// Write-behind decorator around another store.
pub struct AsyncStore<K, V> {
    name: String,
    inner: Arc<Inner<K, V>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl<K: CacheKey, V: CacheValue> AsyncStore<K, V> {
    pub fn new(delegate: Arc<dyn CacheStore<K, V>>, queue_size: usize) -> Self {
        Self {
            name: format!("async({})", delegate.name()),
            inner: Arc::new(Inner {
                delegate,
                pending: Mutex::new(PendingState::default()),
                flush_lock: Mutex::new(()),
                queue_size: queue_size.max(1),
                stopped: AtomicBool::new(true),
                wake: Notify::new(),
            }),
            flusher: Mutex::new(None),
        }
    }

    /// Applies every queued modification to the delegate before returning.
    pub fn flush(&self) {
        self.inner.flush();
    }

    /// Number of modifications not yet handed to the delegate.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().queue.len()
    }

    fn enqueue(&self, modification: Modification<K, V>) {
        let queue_full = {
            let mut pending = self.inner.pending.lock();
            let seq = pending.next_seq;
            pending.next_seq += 1;
            match &modification {
                Modification::Store(entry) => {
                    pending
                        .latest
                        .insert(entry.key.clone(), (seq, Some(entry.clone())));
                }
                Modification::Remove(key) => {
                    pending.latest.insert(key.clone(), (seq, None));
                }
                Modification::Clear => {
                    // earlier modifications are superseded by the clear
                    pending.queue.clear();
                    pending.latest.clear();
                    pending.clear_pending = true;
                }
            }
            pending.queue.push_back((seq, modification));
            pending.queue.len() >= self.inner.queue_size
        };

        let has_flusher = self.flusher.lock().is_some();
        if queue_full || !has_flusher {
            // back-pressure, or no runtime to flush in the background
            self.inner.flush();
        } else {
            self.inner.wake.notify_one();
        }
    }

    /// Pending view of `key`: Some(Some) stored, Some(None) removed or cleared,
    /// None when the delegate must be consulted.
    fn pending_lookup(&self, key: &K) -> Option<Option<CacheEntry<K, V>>> {
        let pending = self.inner.pending.lock();
        match pending.latest.get(key) {
            Some((_, state)) => Some(state.clone().filter(|e| !e.is_expired())),
            None if pending.clear_pending => Some(None),
            None => None,
        }
    }

    /// Overlays pending modifications on the delegate contents.
    fn merged_entries(&self) -> Result<Vec<CacheEntry<K, V>>> {
        let (overlay, clear_pending) = {
            let pending = self.inner.pending.lock();
            (pending.latest.clone(), pending.clear_pending)
        };
        let mut merged: HashMap<K, CacheEntry<K, V>> = if clear_pending {
            HashMap::new()
        } else {
            self.inner
                .delegate
                .load_all()?
                .into_iter()
                .map(|e| (e.key.clone(), e))
                .collect()
        };
        for (key, (_, state)) in overlay {
            match state {
                Some(entry) if !entry.is_expired() => {
                    merged.insert(key, entry);
                }
                _ => {
                    merged.remove(&key);
                }
            }
        }
        Ok(merged.into_values().collect())
    }
}

impl<K: CacheKey, V: CacheValue> CacheStore<K, V> for AsyncStore<K, V> {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, ctx: &StoreContext) -> Result<()> {
        self.inner.delegate.init(ctx)
    }

    fn start(&self) -> Result<()> {
        self.inner.delegate.start()?;
        if !self.inner.stopped.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let inner = self.inner.clone();
                let task = handle.spawn(async move {
                    loop {
                        let _ = tokio::time::timeout(FLUSH_INTERVAL, inner.wake.notified()).await;
                        if inner.stopped.load(Ordering::SeqCst) {
                            break;
                        }
                        let flushing = inner.clone();
                        if let Err(err) = tokio::task::spawn_blocking(move || flushing.flush()).await
                        {
                            error!("Async store flusher panicked: {}", err);
                        }
                    }
                });
                *self.flusher.lock() = Some(task);
                info!("Started async store {}", self.name);
            }
            Err(_) => {
                warn!(
                    "No async runtime available, store {} writes through synchronously",
                    self.name
                );
            }
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.wake.notify_one();
        if let Some(task) = self.flusher.lock().take() {
            task.abort();
        }
        // drain whatever the background flusher did not get to
        self.inner.flush();
        info!("Stopped async store {}", self.name);
        self.inner.delegate.stop()
    }

    fn state(&self) -> StoreState {
        self.inner.delegate.state()
    }

    fn load(&self, key: &K) -> Result<Option<CacheEntry<K, V>>> {
        match self.pending_lookup(key) {
            Some(state) => Ok(state),
            None => self.inner.delegate.load(key),
        }
    }

    fn store(&self, entry: CacheEntry<K, V>) -> Result<()> {
        ensure_store_started(self.inner.delegate.as_ref(), "write")?;
        self.enqueue(Modification::Store(entry));
        Ok(())
    }

    fn remove(&self, key: &K) -> Result<bool> {
        ensure_store_started(self.inner.delegate.as_ref(), "write")?;
        let existed = self.load(key)?.is_some();
        self.enqueue(Modification::Remove(key.clone()));
        Ok(existed)
    }

    fn load_all(&self) -> Result<Vec<CacheEntry<K, V>>> {
        self.merged_entries()
    }

    fn load_some(&self, limit: usize) -> Result<Vec<CacheEntry<K, V>>> {
        let mut entries = self.merged_entries()?;
        entries.truncate(limit);
        Ok(entries)
    }

    fn load_all_keys(&self, excluding: &HashSet<K>) -> Result<HashSet<K>> {
        Ok(self
            .merged_entries()?
            .into_iter()
            .map(|e| e.key)
            .filter(|k| !excluding.contains(k))
            .collect())
    }

    fn clear(&self) -> Result<()> {
        ensure_store_started(self.inner.delegate.as_ref(), "write")?;
        self.enqueue(Modification::Clear);
        Ok(())
    }

    fn purge_expired(&self) -> Result<usize> {
        self.inner.delegate.purge_expired()
    }
}
