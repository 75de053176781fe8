//! Clustered Cache
//!
//! Routes key operations to their owners, applies them to the data container
//! and cache store, replicates them to backup owners and publishes client
//! events.
//!
//! Writes always execute on the primary owner: it takes the key lock, assigns
//! the entry version, applies the change locally (memory, then store) and
//! enqueues the versioned update for the backups before releasing the lock.
//! Synchronous modes then wait for every backup acknowledgment.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CacheMode, Config, StoreFailurePolicy};
use crate::container::{ContainerStats, DataContainer};
use crate::coordinator::transport::{await_reply, Envelope, PendingReply, ReplySender};
use crate::coordinator::{
    Command, EventSequencer, EventTicket, Flags, KeyLocks, Reply, Transport, Update, WriteOp,
};
use crate::error::{CacheError, Result};
use crate::near::EventChannel;
use crate::store::{CacheEntry, CacheStore, Metadata, StoreContext};
use crate::topology::{Address, MembershipView};
use crate::types::{CacheKey, CacheValue};

/// Cluster-side collaborators of a cache on one node.
pub struct ClusterContext<K, V> {
    pub local: Address,
    pub topology: watch::Receiver<Arc<MembershipView>>,
    pub transport: Arc<Transport<K, V>>,
    pub events: Arc<EventChannel<K, V>>,
}

/// Result of a write applied on the primary.
struct Applied<K, V> {
    /// Memory copy before the write
    in_memory: Option<CacheEntry<K, V>>,
    /// Memory copy, or store copy on a memory miss
    previous: Option<CacheEntry<K, V>>,
    update: Option<Update<K, V>>,
}

// == Clustered Cache ==
/// One cache on one node.
pub struct ClusteredCache<K: CacheKey, V: CacheValue> {
    name: String,
    config: Config,
    local: Address,
    topology: watch::Receiver<Arc<MembershipView>>,
    transport: Arc<Transport<K, V>>,
    events: Arc<EventChannel<K, V>>,
    container: Mutex<DataContainer<K, V>>,
    store: Option<Arc<dyn CacheStore<K, V>>>,
    locks: KeyLocks,
    sequencer: EventSequencer<K>,
    version_seq: AtomicU64,
    running: AtomicBool,
    handler: Mutex<Option<JoinHandle<()>>>,
}

impl<K: CacheKey, V: CacheValue> ClusteredCache<K, V> {
    // == Constructor ==
    pub fn new(
        name: impl Into<String>,
        config: Config,
        context: ClusterContext<K, V>,
        store: Option<Arc<dyn CacheStore<K, V>>>,
    ) -> Arc<Self> {
        let clustering = &config.clustering;
        Arc::new(Self {
            name: name.into(),
            container: Mutex::new(DataContainer::new(clustering.max_entries())),
            locks: KeyLocks::new(clustering.locking, clustering.lock_stripes),
            sequencer: EventSequencer::new(),
            local: context.local,
            topology: context.topology,
            transport: context.transport,
            events: context.events,
            store,
            config,
            version_seq: AtomicU64::new(0),
            running: AtomicBool::new(false),
            handler: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_address(&self) -> &Address {
        &self.local
    }

    pub fn mode(&self) -> CacheMode {
        self.config.clustering.mode
    }

    pub fn store(&self) -> Option<&Arc<dyn CacheStore<K, V>>> {
        self.store.as_ref()
    }

    pub fn events(&self) -> &Arc<EventChannel<K, V>> {
        &self.events
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // == Lifecycle ==
    /// Starts the store, joins the transport and preloads. Idempotent.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Cache {} already started on {}", self.name, self.local);
            return Ok(());
        }

        if let Err(e) = self.start_store() {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        if self.mode().is_clustered() {
            let inbox = self.transport.register(self.local.clone());
            let handle = tokio::spawn(self.clone().run(inbox, self.topology.clone()));
            *self.handler.lock() = Some(handle);
        }

        let preloaded = self.preload()?;
        info!(
            "Cache {} started on {} in {:?} mode ({} entries preloaded)",
            self.name,
            self.local,
            self.mode(),
            preloaded
        );
        Ok(())
    }

    fn start_store(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        store.init(&StoreContext {
            cache_name: self.name.clone(),
            shared: self.config.persistence.shared,
        })?;
        store.start()
    }

    /// Leaves the transport, passivates memory if configured and stops the store.
    pub fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        if self.mode().is_clustered() {
            self.transport.unregister(&self.local);
        }
        if let Some(handle) = self.handler.lock().take() {
            handle.abort();
        }

        if self.config.persistence.passivation {
            let entries = self.container.lock().entries();
            debug!("Passivating {} entries of cache {} on stop", entries.len(), self.name);
            self.passivate(entries);
        }

        if let Some(store) = &self.store {
            store.stop()?;
        }
        info!("Cache {} stopped on {}", self.name, self.local);
        Ok(())
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(CacheError::IllegalState(format!(
                "cache {} is not running on {}",
                self.name, self.local
            )))
        }
    }

    // == Preload ==
    /// Loads store contents into memory, bounded by the eviction limit.
    fn preload(&self) -> Result<usize> {
        let Some(store) = self.store.as_ref().filter(|_| self.config.persistence.preload) else {
            return Ok(0);
        };

        // Clustered nodes keep only owned entries, so the limit applies after filtering
        let limit = self.config.clustering.max_entries();
        let entries = match limit {
            Some(max) if !self.mode().is_clustered() => store.load_some(max)?,
            _ => store.load_all()?,
        };

        let flags = Flags::preload(self.config.persistence.shared);
        // Ownership as it will be once this node has joined
        let mut view = self.current_view();
        if self.mode().is_clustered() && !view.contains(&self.local) {
            view = Arc::new(view.with_member(self.local.clone()));
        }
        let mut loaded = 0;
        for entry in entries {
            if limit.is_some_and(|max| loaded >= max) {
                break;
            }
            if self.mode().is_clustered() && !self.owners(&view, &entry.key)?.contains(&self.local) {
                continue;
            }
            self.version_seq.fetch_max(entry.version, Ordering::SeqCst);
            let in_memory = self.container.lock().peek(&entry.key).cloned();
            self.apply_put(entry, in_memory, flags, true)?;
            loaded += 1;
        }
        Ok(loaded)
    }

    // == Ownership ==
    pub fn current_view(&self) -> Arc<MembershipView> {
        self.topology.borrow().clone()
    }

    fn owners(&self, view: &MembershipView, key: &K) -> Result<Vec<Address>> {
        match self.mode() {
            CacheMode::Local => Ok(vec![self.local.clone()]),
            CacheMode::Replicated { .. } => view.owners(key, view.members().len()),
            CacheMode::Distributed { .. } => view.owners(key, self.config.clustering.num_owners),
        }
    }

    /// Keys in local memory for which this node is an owner.
    pub fn keys_owned_locally(&self) -> Vec<K> {
        let view = self.current_view();
        let keys = self.container.lock().keys();
        keys.into_iter()
            .filter(|key| {
                self.owners(&view, key)
                    .map(|owners| owners.contains(&self.local))
                    .unwrap_or(false)
            })
            .collect()
    }

    // == Read Operations ==
    pub async fn get(&self, key: &K) -> Result<Option<V>> {
        Ok(self.get_entry(key, Flags::NONE).await?.map(|e| e.value))
    }

    pub async fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get_entry(key, Flags::NONE).await?.is_some())
    }

    /// Reads the entry from an owner, retrying across topology changes.
    pub async fn get_entry(&self, key: &K, flags: Flags) -> Result<Option<CacheEntry<K, V>>> {
        self.ensure_running()?;
        let mut attempt = 0;
        loop {
            match self.route_get(key, flags).await {
                Err(e) if e.is_retryable() => {
                    attempt = self.next_attempt(attempt, e).await?;
                }
                other => return other,
            }
        }
    }

    async fn route_get(&self, key: &K, flags: Flags) -> Result<Option<CacheEntry<K, V>>> {
        let view = self.current_view();
        let owners = self.owners(&view, key)?;
        if owners.contains(&self.local) {
            return self.read_local(key, flags);
        }
        let primary = &owners[0];
        match self
            .transport
            .invoke(
                &self.local,
                primary,
                Command::Get {
                    key: key.clone(),
                    flags,
                },
                self.config.clustering.remote_timeout,
            )
            .await?
        {
            Reply::Entry(entry) => Ok(entry),
            other => Err(unexpected(other)),
        }
    }

    /// Reads memory, then the store on a miss. A loaded entry is activated
    /// into memory.
    fn read_local(&self, key: &K, flags: Flags) -> Result<Option<CacheEntry<K, V>>> {
        if let Some(entry) = self.container.lock().get(key) {
            return Ok(Some(entry));
        }
        let Some(store) = self.store.as_ref().filter(|_| !flags.skip_cache_load) else {
            return Ok(None);
        };
        let Some(loaded) = store.load(key)? else {
            return Ok(None);
        };

        let _guard = self.locks.lock(key);
        if let Some(current) = self.container.lock().peek(key).cloned() {
            return Ok(Some(current));
        }
        let evicted = self.container.lock().put(loaded.clone());
        self.passivate(evicted);
        if self.config.persistence.passivation {
            self.container.lock().record_activation();
            if let Err(e) = store.remove(key) {
                warn!("Could not remove activated entry {:?} from store: {}", key, e);
            }
        }
        Ok(Some(loaded))
    }

    // == Write Operations ==
    /// Stores an immortal value. Returns the previous value.
    pub async fn put(&self, key: K, value: V) -> Result<Option<V>> {
        self.put_with_metadata(key, value, Metadata::immortal(), Flags::NONE)
            .await
    }

    pub async fn put_with_metadata(
        &self,
        key: K,
        value: V,
        metadata: Metadata,
        flags: Flags,
    ) -> Result<Option<V>> {
        let entry = CacheEntry::with_metadata(key, value, metadata);
        self.write(
            WriteOp::Put {
                entry,
                if_absent: false,
            },
            flags,
        )
        .await
    }

    /// Stores only if no live entry exists. Returns the existing value if any.
    pub async fn put_if_absent(&self, key: K, value: V) -> Result<Option<V>> {
        self.write(
            WriteOp::Put {
                entry: CacheEntry::new(key, value),
                if_absent: true,
            },
            Flags::NONE,
        )
        .await
    }

    /// Removes an entry cluster-wide. Returns the removed value.
    pub async fn remove(&self, key: &K) -> Result<Option<V>> {
        self.remove_with_flags(key, Flags::NONE).await
    }

    pub async fn remove_with_flags(&self, key: &K, flags: Flags) -> Result<Option<V>> {
        self.write(WriteOp::Remove { key: key.clone() }, flags).await
    }

    async fn write(&self, op: WriteOp<K, V>, flags: Flags) -> Result<Option<V>> {
        self.ensure_running()?;
        let mut attempt = 0;
        loop {
            match self.route_write(op.clone(), flags).await {
                Err(e) if e.is_retryable() => {
                    attempt = self.next_attempt(attempt, e).await?;
                }
                other => return other,
            }
        }
    }

    /// Backs off before another attempt, or surfaces `OwnersUnavailable`.
    async fn next_attempt(&self, attempt: usize, cause: CacheError) -> Result<usize> {
        if attempt >= self.config.clustering.max_retries {
            return Err(CacheError::OwnersUnavailable(format!(
                "gave up after {} retries: {}",
                attempt, cause
            )));
        }
        let attempt = attempt + 1;
        debug!(
            "Retrying on cache {} after topology-related failure (attempt {}): {}",
            self.name, attempt, cause
        );
        tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
        Ok(attempt)
    }

    async fn route_write(&self, op: WriteOp<K, V>, flags: Flags) -> Result<Option<V>> {
        let view = self.current_view();
        let owners = self.owners(&view, op.key())?;
        let primary = &owners[0];
        if *primary == self.local {
            return self.execute_as_primary(op, flags).await;
        }
        trace!("Forwarding write of {:?} to primary {}", op.key(), primary);
        match self
            .transport
            .invoke(
                &self.local,
                primary,
                Command::Write { op, flags },
                self.config.clustering.remote_timeout,
            )
            .await?
        {
            Reply::Previous(previous) => Ok(previous),
            other => Err(unexpected(other)),
        }
    }

    // == Primary Execution ==
    async fn execute_as_primary(&self, op: WriteOp<K, V>, flags: Flags) -> Result<Option<V>> {
        self.ensure_running()?;
        let view = self.current_view();
        let owners = self.owners(&view, op.key())?;
        if owners[0] != self.local {
            return Err(CacheError::OwnersUnavailable(format!(
                "{} is not the primary owner of {:?} in topology {}",
                self.local,
                op.key(),
                view.topology_id()
            )));
        }

        let sync = self.mode().is_sync();
        let backups = &owners[1..];
        if sync {
            // Nothing is applied unless every backup can take the update
            self.transport.ensure_reachable(backups)?;
        }

        let (applied, ticket, pending) = {
            let _guard = self.locks.lock(op.key());
            let ticket = self.sequencer.begin(op.key());
            let applied = self.apply_primary(op, flags)?;
            let pending = match &applied.update {
                Some(update) => match self.replicate(backups, update, flags, sync) {
                    Ok(pending) => pending,
                    Err(e) => {
                        self.roll_back(&applied, flags);
                        return Err(e);
                    }
                },
                None => Vec::new(),
            };
            (applied, ticket, pending)
        };

        if sync {
            self.await_acks(pending).await?;
        }
        self.notify(&applied, &ticket, flags);
        Ok(applied.previous.map(|e| e.value))
    }

    /// Applies a write under the key lock and assigns its version.
    fn apply_primary(&self, op: WriteOp<K, V>, flags: Flags) -> Result<Applied<K, V>> {
        let in_memory = self.container.lock().peek(op.key()).cloned();
        let previous = match in_memory.clone() {
            Some(entry) => Some(entry),
            None => match self.store.as_ref().filter(|_| !flags.skip_cache_load) {
                Some(store) => store.load(op.key())?,
                None => None,
            },
        };
        let version = self.next_version(previous.as_ref().map_or(0, |e| e.version));

        match op {
            WriteOp::Put { entry, if_absent } => {
                if if_absent && previous.is_some() {
                    return Ok(Applied {
                        in_memory,
                        previous,
                        update: None,
                    });
                }
                let entry = entry.versioned(version);
                self.apply_put(entry.clone(), in_memory.clone(), flags, true)?;
                Ok(Applied {
                    in_memory,
                    previous,
                    update: Some(Update::Put(entry)),
                })
            }
            WriteOp::Remove { key } => {
                self.apply_remove(&key, flags, true)?;
                Ok(Applied {
                    in_memory,
                    previous,
                    update: Some(Update::Remove { key, version }),
                })
            }
        }
    }

    fn next_version(&self, previous: u64) -> u64 {
        let mut current = self.version_seq.load(Ordering::SeqCst);
        loop {
            let next = current.max(previous) + 1;
            match self.version_seq.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Enqueues an update for every backup. Sync mode returns the pending
    /// replies and enqueues nothing if a backup is unreachable.
    fn replicate(
        &self,
        backups: &[Address],
        update: &Update<K, V>,
        flags: Flags,
        sync: bool,
    ) -> Result<Vec<(Address, PendingReply<K, V>)>> {
        let command = || Command::Replicate {
            update: update.clone(),
            flags,
        };
        if sync {
            return self.transport.request_all(&self.local, backups, command);
        }
        for backup in backups {
            if let Err(e) = self.transport.send(&self.local, backup, command()) {
                warn!("Async replication of {:?} to {} failed: {}", update.key(), backup, e);
            }
        }
        Ok(Vec::new())
    }

    /// Restores memory and store to their state before a primary write.
    fn roll_back(&self, applied: &Applied<K, V>, flags: Flags) {
        let Some(update) = &applied.update else {
            return;
        };
        let key = update.key();
        {
            let mut container = self.container.lock();
            match &applied.in_memory {
                Some(entry) => {
                    container.put(entry.clone());
                }
                None => {
                    container.remove(key);
                }
            }
        }

        if let Some(store) = self.store_for_write(flags, true) {
            let passivated = self.config.persistence.passivation && applied.in_memory.is_some();
            let outcome = match &applied.previous {
                _ if passivated => Ok(()),
                Some(previous) => store.store(previous.clone()),
                None => store.remove(key).map(|_| ()),
            };
            if let Err(e) = outcome {
                error!("Rollback of {:?} in the store of cache {} failed: {}", key, self.name, e);
            }
        }
        debug!("Rolled back write of {:?} on cache {}", key, self.name);
    }

    async fn await_acks(&self, pending: Vec<(Address, PendingReply<K, V>)>) -> Result<()> {
        let timeout = self.config.clustering.remote_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        for (backup, reply) in pending {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            await_reply(&backup, reply, remaining).await?;
        }
        Ok(())
    }

    /// Publishes the write's event in version order. A skipped notification
    /// still supersedes older events of the key.
    fn notify(&self, applied: &Applied<K, V>, ticket: &EventTicket<'_, K>, flags: Flags) {
        let Some(update) = &applied.update else {
            return;
        };
        let version = match update {
            Update::Put(entry) => entry.version,
            Update::Remove { version, .. } => *version,
        };
        ticket.publish(version, || {
            if flags.skip_listener_notification {
                return;
            }
            match update {
                Update::Put(entry) if applied.previous.is_some() => {
                    self.events
                        .notify_modified(&entry.key, &entry.value, entry.version)
                }
                Update::Put(entry) => {
                    self.events
                        .notify_created(&entry.key, &entry.value, entry.version)
                }
                Update::Remove { key, .. } if applied.previous.is_some() => {
                    self.events.notify_removed(key)
                }
                Update::Remove { .. } => {}
            }
        });
    }

    // == Local Application ==
    /// Store used for a modification, honouring flags and shared-store rules.
    fn store_for_write(&self, flags: Flags, is_primary: bool) -> Option<&Arc<dyn CacheStore<K, V>>> {
        let persistence = &self.config.persistence;
        if flags.skip_cache_store {
            return None;
        }
        if persistence.shared && !persistence.singleton && !is_primary {
            return None;
        }
        self.store.as_ref()
    }

    fn apply_put(
        &self,
        entry: CacheEntry<K, V>,
        in_memory: Option<CacheEntry<K, V>>,
        flags: Flags,
        is_primary: bool,
    ) -> Result<()> {
        let key = entry.key.clone();
        let evicted = self.container.lock().put(entry.clone());
        self.passivate(evicted);

        let Some(store) = self.store_for_write(flags, is_primary) else {
            return Ok(());
        };
        // Under passivation memory and store hold disjoint entries
        let outcome = if self.config.persistence.passivation {
            store.remove(&key).map(|_| ())
        } else {
            store.store(entry)
        };
        if let Err(e) = outcome {
            self.on_store_failure(e, || {
                let mut container = self.container.lock();
                match in_memory {
                    Some(previous) => {
                        container.put(previous);
                    }
                    None => {
                        container.remove(&key);
                    }
                }
            })?;
        }
        Ok(())
    }

    fn apply_remove(&self, key: &K, flags: Flags, is_primary: bool) -> Result<()> {
        let removed = self.container.lock().remove(key);
        let Some(store) = self.store_for_write(flags, is_primary) else {
            return Ok(());
        };
        if let Err(e) = store.remove(key) {
            self.on_store_failure(e, || {
                if let Some(previous) = removed {
                    self.container.lock().put(previous);
                }
            })?;
        }
        Ok(())
    }

    fn on_store_failure<F: FnOnce()>(&self, cause: CacheError, rollback: F) -> Result<()> {
        match self.config.persistence.failure_policy {
            StoreFailurePolicy::Fail => {
                rollback();
                warn!("Store failure on cache {}, write rolled back: {}", self.name, cause);
                Err(match cause {
                    CacheError::StoreUnavailable(_) => cause,
                    other => CacheError::StoreUnavailable(other.to_string()),
                })
            }
            StoreFailurePolicy::Ignore => {
                warn!("Ignoring store failure on cache {}: {}", self.name, cause);
                Ok(())
            }
        }
    }

    /// Writes evicted entries to the store when passivation is enabled.
    fn passivate(&self, evicted: Vec<CacheEntry<K, V>>) {
        if evicted.is_empty() || !self.config.persistence.passivation {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        for entry in evicted {
            let key = entry.key.clone();
            match store.store(entry) {
                Ok(()) => self.container.lock().record_passivation(),
                Err(e) => error!("Passivation of {:?} failed, entry lost: {}", key, e),
            }
        }
    }

    // == Backup Execution ==
    /// Applies a replicated update unless it is older than the local copy.
    fn apply_backup(&self, update: Update<K, V>, flags: Flags) -> Result<()> {
        self.ensure_running()?;
        let _guard = self.locks.lock(update.key());
        let in_memory = self.container.lock().peek(update.key()).cloned();
        let local_version = in_memory.as_ref().map(|e| e.version);

        match update {
            Update::Put(entry) => {
                if local_version.is_some_and(|v| entry.version <= v) {
                    trace!("Ignoring stale update of {:?} at version {}", entry.key, entry.version);
                    return Ok(());
                }
                self.version_seq.fetch_max(entry.version, Ordering::SeqCst);
                self.apply_put(entry, in_memory, flags, false)
            }
            Update::Remove { key, version } => {
                if local_version.is_some_and(|v| version < v) {
                    trace!("Ignoring stale removal of {:?} at version {}", key, version);
                    return Ok(());
                }
                self.apply_remove(&key, flags, false)
            }
        }
    }

    // == Cluster-wide Operations ==
    /// Clears memory and store on every member.
    pub async fn clear(&self) -> Result<()> {
        self.ensure_running()?;
        let flags = Flags::NONE;
        self.clear_local(flags)?;
        if !self.mode().is_clustered() {
            return Ok(());
        }

        let view = self.current_view();
        let mut pending = Vec::new();
        for member in view.members().iter().filter(|m| **m != self.local) {
            let reply = self
                .transport
                .request(&self.local, member, Command::Clear { flags })?;
            pending.push((member.clone(), reply));
        }
        if self.mode().is_sync() {
            self.await_acks(pending).await?;
        }
        Ok(())
    }

    fn clear_local(&self, flags: Flags) -> Result<()> {
        self.container.lock().clear();
        let is_coordinator = self.current_view().coordinator() == Some(&self.local)
            || !self.mode().is_clustered();
        if let Some(store) = self.store_for_write(flags, is_coordinator) {
            if let Err(e) = store.clear() {
                self.on_store_failure(e, || {})?;
            }
        }
        Ok(())
    }

    // == Local Operations ==
    /// Evicts a key from local memory, passivating it if configured.
    pub fn evict(&self, key: &K) -> bool {
        let evicted = self.container.lock().evict(key);
        match evicted {
            Some(entry) => {
                self.passivate(vec![entry]);
                true
            }
            None => false,
        }
    }

    /// Number of entries in local memory.
    pub fn size(&self) -> usize {
        self.container.lock().len()
    }

    /// Local in-memory entry, without read-through or statistics.
    pub fn peek_local(&self, key: &K) -> Option<CacheEntry<K, V>> {
        self.container.lock().peek(key).cloned()
    }

    pub fn stats(&self) -> ContainerStats {
        self.container.lock().stats()
    }

    /// Removes expired entries from memory and the store.
    pub fn purge_expired(&self) -> Result<(usize, usize)> {
        let in_memory = self.container.lock().purge_expired();
        let in_store = match &self.store {
            Some(store) => store.purge_expired()?,
            None => 0,
        };
        Ok((in_memory, in_store))
    }

    // == Command Handling ==
    async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Envelope<K, V>>,
        mut topology: watch::Receiver<Arc<MembershipView>>,
    ) {
        let mut view = topology.borrow_and_update().clone();
        loop {
            tokio::select! {
                envelope = inbox.recv() => {
                    let Some(envelope) = envelope else { break };
                    self.handle(envelope);
                }
                changed = topology.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = topology.borrow_and_update().clone();
                    self.rebalance(&view, &next);
                    view = next;
                }
            }
        }
        debug!("Command handler of cache {} on {} exited", self.name, self.local);
    }

    fn handle(self: &Arc<Self>, envelope: Envelope<K, V>) {
        let Envelope {
            from,
            command,
            reply,
        } = envelope;
        trace!("{} handling command from {}", self.local, from);

        let result = match command {
            Command::Write { op, flags } => {
                // Waiting for backups must not stall this inbox
                let cache = self.clone();
                tokio::spawn(async move {
                    let result = cache
                        .execute_as_primary(op, flags)
                        .await
                        .map(Reply::Previous);
                    respond(reply, result);
                });
                return;
            }
            Command::Replicate { update, flags } => self.apply_backup(update, flags).map(|_| Reply::Ack),
            Command::Get { key, flags } => self.read_local(&key, flags).map(Reply::Entry),
            Command::Clear { flags } => self.clear_local(flags).map(|_| Reply::Ack),
        };
        respond(reply, result);
    }

    /// Moves in-memory entries after a membership change.
    ///
    /// For each entry the first old owner still present pushes it to owners
    /// that are new; nodes that stopped owning the entry drop it.
    fn rebalance(&self, old: &MembershipView, new: &MembershipView) {
        if !self.mode().is_clustered() || new.is_empty() {
            return;
        }
        let entries = self.container.lock().entries();
        let mut pushed = 0;
        let mut dropped = HashSet::new();

        for entry in entries {
            let (Ok(old_owners), Ok(new_owners)) =
                (self.owners(old, &entry.key), self.owners(new, &entry.key))
            else {
                continue;
            };
            let pusher = old_owners.iter().find(|a| new.contains(a));
            if pusher == Some(&self.local) {
                for target in new_owners.iter().filter(|a| !old_owners.contains(a)) {
                    let command = Command::Replicate {
                        update: Update::Put(entry.clone()),
                        flags: Flags::NONE.skip_listener_notification(),
                    };
                    match self.transport.send(&self.local, target, command) {
                        Ok(()) => pushed += 1,
                        Err(e) => debug!("Rebalance push of {:?} to {} failed: {}", entry.key, target, e),
                    }
                }
            }
            if !new_owners.contains(&self.local) {
                dropped.insert(entry.key);
            }
        }

        if !dropped.is_empty() {
            let mut container = self.container.lock();
            for key in &dropped {
                container.remove(key);
            }
        }
        info!(
            "Cache {} on {} rebalanced to topology {}: {} pushed, {} dropped",
            self.name,
            self.local,
            new.topology_id(),
            pushed,
            dropped.len()
        );
    }
}

fn respond<K, V>(reply: Option<ReplySender<K, V>>, result: Result<Reply<K, V>>) {
    if let Some(reply) = reply {
        // The requester may have timed out already
        let _ = reply.send(result);
    }
}

fn unexpected<K, V>(reply: Reply<K, V>) -> CacheError {
    let kind = match reply {
        Reply::Ack => "ack",
        Reply::Previous(_) => "previous value",
        Reply::Entry(_) => "entry",
    };
    CacheError::IllegalState(format!("unexpected {} reply", kind))
}

impl<K: CacheKey, V: CacheValue> Drop for ClusteredCache<K, V> {
    fn drop(&mut self) {
        if let Some(handle) = self.handler.get_mut().take() {
            handle.abort();
        }
    }
}
