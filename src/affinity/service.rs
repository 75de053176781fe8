//! Key Affinity Service
//!
//! Keeps a buffer of pre-generated keys per cluster member, each key hashing
//! to that member under the view current at generation time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::affinity::{KeyGenerator, ReclosableGate};
use crate::config::AffinityConfig;
use crate::error::{CacheError, Result};
use crate::topology::{Address, MembershipView};
use crate::types::CacheKey;

/// Keys generated per pass while holding the read lock.
const GENERATION_BATCH: usize = 64;

// == Key Queue ==
/// Bounded FIFO of keys for one address.
#[derive(Debug)]
struct KeyQueue<K> {
    keys: Mutex<VecDeque<K>>,
    capacity: usize,
}

impl<K> KeyQueue<K> {
    fn new(capacity: usize) -> Self {
        Self {
            keys: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn try_push(&self, key: K) -> bool {
        let mut keys = self.keys.lock();
        if keys.len() >= self.capacity {
            return false;
        }
        keys.push_back(key);
        true
    }

    fn pop(&self) -> Option<K> {
        self.keys.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.keys.lock().len()
    }
}

/// Queues of the current view. Replaced wholesale on topology change.
struct AddressQueues<K> {
    view: Arc<MembershipView>,
    queues: HashMap<Address, Arc<KeyQueue<K>>>,
}

struct Inner<K> {
    generator: Box<dyn KeyGenerator<K>>,
    topology: watch::Receiver<Arc<MembershipView>>,
    /// None means every member is of interest
    filter: Option<HashSet<Address>>,
    config: AffinityConfig,
    queues: RwLock<AddressQueues<K>>,
    existing_key_count: AtomicUsize,
    max_number_of_keys: AtomicUsize,
    gate: ReclosableGate,
    keys_available: Notify,
    started: AtomicBool,
}

impl<K: CacheKey> Inner<K> {
    fn interested_in(&self, address: &Address) -> bool {
        self.filter.as_ref().map_or(true, |f| f.contains(address))
    }

    fn low_water_mark(&self) -> f32 {
        self.config.buffer_size as f32 * self.config.threshold
    }

    /// Drops every queue and rebuilds them for `view` under the write lock.
    async fn rebuild(&self, view: Arc<MembershipView>) {
        let mut guard = self.queues.write().await;
        let queues: HashMap<Address, Arc<KeyQueue<K>>> = view
            .members()
            .iter()
            .filter(|address| self.interested_in(address))
            .map(|address| {
                (
                    address.clone(),
                    Arc::new(KeyQueue::new(self.config.buffer_size)),
                )
            })
            .collect();

        self.existing_key_count.store(0, Ordering::SeqCst);
        self.max_number_of_keys
            .store(queues.len() * self.config.buffer_size, Ordering::SeqCst);
        debug!(
            "Rebuilt key affinity queues for topology {} ({} addresses)",
            view.topology_id(),
            queues.len()
        );
        *guard = AddressQueues { view, queues };
        drop(guard);

        self.gate.open();
        self.keys_available.notify_waiters();
    }

    /// One generation pass. Closes the gate once every queue is full.
    async fn generate_batch(&self) {
        let guard = self.queues.read().await;
        let mut added = 0;
        for _ in 0..GENERATION_BATCH {
            if self.existing_key_count.load(Ordering::SeqCst)
                >= self.max_number_of_keys.load(Ordering::SeqCst)
            {
                self.gate.close();
                break;
            }
            let key = self.generator.next_key();
            let Ok(primary) = guard.view.primary_owner(&key) else {
                self.gate.close();
                break;
            };
            if let Some(queue) = guard.queues.get(&primary) {
                if queue.try_push(key) {
                    self.existing_key_count.fetch_add(1, Ordering::SeqCst);
                    added += 1;
                }
            }
        }
        drop(guard);
        if added > 0 {
            self.keys_available.notify_waiters();
        }
    }

    async fn run_generator(self: Arc<Self>) {
        debug!("Key affinity generator running");
        loop {
            if !self.gate.wait(self.config.poll_interval).await {
                // A consumer may have drained below the limit without reopening
                if self.existing_key_count.load(Ordering::SeqCst)
                    < self.max_number_of_keys.load(Ordering::SeqCst)
                {
                    self.gate.open();
                }
                continue;
            }
            self.generate_batch().await;
            tokio::task::yield_now().await;
        }
    }

    async fn watch_topology(self: Arc<Self>) {
        let mut topology = self.topology.clone();
        while topology.changed().await.is_ok() {
            let view = topology.borrow_and_update().clone();
            info!(
                "Topology changed to {}, rebuilding key affinity queues",
                view.topology_id()
            );
            self.rebuild(view).await;
        }
    }
}

// == Key Affinity Service ==
/// Hands out keys known to map to a given cluster member.
pub struct KeyAffinityService<K: CacheKey> {
    inner: Arc<Inner<K>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: CacheKey> KeyAffinityService<K> {
    /// Creates a stopped service. A `filter` restricts the addresses keys are
    /// generated for; None means every member.
    pub fn new<G>(
        generator: G,
        topology: watch::Receiver<Arc<MembershipView>>,
        filter: Option<HashSet<Address>>,
        config: AffinityConfig,
    ) -> Self
    where
        G: KeyGenerator<K>,
    {
        let view = topology.borrow().clone();
        Self {
            inner: Arc::new(Inner {
                generator: Box::new(generator),
                topology,
                filter,
                config,
                queues: RwLock::new(AddressQueues {
                    view,
                    queues: HashMap::new(),
                }),
                existing_key_count: AtomicUsize::new(0),
                max_number_of_keys: AtomicUsize::new(0),
                gate: ReclosableGate::new(false),
                keys_available: Notify::new(),
                started: AtomicBool::new(false),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Service generating keys for the local address only.
    pub fn local<G>(
        generator: G,
        topology: watch::Receiver<Arc<MembershipView>>,
        local: Address,
        config: AffinityConfig,
    ) -> Self
    where
        G: KeyGenerator<K>,
    {
        Self::new(generator, topology, Some(HashSet::from([local])), config)
    }

    // == Start ==
    /// Builds the queues for the current view and spawns the generator and the
    /// topology listener. Starting a running service only logs.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            info!("Key affinity service already started");
            return;
        }

        let view = self.inner.topology.borrow().clone();
        self.inner.rebuild(view).await;

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(self.inner.clone().run_generator()));
        tasks.push(tokio::spawn(self.inner.clone().watch_topology()));
        info!(
            "Key affinity service started (buffer_size={})",
            self.inner.config.buffer_size
        );
    }

    // == Stop ==
    /// Halts the generator and topology listener and waits for them to finish.
    pub async fn stop(&self) {
        if !self.inner.started.swap(false, Ordering::SeqCst) {
            debug!("Key affinity service already stopped");
            return;
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!("Key affinity task ended abnormally: {}", e);
                }
            }
        }

        self.inner.gate.close();
        self.inner.keys_available.notify_waiters();
        info!("Key affinity service stopped");
    }

    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    // == Get Key ==
    /// Returns a key whose primary owner is `address`, waiting for the
    /// generator if its queue is empty.
    ///
    /// Fails with `IllegalState` when the service is not running or the
    /// address is not of interest, and with `AddressNotInCluster` once the
    /// address has left the membership.
    pub async fn get_key_for_address(&self, address: &Address) -> Result<K> {
        let inner = &self.inner;
        loop {
            if !self.is_started() {
                return Err(CacheError::IllegalState(
                    "key affinity service is not started".to_string(),
                ));
            }

            let notified = inner.keys_available.notified();
            {
                let guard = inner.queues.read().await;
                if !guard.view.contains(address) {
                    return Err(CacheError::AddressNotInCluster(address.to_string()));
                }
                let Some(queue) = guard.queues.get(address) else {
                    return Err(CacheError::IllegalState(format!(
                        "address {} is not served by this key affinity service",
                        address
                    )));
                };
                if let Some(key) = queue.pop() {
                    inner.existing_key_count.fetch_sub(1, Ordering::SeqCst);
                    if queue.len() as f32 <= inner.low_water_mark() {
                        inner.gate.open();
                    }
                    return Ok(key);
                }
            }

            inner.gate.open();
            let _ = tokio::time::timeout(inner.config.poll_interval, notified).await;
        }
    }

    // == Introspection ==
    pub fn existing_key_count(&self) -> usize {
        self.inner.existing_key_count.load(Ordering::SeqCst)
    }

    /// Always `addresses with a queue * buffer_size`.
    pub fn max_number_of_keys(&self) -> usize {
        self.inner.max_number_of_keys.load(Ordering::SeqCst)
    }

    /// Number of buffered keys for `address`, None if it has no queue.
    pub async fn queue_len(&self, address: &Address) -> Option<usize> {
        self.inner
            .queues
            .read()
            .await
            .queues
            .get(address)
            .map(|q| q.len())
    }

    pub async fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<Address> =
            self.inner.queues.read().await.queues.keys().cloned().collect();
        addresses.sort();
        addresses
    }
}

impl<K: CacheKey> Drop for KeyAffinityService<K> {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
