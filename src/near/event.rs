//! Remote listener contract and the in-process event channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::near::encode_payload;
use crate::types::{CacheKey, CacheValue};

/// Created or modified key, with the eager payload when the listener asked for it.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyEvent<K> {
    pub key: K,
    pub version: i64,
    /// `[varint keyLen][key][varint valueLen][value][i64 version]`
    pub payload: Option<Vec<u8>>,
}

/// Server-pushed change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent<K> {
    Created(KeyEvent<K>),
    Modified(KeyEvent<K>),
    Removed(K),
    /// The client reconnected, possibly to a different server
    Failover,
}

/// Typed callbacks, one per event kind.
pub trait ClientListener<K>: Send + Sync {
    fn on_created(&self, event: &KeyEvent<K>);
    fn on_modified(&self, event: &KeyEvent<K>);
    fn on_removed(&self, key: &K);
    fn on_failover(&self);
}

pub type ListenerId = u64;

struct Registration<K> {
    id: ListenerId,
    listener: Arc<dyn ClientListener<K>>,
    include_payload: bool,
}

// == Event Channel ==
/// Connection between a node's notifications and its client listeners.
///
/// Events are dispatched on the publishing thread. While disconnected events
/// are dropped; reconnecting delivers `Failover` to every listener.
pub struct EventChannel<K, V> {
    listeners: RwLock<Vec<Registration<K>>>,
    connected: AtomicBool,
    next_id: AtomicU64,
    _value: std::marker::PhantomData<fn() -> V>,
}

impl<K: CacheKey, V: CacheValue> Default for EventChannel<K, V> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            connected: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            _value: std::marker::PhantomData,
        }
    }
}

impl<K: CacheKey, V: CacheValue> EventChannel<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a listener. `include_payload` requests eager payloads.
    pub fn add_client_listener(
        &self,
        listener: Arc<dyn ClientListener<K>>,
        include_payload: bool,
    ) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push(Registration {
            id,
            listener,
            include_payload,
        });
        debug!("Registered client listener {} (payload={})", id, include_payload);
        id
    }

    pub fn remove_client_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|r| r.id != id);
        before != listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Changes connectivity. A reconnect fires `Failover`.
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::SeqCst);
        match (was, connected) {
            (true, false) => info!("Event channel disconnected"),
            (false, true) => {
                info!("Event channel reconnected, signalling failover");
                self.fire(ClientEvent::Failover);
            }
            _ => {}
        }
    }

    // == Dispatch ==
    /// Delivers an event to every listener as is.
    pub fn fire(&self, event: ClientEvent<K>) {
        if !self.is_connected() && !matches!(event, ClientEvent::Failover) {
            return;
        }
        let listeners: Vec<Arc<dyn ClientListener<K>>> = self
            .listeners
            .read()
            .iter()
            .map(|r| r.listener.clone())
            .collect();
        for listener in listeners {
            dispatch(listener.as_ref(), &event);
        }
    }

    pub fn notify_created(&self, key: &K, value: &V, version: u64) {
        self.publish(key, value, version, ClientEvent::Created);
    }

    pub fn notify_modified(&self, key: &K, value: &V, version: u64) {
        self.publish(key, value, version, ClientEvent::Modified);
    }

    pub fn notify_removed(&self, key: &K) {
        self.fire(ClientEvent::Removed(key.clone()));
    }

    /// Builds one event for payload listeners and one for the rest.
    fn publish(&self, key: &K, value: &V, version: u64, kind: fn(KeyEvent<K>) -> ClientEvent<K>) {
        if !self.is_connected() {
            return;
        }
        let registrations: Vec<(Arc<dyn ClientListener<K>>, bool)> = self
            .listeners
            .read()
            .iter()
            .map(|r| (r.listener.clone(), r.include_payload))
            .collect();
        if registrations.is_empty() {
            return;
        }

        let version = version as i64;
        let payload = if registrations.iter().any(|(_, eager)| *eager) {
            match encode_payload(key, value, version) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!("Could not marshal event payload for {:?}: {}", key, e);
                    None
                }
            }
        } else {
            None
        };

        let plain = kind(KeyEvent {
            key: key.clone(),
            version,
            payload: None,
        });
        let eager = kind(KeyEvent {
            key: key.clone(),
            version,
            payload,
        });
        for (listener, include_payload) in registrations {
            let event = if include_payload { &eager } else { &plain };
            dispatch(listener.as_ref(), event);
        }
    }
}

fn dispatch<K>(listener: &dyn ClientListener<K>, event: &ClientEvent<K>) {
    match event {
        ClientEvent::Created(e) => listener.on_created(e),
        ClientEvent::Modified(e) => listener.on_modified(e),
        ClientEvent::Removed(key) => listener.on_removed(key),
        ClientEvent::Failover => listener.on_failover(),
    }
}
