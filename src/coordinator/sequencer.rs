//! Per-key ordering of client events published by a primary owner.
//!
//! Writes to one key are versioned under the key lock, but their events are
//! published later, after backups acknowledge. A ticket taken under the key
//! lock keeps the key's slot alive until the write finishes, so an event whose
//! version is older than one already published for the key is dropped.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::trace;

use crate::types::CacheKey;

#[derive(Debug, Default)]
struct Slot {
    in_flight: usize,
    published: u64,
}

#[derive(Debug)]
pub struct EventSequencer<K> {
    slots: Mutex<HashMap<K, Slot>>,
}

impl<K: CacheKey> Default for EventSequencer<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: CacheKey> EventSequencer<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a write in flight for `key`. Call while holding the key lock.
    pub fn begin(&self, key: &K) -> EventTicket<'_, K> {
        self.slots
            .lock()
            .entry(key.clone())
            .or_default()
            .in_flight += 1;
        EventTicket {
            sequencer: self,
            key: key.clone(),
        }
    }

    /// Keys with writes in flight.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().len()
    }
}

/// A write's claim on its key's event order. Dropping it ends the write.
#[derive(Debug)]
pub struct EventTicket<'a, K: CacheKey> {
    sequencer: &'a EventSequencer<K>,
    key: K,
}

impl<K: CacheKey> EventTicket<'_, K> {
    /// Runs `fire` unless a newer version was already published for the key.
    /// Dispatch happens under the sequencer lock so listeners observe
    /// versions of one key in increasing order.
    pub fn publish<F: FnOnce()>(&self, version: u64, fire: F) -> bool {
        let mut slots = self.sequencer.slots.lock();
        let Some(slot) = slots.get_mut(&self.key) else {
            return false;
        };
        if version <= slot.published {
            trace!(
                "Dropping event of {:?} at version {}, {} already published",
                self.key,
                version,
                slot.published
            );
            return false;
        }
        slot.published = version;
        fire();
        true
    }
}

impl<K: CacheKey> Drop for EventTicket<'_, K> {
    fn drop(&mut self) {
        let mut slots = self.sequencer.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.in_flight -= 1;
            if slot.in_flight == 0 {
                slots.remove(&self.key);
            }
        }
    }
}
