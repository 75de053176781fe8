//! Container Statistics Module
//!
//! Tracks in-memory hits, misses, evictions and store interplay.

use serde::Serialize;

// == Container Stats ==
/// Counters for a data container.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ContainerStats {
    /// Reads that found a live entry
    pub hits: u64,
    /// Reads that found nothing or an expired entry
    pub misses: u64,
    /// Writes applied to the container
    pub stores: u64,
    /// Entries removed to respect the capacity limit, or evicted explicitly
    pub evictions: u64,
    /// Entries written to the cache store on eviction
    pub passivations: u64,
    /// Entries brought back from the cache store on access
    pub activations: u64,
    /// Current number of entries
    pub total_entries: usize,
}

impl ContainerStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Returns hits / (hits + misses), or 0.0 if no reads were made.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_store(&mut self) {
        self.stores += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_passivation(&mut self) {
        self.passivations += 1;
    }

    pub fn record_activation(&mut self) {
        self.activations += 1;
    }

    pub fn set_total_entries(&mut self, count: usize) {
        self.total_entries = count;
    }
}
