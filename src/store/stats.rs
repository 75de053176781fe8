//! Store Statistics Module
//!
//! Counts store invocations per operation. Shared stores share one instance.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

// == Store Stats ==
/// Per-operation invocation counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    init: AtomicU64,
    start: AtomicU64,
    load: AtomicU64,
    write: AtomicU64,
    delete: AtomicU64,
    load_all: AtomicU64,
    clear: AtomicU64,
    purge_expired: AtomicU64,
}

/// Point-in-time copy of `StoreStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatsSnapshot {
    pub init: u64,
    pub start: u64,
    pub load: u64,
    pub write: u64,
    pub delete: u64,
    pub load_all: u64,
    pub clear: u64,
    pub purge_expired: u64,
}

/// Operations counted by `StoreStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Init,
    Start,
    Load,
    Write,
    Delete,
    LoadAll,
    Clear,
    PurgeExpired,
}

impl StoreStats {
    pub fn new() -> Self {
        Self::default()
    }

    // == Record ==
    /// Increments the counter for `op`.
    pub fn record(&self, op: StoreOp) {
        self.counter(op).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, op: StoreOp) -> u64 {
        self.counter(op).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            init: self.get(StoreOp::Init),
            start: self.get(StoreOp::Start),
            load: self.get(StoreOp::Load),
            write: self.get(StoreOp::Write),
            delete: self.get(StoreOp::Delete),
            load_all: self.get(StoreOp::LoadAll),
            clear: self.get(StoreOp::Clear),
            purge_expired: self.get(StoreOp::PurgeExpired),
        }
    }

    /// Resets every counter to zero.
    pub fn reset(&self) {
        for op in [
            StoreOp::Init,
            StoreOp::Start,
            StoreOp::Load,
            StoreOp::Write,
            StoreOp::Delete,
            StoreOp::LoadAll,
            StoreOp::Clear,
            StoreOp::PurgeExpired,
        ] {
            self.counter(op).store(0, Ordering::Relaxed);
        }
    }

    fn counter(&self, op: StoreOp) -> &AtomicU64 {
        match op {
            StoreOp::Init => &self.init,
            StoreOp::Start => &self.start,
            StoreOp::Load => &self.load,
            StoreOp::Write => &self.write,
            StoreOp::Delete => &self.delete,
            StoreOp::LoadAll => &self.load_all,
            StoreOp::Clear => &self.clear,
            StoreOp::PurgeExpired => &self.purge_expired,
        }
    }
}
