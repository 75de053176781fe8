//! Per-invocation flags.

use serde::{Deserialize, Serialize};

/// Modifiers for a single cache operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flags {
    /// Do not write the modification to the cache store
    pub skip_cache_store: bool,
    /// Do not read through to the cache store on a memory miss
    pub skip_cache_load: bool,
    /// Do not publish client events
    pub skip_listener_notification: bool,
    /// Do not hand the entry to an indexer
    pub skip_indexing: bool,
}

impl Flags {
    pub const NONE: Flags = Flags {
        skip_cache_store: false,
        skip_cache_load: false,
        skip_listener_notification: false,
        skip_indexing: false,
    };

    /// Flags for entries loaded from the store at start.
    ///
    /// Shared stores also skip indexing: every node preloads the same data.
    pub fn preload(shared: bool) -> Self {
        Self {
            skip_cache_store: true,
            skip_cache_load: true,
            skip_listener_notification: true,
            skip_indexing: shared,
        }
    }

    pub fn skip_cache_store(mut self) -> Self {
        self.skip_cache_store = true;
        self
    }

    pub fn skip_cache_load(mut self) -> Self {
        self.skip_cache_load = true;
        self
    }

    pub fn skip_listener_notification(mut self) -> Self {
        self.skip_listener_notification = true;
        self
    }

    pub fn skip_indexing(mut self) -> Self {
        self.skip_indexing = true;
        self
    }
}
