//! Cache Entry Module
//!
//! Defines the structure for individual cache entries with expiry metadata.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// == Metadata ==
/// Expiry metadata attached to every entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Metadata {
    /// Maximum lifetime in milliseconds, None = immortal
    pub lifespan_ms: Option<u64>,
    /// Maximum time between accesses in milliseconds, None = no idle limit
    pub max_idle_ms: Option<u64>,
    /// Creation timestamp (Unix milliseconds)
    pub created_at: u64,
    /// Last access timestamp (Unix milliseconds)
    pub last_used: u64,
}

impl Metadata {
    /// Metadata for an entry that never expires.
    pub fn immortal() -> Self {
        let now = current_timestamp_ms();
        Self {
            lifespan_ms: None,
            max_idle_ms: None,
            created_at: now,
            last_used: now,
        }
    }

    /// Metadata with optional lifespan and max idle.
    pub fn new(lifespan: Option<Duration>, max_idle: Option<Duration>) -> Self {
        Self {
            lifespan_ms: lifespan.map(|d| d.as_millis() as u64),
            max_idle_ms: max_idle.map(|d| d.as_millis() as u64),
            ..Self::immortal()
        }
    }

    pub fn with_lifespan(lifespan: Duration) -> Self {
        Self::new(Some(lifespan), None)
    }

    // == Expiry Time ==
    /// Absolute expiry time in Unix milliseconds, 0 when the entry never expires.
    ///
    /// The earlier of `created_at + lifespan` and `last_used + max_idle` wins.
    pub fn expiry_time(&self) -> u64 {
        let by_lifespan = self.lifespan_ms.map(|l| self.created_at.saturating_add(l));
        let by_idle = self.max_idle_ms.map(|i| self.last_used.saturating_add(i));
        match (by_lifespan, by_idle) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => 0,
        }
    }

    /// Checks expiry against an explicit clock reading.
    ///
    /// Boundary condition: the entry is expired once `now >= expiry_time`.
    pub fn is_expired_at(&self, now: u64) -> bool {
        let expiry = self.expiry_time();
        expiry > 0 && now >= expiry
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Records an access, pushing back max-idle expiry.
    pub fn touch(&mut self) {
        self.last_used = current_timestamp_ms();
    }
}

// == Cache Entry ==
/// Represents a single cache entry with value and metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<K, V> {
    pub key: K,
    pub value: V,
    pub metadata: Metadata,
    /// Version assigned by the primary owner, 0 for unversioned entries
    pub version: u64,
}

impl<K, V> CacheEntry<K, V> {
    // == Constructor ==
    /// Creates an immortal, unversioned entry.
    pub fn new(key: K, value: V) -> Self {
        Self {
            key,
            value,
            metadata: Metadata::immortal(),
            version: 0,
        }
    }

    pub fn with_metadata(key: K, value: V, metadata: Metadata) -> Self {
        Self {
            key,
            value,
            metadata,
            version: 0,
        }
    }

    pub fn versioned(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn expiry_time(&self) -> u64 {
        self.metadata.expiry_time()
    }

    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired()
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.metadata.is_expired_at(now)
    }

    // == Time To Live ==
    /// Returns remaining lifetime in milliseconds, or None if the entry never expires.
    ///
    /// # Returns
    /// - `Some(0)` if the entry has expired
    /// - `Some(remaining_ms)` if the entry expires in the future
    /// - `None` if the entry is immortal
    pub fn ttl_remaining_ms(&self) -> Option<u64> {
        match self.expiry_time() {
            0 => None,
            expiry => Some(expiry.saturating_sub(current_timestamp_ms())),
        }
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
