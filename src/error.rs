//! Error types for the cache core
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache core.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The membership view has no members, so no owner can be computed
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    /// The persistent store could not serve the request
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Remote owners did not acknowledge a synchronous write in time
    #[error("Replication timed out: {0}")]
    ReplicationTimeout(String),

    /// No owner could be reached after the bounded number of topology retries
    #[error("Owners unavailable: {0}")]
    OwnersUnavailable(String),

    /// The address is not (or no longer) a member of the cluster
    #[error("Address not in cluster: {0}")]
    AddressNotInCluster(String),

    /// Operation invoked in a lifecycle state that does not allow it
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// A required argument was missing or empty
    #[error("Null argument: {0}")]
    NullArgument(String),

    /// The key mapper cannot represent the key as the store's native key type
    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// Marshalling a key, value or event payload failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File system failure in a file-backed component
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    // == Retryable ==
    /// Returns true for failures caused by a topology change, which the
    /// coordinator retries against a refreshed view.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CacheError::OwnersUnavailable(_) | CacheError::AddressNotInCluster(_)
        )
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache core.
pub type Result<T> = std::result::Result<T, CacheError>;
