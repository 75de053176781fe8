//! Key and value bounds shared by every component.

use std::fmt::Debug;
use std::hash::Hash;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Anything usable as a cache key.
///
/// Keys must hash identically on every node (see `topology::stable_hash`) and
/// be serializable for file stores and event payloads.
pub trait CacheKey:
    Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> CacheKey for T where
    T: Clone + Eq + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// Anything usable as a cache value.
pub trait CacheValue:
    Clone + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> CacheValue for T where
    T: Clone + PartialEq + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}
