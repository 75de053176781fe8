//! Store Module
//!
//! Persistent backing layer for caches: the `CacheStore` SPI, concrete stores,
//! and the decorators composed around them.

mod async_store;
mod entry;
mod file;
mod key_mapper;
mod memory;
mod read_only;
mod registry;
mod singleton;
mod stack;
mod stats;
mod traits;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use async_store::AsyncStore;
pub use entry::{current_timestamp_ms, CacheEntry, Metadata};
pub use file::FileStore;
pub use key_mapper::{DefaultTwoWayKeyMapper, KeyMapper};
pub use memory::{InMemoryStore, SharedStoreData};
pub use read_only::ReadOnlyStore;
pub use registry::StoreRegistry;
pub use singleton::SingletonStore;
pub use stack::{StoreStack, StoreStage};
pub use stats::{StoreOp, StoreStats, StoreStatsSnapshot};
pub use traits::{ensure_store_started, CacheStore, StoreContext, StoreLifecycle, StoreState};
