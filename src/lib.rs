//! GridCache - distributed in-memory cache core
//!
//! Key ownership by segmented rendezvous hashing, replicated and distributed
//! cache modes over an in-process transport, pluggable cache stores with
//! decorators, client near caches and persistent global state.

pub mod affinity;
pub mod config;
pub mod container;
pub mod coordinator;
pub mod error;
pub mod global_state;
pub mod manager;
pub mod near;
pub mod store;
pub mod tasks;
pub mod topology;
pub mod types;

pub use config::Config;
pub use coordinator::{ClusteredCache, Flags};
pub use error::{CacheError, Result};
pub use manager::{CacheManager, LocalCluster, StoreKind};
pub use tasks::spawn_purge_task;
pub use topology::{Address, MembershipView, TopologyManager};
