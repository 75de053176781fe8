//! Background Tasks Module
//!
//! Contains background tasks that run periodically while a node is up.
//!
//! # Tasks
//! - Expiry purge: removes expired entries from memory and stores

mod purge;

pub use purge::{spawn_purge_task, CacheMap};
