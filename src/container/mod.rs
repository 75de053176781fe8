//! Container Module
//!
//! In-memory entry storage for a cache: LRU-bounded map, access tracking and
//! statistics.

mod data;
mod lru;
mod stats;

pub use data::DataContainer;
pub use lru::LruTracker;
pub use stats::ContainerStats;
