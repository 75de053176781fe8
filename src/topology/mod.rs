//! Topology Module
//!
//! Cluster addresses, membership views and the key ownership function.

mod address;
mod hash;
mod manager;
mod view;


pub use address::Address;
pub use hash::{stable_hash, StableHasher};
pub use manager::TopologyManager;
pub use view::{owners, MembershipView};
