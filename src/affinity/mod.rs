//! Affinity Module
//!
//! Background generation of keys that hash to a chosen cluster member.

mod gate;
mod generator;
mod service;

pub use gate::ReclosableGate;
pub use generator::{KeyGenerator, RandomKeyGenerator};
pub use service::KeyAffinityService;
