//! Global State Module
//!
//! Persistent, scoped node state read at startup and written at shutdown.

mod manager;
mod state;

pub use manager::{GlobalStateManager, GlobalStateProvider, GlobalStateStatus};
pub use state::{ScopedPersistentState, GLOBAL_SCOPE, TIMESTAMP_PROPERTY, VERSION_PROPERTY};
