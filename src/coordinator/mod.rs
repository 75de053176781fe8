//! Coordinator Module
//!
//! Routes cache operations to key owners and replicates writes between them.

mod cache;
mod flags;
mod locks;
mod sequencer;
mod transport;

pub use cache::{ClusterContext, ClusteredCache};
pub use flags::Flags;
pub use locks::KeyLocks;
pub use sequencer::{EventSequencer, EventTicket};
pub use transport::{
    await_reply, Command, Envelope, PendingReply, Reply, ReplySender, Transport, Update, WriteOp,
};
