//! Near Module
//!
//! Client-side near caches kept consistent by server-pushed events.

mod cache;
mod codec;
mod event;
mod remote;
mod service;

pub use cache::{near_cache_for, BoundedNearCache, NearCache, UnboundedNearCache, VersionedValue};
pub use codec::{
    decode_payload, decode_raw, decode_varint, encode_payload, encode_raw, encode_varint,
};
pub use event::{ClientEvent, ClientListener, EventChannel, KeyEvent, ListenerId};
pub use remote::RemoteCacheFacade;
pub use service::{NearCacheService, NearCacheState, NearCacheStatsSnapshot};
