//! In-process transport between cluster members.
//!
//! Each member registers an inbox; commands are delivered in FIFO order per
//! sender/receiver pair. Requests carry a oneshot reply channel.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::coordinator::Flags;
use crate::error::{CacheError, Result};
use crate::store::CacheEntry;
use crate::topology::Address;

// == Messages ==
/// A write as requested by a client, executed by the primary owner.
#[derive(Debug, Clone)]
pub enum WriteOp<K, V> {
    Put {
        entry: CacheEntry<K, V>,
        if_absent: bool,
    },
    Remove {
        key: K,
    },
}

impl<K, V> WriteOp<K, V> {
    pub fn key(&self) -> &K {
        match self {
            WriteOp::Put { entry, .. } => &entry.key,
            WriteOp::Remove { key } => key,
        }
    }
}

/// A versioned modification sent from a primary to the other owners.
#[derive(Debug, Clone)]
pub enum Update<K, V> {
    Put(CacheEntry<K, V>),
    Remove { key: K, version: u64 },
}

impl<K, V> Update<K, V> {
    pub fn key(&self) -> &K {
        match self {
            Update::Put(entry) => &entry.key,
            Update::Remove { key, .. } => key,
        }
    }
}

#[derive(Debug)]
pub enum Command<K, V> {
    /// Execute as primary owner
    Write { op: WriteOp<K, V>, flags: Flags },
    /// Apply as backup owner
    Replicate { update: Update<K, V>, flags: Flags },
    /// Read from the local data container, loading from the store on a miss
    Get { key: K, flags: Flags },
    /// Clear the local data container and store
    Clear { flags: Flags },
}

#[derive(Debug)]
pub enum Reply<K, V> {
    Ack,
    /// Value before a write
    Previous(Option<V>),
    Entry(Option<CacheEntry<K, V>>),
}

pub type ReplySender<K, V> = oneshot::Sender<Result<Reply<K, V>>>;
pub type PendingReply<K, V> = oneshot::Receiver<Result<Reply<K, V>>>;

#[derive(Debug)]
pub struct Envelope<K, V> {
    pub from: Address,
    pub command: Command<K, V>,
    /// None for fire-and-forget commands
    pub reply: Option<ReplySender<K, V>>,
}

// == Transport ==
/// Routes commands to registered members.
#[derive(Debug)]
pub struct Transport<K, V> {
    inboxes: RwLock<HashMap<Address, mpsc::UnboundedSender<Envelope<K, V>>>>,
}

impl<K, V> Default for Transport<K, V> {
    fn default() -> Self {
        Self {
            inboxes: RwLock::new(HashMap::new()),
        }
    }
}

impl<K: Send + 'static, V: Send + 'static> Transport<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `address` and returns its inbox. Re-registering replaces the old inbox.
    pub fn register(&self, address: Address) -> mpsc::UnboundedReceiver<Envelope<K, V>> {
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("Transport registered {}", address);
        self.inboxes.write().insert(address, tx);
        rx
    }

    pub fn unregister(&self, address: &Address) -> bool {
        debug!("Transport unregistered {}", address);
        self.inboxes.write().remove(address).is_some()
    }

    pub fn is_registered(&self, address: &Address) -> bool {
        self.inboxes.read().contains_key(address)
    }

    /// Fails with `AddressNotInCluster` for the first target without an open inbox.
    pub fn ensure_reachable(&self, targets: &[Address]) -> Result<()> {
        let inboxes = self.inboxes.read();
        match targets
            .iter()
            .find(|to| inboxes.get(*to).map_or(true, |inbox| inbox.is_closed()))
        {
            Some(missing) => Err(CacheError::AddressNotInCluster(missing.to_string())),
            None => Ok(()),
        }
    }

    /// Enqueues one request per target, or none if any target is unreachable.
    pub fn request_all<F>(
        &self,
        from: &Address,
        targets: &[Address],
        mut command: F,
    ) -> Result<Vec<(Address, PendingReply<K, V>)>>
    where
        F: FnMut() -> Command<K, V>,
    {
        let inboxes = self.inboxes.read();
        let mut resolved = Vec::with_capacity(targets.len());
        for to in targets {
            match inboxes.get(to).filter(|inbox| !inbox.is_closed()) {
                Some(inbox) => resolved.push((to, inbox)),
                None => return Err(CacheError::AddressNotInCluster(to.to_string())),
            }
        }

        let mut pending = Vec::with_capacity(resolved.len());
        for (to, inbox) in resolved {
            let (tx, rx) = oneshot::channel();
            inbox
                .send(Envelope {
                    from: from.clone(),
                    command: command(),
                    reply: Some(tx),
                })
                .map_err(|_| CacheError::AddressNotInCluster(to.to_string()))?;
            pending.push((to.clone(), rx));
        }
        Ok(pending)
    }

    fn deliver(&self, to: &Address, envelope: Envelope<K, V>) -> Result<()> {
        let inboxes = self.inboxes.read();
        let inbox = inboxes
            .get(to)
            .ok_or_else(|| CacheError::AddressNotInCluster(to.to_string()))?;
        inbox
            .send(envelope)
            .map_err(|_| CacheError::AddressNotInCluster(to.to_string()))
    }

    /// Fire-and-forget send.
    pub fn send(&self, from: &Address, to: &Address, command: Command<K, V>) -> Result<()> {
        self.deliver(
            to,
            Envelope {
                from: from.clone(),
                command,
                reply: None,
            },
        )
    }

    /// Enqueues a request and returns the pending reply without waiting.
    pub fn request(
        &self,
        from: &Address,
        to: &Address,
        command: Command<K, V>,
    ) -> Result<PendingReply<K, V>> {
        let (tx, rx) = oneshot::channel();
        self.deliver(
            to,
            Envelope {
                from: from.clone(),
                command,
                reply: Some(tx),
            },
        )?;
        Ok(rx)
    }

    /// Sends a request and waits up to `timeout` for its reply.
    pub async fn invoke(
        &self,
        from: &Address,
        to: &Address,
        command: Command<K, V>,
        timeout: Duration,
    ) -> Result<Reply<K, V>> {
        let pending = self.request(from, to, command)?;
        await_reply(to, pending, timeout).await
    }
}

/// Waits for one reply, mapping a timeout to `ReplicationTimeout` and a
/// dropped reply channel to `AddressNotInCluster`.
pub async fn await_reply<K, V>(
    to: &Address,
    pending: PendingReply<K, V>,
    timeout: Duration,
) -> Result<Reply<K, V>> {
    match tokio::time::timeout(timeout, pending).await {
        Ok(Ok(reply)) => reply,
        Ok(Err(_)) => Err(CacheError::AddressNotInCluster(to.to_string())),
        Err(_) => Err(CacheError::ReplicationTimeout(format!(
            "no reply from {} within {:?}",
            to, timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(name: &str) -> Address {
        Address::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let transport: std::sync::Arc<Transport<u64, String>> = Default::default();
        let mut inbox = transport.register(addr("b"));

        let responder = tokio::spawn(async move {
            let envelope = inbox.recv().await.unwrap();
            assert!(matches!(envelope.command, Command::Get { key: 7, .. }));
            let reply = envelope.reply.unwrap();
            reply.send(Ok(Reply::Ack)).unwrap();
        });

        let reply = transport
            .invoke(
                &addr("a"),
                &addr("b"),
                Command::Get {
                    key: 7,
                    flags: Flags::NONE,
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Ack));
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_address() {
        let transport: Transport<u64, String> = Transport::new();
        let result = transport.send(&addr("a"), &addr("nobody"), Command::Clear { flags: Flags::NONE });
        assert!(matches!(result, Err(CacheError::AddressNotInCluster(_))));
    }

    #[tokio::test]
    async fn test_timeout_without_reply() {
        let transport: Transport<u64, String> = Transport::new();
        let _inbox = transport.register(addr("b"));
        let result = transport
            .invoke(
                &addr("a"),
                &addr("b"),
                Command::Clear { flags: Flags::NONE },
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(CacheError::ReplicationTimeout(_))));
    }

    #[tokio::test]
    async fn test_dropped_reply_means_member_gone() {
        let transport: Transport<u64, String> = Transport::new();
        let mut inbox = transport.register(addr("b"));
        let pending = transport
            .request(&addr("a"), &addr("b"), Command::Clear { flags: Flags::NONE })
            .unwrap();
        drop(inbox.recv().await);

        let result = await_reply(&addr("b"), pending, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(CacheError::AddressNotInCluster(_))));
    }

    #[tokio::test]
    async fn test_request_all_sends_nothing_when_one_target_is_missing() {
        let transport: Transport<u64, String> = Transport::new();
        let mut inbox = transport.register(addr("b"));
        let result = transport.request_all(&addr("a"), &[addr("b"), addr("c")], || Command::Clear {
            flags: Flags::NONE,
        });
        assert!(matches!(result, Err(CacheError::AddressNotInCluster(ref name)) if name == "c"));
        assert!(inbox.try_recv().is_err());

        assert!(transport.ensure_reachable(&[addr("b")]).is_ok());
        assert!(transport.ensure_reachable(&[addr("b"), addr("c")]).is_err());
    }

    #[test]
    fn test_unregister() {
        let transport: Transport<u64, String> = Transport::new();
        let _inbox = transport.register(addr("a"));
        assert!(transport.is_registered(&addr("a")));
        assert!(transport.unregister(&addr("a")));
        assert!(!transport.unregister(&addr("a")));
    }
}
