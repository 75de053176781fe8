//! In-process membership authority.
//!
//! Publishes a new `MembershipView` on every join or leave through a
//! `tokio::sync::watch` channel, so subscribers always observe the latest
//! view and never a partially updated one.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::topology::{Address, MembershipView};

// == Topology Manager ==
/// Owns the current membership view and notifies subscribers of changes.
#[derive(Debug, Clone)]
pub struct TopologyManager {
    sender: Arc<watch::Sender<Arc<MembershipView>>>,
}

impl TopologyManager {
    /// Creates a manager with an empty view.
    pub fn new(num_segments: u32) -> Self {
        let (sender, _) = watch::channel(Arc::new(MembershipView::empty(num_segments)));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Creates a manager whose first view holds `members`.
    pub fn with_members(members: Vec<Address>, num_segments: u32) -> Self {
        let (sender, _) = watch::channel(Arc::new(MembershipView::new(1, members, num_segments)));
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Current view.
    pub fn current(&self) -> Arc<MembershipView> {
        self.sender.borrow().clone()
    }

    /// Receiver that observes every subsequent view.
    pub fn subscribe(&self) -> watch::Receiver<Arc<MembershipView>> {
        self.sender.subscribe()
    }

    // == Join ==
    /// Adds a member and publishes the new view. Joining twice is a no-op.
    pub fn join(&self, address: Address) -> Arc<MembershipView> {
        self.sender.send_if_modified(|view| {
            if view.contains(&address) {
                return false;
            }
            *view = Arc::new(view.with_member(address.clone()));
            info!(
                "Member {} joined, topology {} has {} members",
                address,
                view.topology_id(),
                view.members().len()
            );
            true
        });
        self.current()
    }

    // == Leave ==
    /// Removes a member and publishes the new view. Unknown members are ignored.
    pub fn leave(&self, address: &Address) -> Arc<MembershipView> {
        self.sender.send_if_modified(|view| {
            if !view.contains(address) {
                return false;
            }
            *view = Arc::new(view.without_member(address));
            info!(
                "Member {} left, topology {} has {} members",
                address,
                view.topology_id(),
                view.members().len()
            );
            true
        });
        self.current()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_join_and_leave_publish_new_views() {
        let manager = TopologyManager::new(16);
        let a = Address::new("a").unwrap();
        let b = Address::new("b").unwrap();

        let v1 = manager.join(a.clone());
        let v2 = manager.join(b.clone());
        assert_eq!(v1.members(), &[a.clone()]);
        assert_eq!(v2.members().len(), 2);
        assert!(v2.topology_id() > v1.topology_id());

        let v3 = manager.leave(&a);
        assert_eq!(v3.members(), &[b]);
    }

    #[test]
    fn test_duplicate_join_is_noop() {
        let manager = TopologyManager::new(16);
        let a = Address::new("a").unwrap();
        let v1 = manager.join(a.clone());
        let v2 = manager.join(a);
        assert_eq!(v1.topology_id(), v2.topology_id());
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let manager = TopologyManager::with_members(vec![Address::new("a").unwrap()], 16);
        let mut rx = manager.subscribe();
        manager.join(Address::new("b").unwrap());

        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rx.borrow().members().len(), 2);
    }
}
