//! Membership events from the service-discovery collaborator.
//!
//! Discovery itself (orchestrator pod metadata, DNS, ...) lives outside this
//! system; whatever watches it feeds join/leave events through the
//! [`MembershipWatcher`] seam and the router rebuilds its ring.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ring::NodeId;

/// One change in cluster membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    Left(NodeId),
}

/// Source of membership changes.
#[async_trait]
pub trait MembershipWatcher: Send + 'static {
    /// Next membership change; `None` when the discovery stream closes.
    async fn next(&mut self) -> Option<MembershipEvent>;
}

/// Fixed membership known at startup: emits one join per node, then closes.
///
/// Suits single-node deployments and tests; clustered deployments plug a
/// real discovery adapter into the same seam.
pub struct StaticMembership {
    pending: Vec<MembershipEvent>,
}

impl StaticMembership {
    pub fn new(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut pending: Vec<_> = nodes
            .into_iter()
            .map(MembershipEvent::Joined)
            .collect();
        pending.reverse();
        Self { pending }
    }
}

#[async_trait]
impl MembershipWatcher for StaticMembership {
    async fn next(&mut self) -> Option<MembershipEvent> {
        self.pending.pop()
    }
}

/// Membership fed through a channel by an external discovery adapter.
pub struct ChannelMembership {
    rx: mpsc::UnboundedReceiver<MembershipEvent>,
}

impl ChannelMembership {
    /// Create a watcher and the sender the discovery adapter writes into.
    pub fn pair() -> (mpsc::UnboundedSender<MembershipEvent>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl MembershipWatcher for ChannelMembership {
    async fn next(&mut self) -> Option<MembershipEvent> {
        self.rx.recv().await
    }
}
