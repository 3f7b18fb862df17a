//! Cluster router: resolves which node owns a user and dispatches there.
//!
//! Placement is cooperative, not authoritative. The ring routes each user to
//! one home node; during membership transitions duplicate actors may exist
//! briefly, and the duplicate resolution here picks a deterministic winner
//! (lowest node id) and tells the loser to exit without writing. Because
//! every mutation persists before its reply, losing at most means one
//! unacked delivery gets redelivered to the winner.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use credits_core::{GrantMap, JobComplete, UserCredits, UserId};
use ractor::rpc::{self, CallResult};
use ractor::{ActorRef, RpcReplyPort};

use crate::membership::{MembershipEvent, MembershipWatcher};
use crate::messages::{ActorError, SupervisorMessage, UserMessage};
use crate::ring::{DEFAULT_VNODES, HashRing, NodeId};

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// This node's identity in the ring.
    pub node_id: NodeId,
    /// Per-request timeout for actor calls; a timeout is a transient
    /// failure and the caller must nack the originating delivery.
    pub call_timeout: Duration,
    /// Virtual nodes per physical node.
    pub vnode_replicas: usize,
}

impl RouterConfig {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            call_timeout: Duration::from_secs(5),
            vnode_replicas: DEFAULT_VNODES,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }
}

/// Cross-node dispatch for users homed on other nodes.
///
/// The RPC fabric is an external collaborator; implementations adapt it to
/// these three calls. Single-node deployments run without one.
#[async_trait]
pub trait NodeTransport: Send + Sync + 'static {
    async fn get_credits(&self, node: &NodeId, user_id: UserId)
    -> Result<UserCredits, ActorError>;

    async fn grant(
        &self,
        node: &NodeId,
        user_id: UserId,
        grant: GrantMap,
        source_event_id: Option<String>,
    ) -> Result<UserCredits, ActorError>;

    async fn complete_job(&self, node: &NodeId, job: JobComplete) -> Result<(), ActorError>;
}

/// Routes requests for a user to the one actor that owns it.
pub struct ActorRouter {
    config: RouterConfig,
    ring: RwLock<HashRing>,
    supervisor: ActorRef<SupervisorMessage>,
    transport: Option<Arc<dyn NodeTransport>>,
}

impl ActorRouter {
    /// Create a router whose ring initially contains only this node.
    pub fn new(config: RouterConfig, supervisor: ActorRef<SupervisorMessage>) -> Arc<Self> {
        let mut ring = HashRing::new(config.vnode_replicas);
        ring.insert(config.node_id.clone());
        Arc::new(Self {
            config,
            ring: RwLock::new(ring),
            supervisor,
            transport: None,
        })
    }

    /// Attach a cross-node transport.
    pub fn with_transport(
        config: RouterConfig,
        supervisor: ActorRef<SupervisorMessage>,
        transport: Arc<dyn NodeTransport>,
    ) -> Arc<Self> {
        let mut ring = HashRing::new(config.vnode_replicas);
        ring.insert(config.node_id.clone());
        Arc::new(Self {
            config,
            ring: RwLock::new(ring),
            supervisor,
            transport: Some(transport),
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// The node currently owning a user. Falls back to this node while the
    /// ring is empty (initial membership not yet delivered).
    pub fn home_node(&self, user_id: UserId) -> NodeId {
        self.ring
            .read()
            .expect("ring lock poisoned")
            .node_for(&user_id.to_string())
            .cloned()
            .unwrap_or_else(|| self.config.node_id.clone())
    }

    /// Read a user's balance, spawning the actor on first reference.
    pub async fn get_credits(&self, user_id: UserId) -> Result<UserCredits, ActorError> {
        let home = self.home_node(user_id);
        if home == self.config.node_id {
            dispatch_get(&self.supervisor, self.config.call_timeout, user_id).await
        } else {
            self.remote()?.get_credits(&home, user_id).await
        }
    }

    /// Apply a grant on the owning actor.
    pub async fn grant(
        &self,
        user_id: UserId,
        grant: GrantMap,
        source_event_id: Option<String>,
    ) -> Result<UserCredits, ActorError> {
        let home = self.home_node(user_id);
        if home == self.config.node_id {
            dispatch_grant(
                &self.supervisor,
                self.config.call_timeout,
                user_id,
                grant,
                source_event_id,
            )
            .await
        } else {
            self.remote()?
                .grant(&home, user_id, grant, source_event_id)
                .await
        }
    }

    /// Debit a completed job on the owning actor.
    pub async fn complete_job(&self, job: JobComplete) -> Result<(), ActorError> {
        let home = self.home_node(job.user_id);
        if home == self.config.node_id {
            dispatch_complete_job(&self.supervisor, self.config.call_timeout, job).await
        } else {
            self.remote()?.complete_job(&home, job).await
        }
    }

    fn remote(&self) -> Result<&Arc<dyn NodeTransport>, ActorError> {
        self.transport
            .as_ref()
            .ok_or_else(|| ActorError::Unroutable("no transport configured".to_string()))
    }

    /// Apply one membership change, then evict local actors whose home
    /// moved away. Evicted actors drain their mailboxes and exit; the next
    /// request re-hydrates them on the new owner via the gateway.
    pub async fn apply_membership(&self, event: MembershipEvent) {
        {
            let mut ring = self.ring.write().expect("ring lock poisoned");
            match &event {
                MembershipEvent::Joined(node) => {
                    tracing::info!("Node joined the ring: {}", node);
                    ring.insert(node.clone());
                }
                MembershipEvent::Left(node) => {
                    tracing::info!("Node left the ring: {}", node);
                    ring.remove(node);
                }
            }
        }
        self.evict_moved().await;
    }

    async fn evict_moved(&self) {
        let users = match rpc::call(
            &self.supervisor,
            |reply| SupervisorMessage::ListUsers { reply },
            Some(self.config.call_timeout),
        )
        .await
        {
            Ok(CallResult::Success(users)) => users,
            _ => return,
        };

        for user_id in users {
            if self.home_node(user_id) != self.config.node_id {
                tracing::info!("Releasing user {} to its new home node", user_id);
                let _ = self
                    .supervisor
                    .send_message(SupervisorMessage::StopUser { user_id });
            }
        }
    }

    /// Consume membership events until the discovery stream closes.
    pub async fn run_membership<W: MembershipWatcher>(self: Arc<Self>, mut watcher: W) {
        while let Some(event) = watcher.next().await {
            self.apply_membership(event).await;
        }
        tracing::info!("Membership stream closed");
    }

    /// Deterministic winner among nodes claiming the same user.
    pub fn resolve_winner(claimants: &[NodeId]) -> Option<&NodeId> {
        claimants.iter().min()
    }

    /// Resolve a duplicate-actor observation for a user.
    ///
    /// If this node is not the winner, its local copy (when running) is
    /// told to exit without flushing; any in-flight delivery fails and gets
    /// nacked, so the bus redelivers to the winner.
    pub async fn resolve_duplicate(&self, user_id: UserId, claimants: &[NodeId]) {
        let Some(winner) = Self::resolve_winner(claimants) else {
            return;
        };
        if *winner == self.config.node_id {
            return;
        }

        let lookup = rpc::call(
            &self.supervisor,
            |reply| SupervisorMessage::Lookup { user_id, reply },
            Some(self.config.call_timeout),
        )
        .await;

        if let Ok(CallResult::Success(Some(actor))) = lookup {
            tracing::warn!(
                "Duplicate actor for user {}: {} wins, stopping local copy",
                user_id,
                winner
            );
            let _ = actor.send_message(UserMessage::Conflict);
        }
    }
}

async fn resolve_actor(
    supervisor: &ActorRef<SupervisorMessage>,
    timeout: Duration,
    user_id: UserId,
) -> Result<ActorRef<UserMessage>, ActorError> {
    let result = rpc::call(
        supervisor,
        |reply| SupervisorMessage::Resolve { user_id, reply },
        Some(timeout),
    )
    .await;

    match result {
        Ok(CallResult::Success(resolved)) => resolved,
        Ok(CallResult::Timeout) => Err(ActorError::Timeout),
        Ok(CallResult::SenderError) | Err(_) => Err(ActorError::Stopped),
    }
}

async fn call_actor<T: Send + 'static>(
    actor: &ActorRef<UserMessage>,
    timeout: Duration,
    msg: impl FnOnce(RpcReplyPort<T>) -> UserMessage,
) -> Result<T, ActorError> {
    match rpc::call(actor, msg, Some(timeout)).await {
        Ok(CallResult::Success(value)) => Ok(value),
        Ok(CallResult::Timeout) => Err(ActorError::Timeout),
        Ok(CallResult::SenderError) | Err(_) => Err(ActorError::Stopped),
    }
}

pub(crate) async fn dispatch_get(
    supervisor: &ActorRef<SupervisorMessage>,
    timeout: Duration,
    user_id: UserId,
) -> Result<UserCredits, ActorError> {
    let actor = resolve_actor(supervisor, timeout, user_id).await?;
    call_actor(&actor, timeout, |reply| UserMessage::GetCredits { reply }).await
}

pub(crate) async fn dispatch_grant(
    supervisor: &ActorRef<SupervisorMessage>,
    timeout: Duration,
    user_id: UserId,
    grant: GrantMap,
    source_event_id: Option<String>,
) -> Result<UserCredits, ActorError> {
    let actor = resolve_actor(supervisor, timeout, user_id).await?;
    call_actor(&actor, timeout, |reply| UserMessage::Grant {
        grant,
        source_event_id,
        reply,
    })
    .await?
}

pub(crate) async fn dispatch_complete_job(
    supervisor: &ActorRef<SupervisorMessage>,
    timeout: Duration,
    job: JobComplete,
) -> Result<(), ActorError> {
    let actor = resolve_actor(supervisor, timeout, job.user_id).await?;
    call_actor(&actor, timeout, |reply| UserMessage::CompleteJob {
        job,
        reply,
    })
    .await?
}

/// Transport that loops every "remote" call back to the local supervisor.
///
/// Useful for single-process clusters in tests; a real deployment swaps in
/// an adapter over its RPC fabric.
pub struct LoopbackTransport {
    supervisor: ActorRef<SupervisorMessage>,
    call_timeout: Duration,
}

impl LoopbackTransport {
    pub fn new(supervisor: ActorRef<SupervisorMessage>, call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            call_timeout,
        })
    }
}

#[async_trait]
impl NodeTransport for LoopbackTransport {
    async fn get_credits(
        &self,
        _node: &NodeId,
        user_id: UserId,
    ) -> Result<UserCredits, ActorError> {
        dispatch_get(&self.supervisor, self.call_timeout, user_id).await
    }

    async fn grant(
        &self,
        _node: &NodeId,
        user_id: UserId,
        grant: GrantMap,
        source_event_id: Option<String>,
    ) -> Result<UserCredits, ActorError> {
        dispatch_grant(
            &self.supervisor,
            self.call_timeout,
            user_id,
            grant,
            source_event_id,
        )
        .await
    }

    async fn complete_job(&self, _node: &NodeId, job: JobComplete) -> Result<(), ActorError> {
        dispatch_complete_job(&self.supervisor, self.call_timeout, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_node_id_wins_duplicates() {
        let claimants = vec![
            NodeId::new("node-c"),
            NodeId::new("node-a"),
            NodeId::new("node-b"),
        ];
        assert_eq!(
            ActorRouter::resolve_winner(&claimants).unwrap().as_str(),
            "node-a"
        );
        assert!(ActorRouter::resolve_winner(&[]).is_none());
    }
}
