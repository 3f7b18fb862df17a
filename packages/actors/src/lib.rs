//! Actor system for the credit ledger.
//!
//! This crate provides the ractor-based actor system that keeps every
//! user's balance behind exactly one single-threaded writer:
//!
//! - `UserActor` - one per active user; serializes mutations, schedules
//!   expiration, releases itself when idle
//! - `NodeSupervisor` - owns the user actors placed on this node
//! - `ActorRouter` - consistent-hash routing across the cluster, with
//!   membership updates and duplicate resolution
//!
//! # Usage
//!
//! ```ignore
//! use actors::{NodeSupervisorArgs, RouterConfig, start_supervisor, ActorRouter};
//!
//! let (supervisor, _handle) = start_supervisor(NodeSupervisorArgs { .. }).await?;
//! let router = ActorRouter::new(RouterConfig::new(node_id), supervisor);
//! let credits = router.get_credits(user_id).await?;
//! ```

mod membership;
mod messages;
mod ring;
mod router;
mod supervisor;
mod user_actor;

pub use membership::{ChannelMembership, MembershipEvent, MembershipWatcher, StaticMembership};
pub use messages::{ActorError, SupervisorMessage, UserMessage};
pub use ring::{DEFAULT_VNODES, HashRing, NodeId};
pub use router::{ActorRouter, LoopbackTransport, NodeTransport, RouterConfig};
pub use supervisor::{NodeSupervisor, NodeSupervisorArgs, start_supervisor};
pub use user_actor::{UserActor, UserActorArgs};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort, concurrency};
