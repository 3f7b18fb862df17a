//! Message types for actor communication.

use credits_core::{CreditEvent, GrantMap, JobComplete, UserCredits, UserId};
use ractor::{ActorRef, RpcReplyPort};

/// Messages for a per-user actor.
///
/// Every mutation persists through the gateway before its reply is sent, so
/// a successful reply means the change is durable.
#[derive(Debug)]
pub enum UserMessage {
    /// Read the cached balance.
    GetCredits { reply: RpcReplyPort<UserCredits> },

    /// Apply a grant and reply with the new balance.
    Grant {
        grant: GrantMap,
        source_event_id: Option<String>,
        reply: RpcReplyPort<Result<UserCredits, ActorError>>,
    },

    /// Debit a completed job. The caller acks the bus delivery only after
    /// the reply arrives.
    CompleteJob {
        job: JobComplete,
        reply: RpcReplyPort<Result<(), ActorError>>,
    },

    /// Internal: the expiration timer fired.
    Expire,

    /// Internal: check whether the idle timeout has elapsed.
    IdleCheck,

    /// This actor lost a duplicate-name resolution; terminate without
    /// writing anything.
    Conflict,

    /// Drain the mailbox and stop.
    Shutdown,
}

/// Messages for the node-local supervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Get the actor for a user, spawning it on first reference.
    Resolve {
        user_id: UserId,
        reply: RpcReplyPort<Result<ActorRef<UserMessage>, ActorError>>,
    },

    /// Get the actor for a user only if it is already running.
    Lookup {
        user_id: UserId,
        reply: RpcReplyPort<Option<ActorRef<UserMessage>>>,
    },

    /// List users with a running actor on this node.
    ListUsers { reply: RpcReplyPort<Vec<UserId>> },

    /// Ask a user's actor to drain and exit (ownership moved away).
    StopUser { user_id: UserId },

    /// Subscribe to change events.
    Subscribe {
        sender: tokio::sync::broadcast::Sender<CreditEvent>,
    },

    /// Broadcast a change event to all subscribers.
    BroadcastEvent { event: CreditEvent },

    /// Shutdown all user actors.
    Shutdown,
}

/// Error type for actor operations.
///
/// All of these are transient from the pipeline's point of view: the
/// delivery is nacked and the bus redelivers. Terminal conditions (bad
/// payloads, mismatched users) never surface here; they are logged and
/// acked where they are detected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ActorError {
    #[error("Failed to spawn actor: {0}")]
    Spawn(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Actor stopped before replying")]
    Stopped,

    #[error("No transport to reach node: {0}")]
    Unroutable(String),
}
