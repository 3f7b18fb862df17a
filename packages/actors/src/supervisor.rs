//! Node-local supervisor owning the user actors placed on this node.
//!
//! Actors are spawned lazily on first reference and prune themselves from
//! the supervisor's map via supervision events when they stop (idle
//! shutdown, conflict, failure).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use credits_core::{CapTable, CreditEvent, UserId};
use ractor::{Actor, ActorProcessingErr, ActorRef, SupervisionEvent};
use tokio::sync::broadcast;

use crate::messages::{ActorError, SupervisorMessage, UserMessage};
use crate::user_actor::{UserActor, UserActorArgs};

fn actor_name(user_id: UserId) -> String {
    format!("user-{}", user_id)
}

/// State for the supervisor actor.
pub struct NodeSupervisorState {
    /// Running user actors by id.
    users: HashMap<UserId, ActorRef<UserMessage>>,
    /// Cost caps shared with every spawned actor.
    caps: Arc<CapTable>,
    /// Idle timeout handed to every spawned actor.
    idle_timeout: Duration,
    /// Event broadcaster.
    event_tx: broadcast::Sender<CreditEvent>,
}

/// Arguments for the supervisor.
pub struct NodeSupervisorArgs {
    pub caps: CapTable,
    pub idle_timeout: Duration,
}

async fn spawn_user_actor(
    myself: &ActorRef<SupervisorMessage>,
    state: &mut NodeSupervisorState,
    user_id: UserId,
) -> Result<ActorRef<UserMessage>, ActorError> {
    let args = UserActorArgs {
        user_id,
        caps: state.caps.clone(),
        idle_timeout: state.idle_timeout,
        event_tx: Some(state.event_tx.clone()),
    };

    match Actor::spawn_linked(Some(actor_name(user_id)), UserActor, args, myself.get_cell()).await
    {
        Ok((actor, _handle)) => {
            state.users.insert(user_id, actor.clone());
            Ok(actor)
        }
        Err(e) => {
            // A racing spawn can win the name; use whoever holds it now.
            if let Some(cell) = ractor::registry::where_is(actor_name(user_id)) {
                let actor = ActorRef::<UserMessage>::from(cell);
                state.users.insert(user_id, actor.clone());
                Ok(actor)
            } else {
                Err(ActorError::Spawn(e.to_string()))
            }
        }
    }
}

/// Supervisor actor that manages all user actors on this node.
pub struct NodeSupervisor;

impl Actor for NodeSupervisor {
    type Msg = SupervisorMessage;
    type State = NodeSupervisorState;
    type Arguments = NodeSupervisorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting user actor supervisor");

        let (event_tx, _) = broadcast::channel(1024);
        Ok(NodeSupervisorState {
            users: HashMap::new(),
            caps: Arc::new(args.caps),
            idle_timeout: args.idle_timeout,
            event_tx,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            SupervisorMessage::Resolve { user_id, reply } => {
                let running = state.users.get(&user_id).cloned();
                let actor = match running {
                    Some(actor) => Ok(actor),
                    None => spawn_user_actor(&myself, state, user_id).await,
                };
                let _ = reply.send(actor);
            }

            SupervisorMessage::Lookup { user_id, reply } => {
                let _ = reply.send(state.users.get(&user_id).cloned());
            }

            SupervisorMessage::ListUsers { reply } => {
                let _ = reply.send(state.users.keys().copied().collect());
            }

            SupervisorMessage::StopUser { user_id } => {
                if let Some(actor) = state.users.get(&user_id) {
                    let _ = actor.send_message(UserMessage::Shutdown);
                }
            }

            SupervisorMessage::Subscribe { sender } => {
                // Forward from our channel to the subscriber's.
                let mut rx = state.event_tx.subscribe();
                tokio::spawn(async move {
                    while let Ok(event) = rx.recv().await {
                        if sender.send(event).is_err() {
                            break;
                        }
                    }
                });
            }

            SupervisorMessage::BroadcastEvent { event } => {
                let _ = state.event_tx.send(event);
            }

            SupervisorMessage::Shutdown => {
                tracing::info!("Shutting down user actor supervisor");
                for actor in state.users.values() {
                    let _ = actor.send_message(UserMessage::Shutdown);
                }
                myself.stop(None);
                return Ok(());
            }
        }

        Ok(())
    }

    async fn handle_supervisor_evt(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: SupervisionEvent,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let cell = match &message {
            SupervisionEvent::ActorTerminated(cell, _, reason) => {
                tracing::info!(
                    "User actor {} terminated: {:?}",
                    cell.get_name().unwrap_or_default(),
                    reason
                );
                cell
            }
            SupervisionEvent::ActorFailed(cell, error) => {
                tracing::warn!(
                    "User actor {} failed: {}",
                    cell.get_name().unwrap_or_default(),
                    error
                );
                cell
            }
            _ => return Ok(()),
        };

        if let Some(name) = cell.get_name()
            && let Some(raw) = name.strip_prefix("user-")
            && let Ok(user_id) = UserId::parse(raw)
            && state
                .users
                .get(&user_id)
                .is_some_and(|a| a.get_id() == cell.get_id())
        {
            state.users.remove(&user_id);
        }

        Ok(())
    }
}

/// Start the supervisor with the given caps and idle timeout.
pub async fn start_supervisor(
    args: NodeSupervisorArgs,
) -> Result<(ActorRef<SupervisorMessage>, tokio::task::JoinHandle<()>), ractor::SpawnErr> {
    let (actor, handle) =
        Actor::spawn(Some("user-supervisor".to_string()), NodeSupervisor, args).await?;

    Ok((actor, handle))
}
