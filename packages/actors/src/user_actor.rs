//! Per-user actor holding the cached balance.
//!
//! One actor exists per active user; its mailbox serializes every mutation.
//! Each mutation runs the pure arithmetic, writes through the persistence
//! gateway, updates the cache and only then replies, so callers can ack the
//! originating bus delivery on reply. On a write failure the cache stays
//! untouched and the caller sees a typed error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use credits_core::{
    BucketDelta, CapTable, CreditEvent, GrantMap, JobComplete, UserCredits, UserId, arith,
};
use db::PersistenceGateway;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use tokio::sync::broadcast;

use crate::messages::{ActorError, UserMessage};

/// Delay before retrying an expiry pass whose write failed.
const EXPIRE_RETRY_DELAY: Duration = Duration::from_secs(30);

type TimerHandle =
    ractor::concurrency::JoinHandle<Result<(), ractor::MessagingErr<UserMessage>>>;

/// Arguments for spawning a user actor.
pub struct UserActorArgs {
    pub user_id: UserId,
    pub caps: Arc<CapTable>,
    pub idle_timeout: Duration,
    pub event_tx: Option<broadcast::Sender<CreditEvent>>,
}

/// State for a user actor.
pub struct UserActorState {
    user_id: UserId,
    /// Cached balance; only mutated after a successful write-through.
    credits: UserCredits,
    caps: Arc<CapTable>,
    idle_timeout: Duration,
    last_activity: Instant,
    /// Expiry the current timer is armed for, if any.
    next_expiration: Option<DateTime<Utc>>,
    expire_timer: Option<TimerHandle>,
    idle_timer: Option<TimerHandle>,
    event_tx: Option<broadcast::Sender<CreditEvent>>,
}

impl UserActorState {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn broadcast(&self, event: CreditEvent) {
        if let Some(ref tx) = self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// Re-arm the expiration timer when the head of the expiring list moved.
    fn reschedule_expiration(&mut self, myself: &ActorRef<UserMessage>) {
        let head = self.credits.next_expiration();
        if head == self.next_expiration {
            return;
        }

        if let Some(timer) = self.expire_timer.take() {
            timer.abort();
        }
        self.next_expiration = head;

        if let Some(at) = head {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.expire_timer = Some(myself.send_after(delay, || UserMessage::Expire));
        }
    }

    fn arm_expire_retry(&mut self, myself: &ActorRef<UserMessage>) {
        if let Some(timer) = self.expire_timer.take() {
            timer.abort();
        }
        self.expire_timer = Some(myself.send_after(EXPIRE_RETRY_DELAY, || UserMessage::Expire));
    }

    async fn apply_grant(
        &mut self,
        grant: GrantMap,
        source_event_id: Option<String>,
    ) -> Result<UserCredits, ActorError> {
        if grant.is_empty() {
            return Ok(self.credits.clone());
        }

        let next = arith::grant(self.credits.clone(), &grant);
        let stored = PersistenceGateway::update(&next)
            .await
            .map_err(|e| ActorError::Database(e.to_string()))?;

        let delta = BucketDelta::between(&self.credits, &stored);
        self.credits = stored;
        self.broadcast(CreditEvent::Granted {
            user_id: self.user_id,
            delta,
            source_event_id,
            timestamp: Utc::now(),
        });

        Ok(self.credits.clone())
    }

    async fn apply_job(&mut self, job: JobComplete) -> Result<(), ActorError> {
        if job.user_id != self.user_id {
            tracing::warn!(
                "Dropping job {:?} addressed to user {} on actor for {}",
                job.id,
                job.user_id,
                self.user_id
            );
            return Ok(());
        }

        if !job.charge_credits {
            return Ok(());
        }

        let capped = self.caps.clamp(&job.job_type, job.cost);
        if job.cost > capped {
            tracing::warn!(
                "Capping job {:?} of type {} from {}ms to {}ms for user {}",
                job.id,
                job.job_type,
                job.cost,
                capped,
                self.user_id
            );
        }

        // Zero (or negative) cost: nothing to charge, nothing to write.
        let Some((next, remainder)) = arith::deduct(self.credits.clone(), capped) else {
            return Ok(());
        };

        if remainder > 0 {
            tracing::warn!(
                "User {} balance covered only {}ms of job {:?} ({}ms uncovered)",
                self.user_id,
                capped - remainder,
                job.id,
                remainder
            );
        }

        let stored = PersistenceGateway::update(&next)
            .await
            .map_err(|e| ActorError::Database(e.to_string()))?;

        let delta = BucketDelta::between(&self.credits, &stored);
        self.credits = stored;
        self.broadcast(CreditEvent::Charged {
            user_id: self.user_id,
            delta,
            source_event_id: job.id,
            remainder,
            timestamp: Utc::now(),
        });

        Ok(())
    }
}

/// Actor owning one user's balance.
pub struct UserActor;

impl Actor for UserActor {
    type Msg = UserMessage;
    type State = UserActorState;
    type Arguments = UserActorArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let credits = PersistenceGateway::fetch(args.user_id).await.map_err(|e| {
            ActorProcessingErr::from(format!("Failed to hydrate user {}: {}", args.user_id, e))
        })?;

        tracing::info!("Starting user actor: {}", args.user_id);

        Ok(UserActorState {
            user_id: args.user_id,
            credits,
            caps: args.caps,
            idle_timeout: args.idle_timeout,
            last_activity: Instant::now(),
            next_expiration: None,
            expire_timer: None,
            idle_timer: None,
            event_tx: args.event_tx,
        })
    }

    async fn post_start(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.reschedule_expiration(&myself);
        state.idle_timer = Some(myself.send_after(state.idle_timeout, || UserMessage::IdleCheck));
        Ok(())
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            UserMessage::GetCredits { reply } => {
                state.touch();
                let _ = reply.send(state.credits.clone());
            }

            UserMessage::Grant {
                grant,
                source_event_id,
                reply,
            } => {
                state.touch();
                let result = state.apply_grant(grant, source_event_id).await;
                let _ = reply.send(result);
                state.reschedule_expiration(&myself);
            }

            UserMessage::CompleteJob { job, reply } => {
                state.touch();
                let result = state.apply_job(job).await;
                let _ = reply.send(result);
                state.reschedule_expiration(&myself);
            }

            UserMessage::Expire => {
                let now = Utc::now();
                let next = arith::expire(state.credits.clone(), now, false);

                if next.expiring.len() == state.credits.expiring.len() {
                    // Fired early or spuriously; nothing expired yet.
                    state.next_expiration = None;
                    state.reschedule_expiration(&myself);
                } else {
                    match PersistenceGateway::update(&next).await {
                        Ok(stored) => {
                            let delta = BucketDelta::between(&state.credits, &stored);
                            state.credits = stored;
                            state.broadcast(CreditEvent::Expired {
                                user_id: state.user_id,
                                delta,
                                timestamp: now,
                            });
                            state.next_expiration = None;
                            state.reschedule_expiration(&myself);
                        }
                        Err(e) => {
                            tracing::warn!(
                                "Expiry write failed for user {}, retrying in {:?}: {}",
                                state.user_id,
                                EXPIRE_RETRY_DELAY,
                                e
                            );
                            state.arm_expire_retry(&myself);
                        }
                    }
                }
            }

            UserMessage::IdleCheck => {
                let elapsed = state.last_activity.elapsed();
                if elapsed >= state.idle_timeout {
                    tracing::info!(
                        "User actor {} idle for {:?}, stopping",
                        state.user_id,
                        elapsed
                    );
                    myself.stop(Some("idle".to_string()));
                    return Ok(());
                }
                let remaining = state.idle_timeout - elapsed;
                state.idle_timer =
                    Some(myself.send_after(remaining, || UserMessage::IdleCheck));
            }

            UserMessage::Conflict => {
                tracing::warn!(
                    "User actor {} lost duplicate resolution, stopping without writing",
                    state.user_id
                );
                myself.stop(Some("name conflict".to_string()));
                return Ok(());
            }

            UserMessage::Shutdown => {
                tracing::info!("Shutting down user actor: {}", state.user_id);
                myself.stop(None);
                return Ok(());
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        if let Some(timer) = state.expire_timer.take() {
            timer.abort();
        }
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        Ok(())
    }
}
