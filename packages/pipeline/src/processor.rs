//! Processor pool: decode, validate, dispatch, translate ack/nack.
//!
//! Error translation follows a fixed taxonomy: transient failures (routing
//! timeout, persistence failure, actor stopped mid-flight) nack so the bus
//! redelivers; poison messages (undecodable bodies, bad user ids, unknown
//! payload shapes) are logged and acked so they are never retried.

use std::sync::Arc;

use actors::ActorRouter;
use chrono::Utc;
use credits_core::{Entitlement, JobComplete, UserId, entitlements_to_grant};
use db::repositories::ChangeLogRepository;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::bus::{AckHandle, BusSubscription, Delivery};
use crate::producer::run_producer;

/// Topic carrying completed jobs to debit.
pub const TOPIC_JOBS_COMPLETE: &str = "jobs.complete";
/// Topic carrying entitlement batches to grant.
pub const TOPIC_ENTITLEMENTS: &str = "entitlements.credits";

/// Pipeline sizing.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of processor workers (10-100 in production).
    pub processors: usize,
    /// Capacity of the producer->processor channel.
    pub max_demand: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processors: 10,
            max_demand: 64,
        }
    }
}

/// Handles for a running pipeline.
pub struct PipelineHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// Wait for every producer and processor to finish (subscriptions
    /// closed and channel drained).
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }

    /// Abort all pipeline tasks.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Start producers (one per subscription) and the processor pool.
pub fn start(
    config: PipelineConfig,
    subscriptions: Vec<Box<dyn BusSubscription>>,
    router: Arc<ActorRouter>,
) -> PipelineHandle {
    let (tx, rx) = mpsc::channel(config.max_demand.max(1));
    let rx = Arc::new(Mutex::new(rx));

    let mut tasks = Vec::new();

    for subscription in subscriptions {
        tasks.push(tokio::spawn(run_producer(subscription, tx.clone())));
    }
    drop(tx);

    for index in 0..config.processors.max(1) {
        let rx = rx.clone();
        let router = router.clone();
        tasks.push(tokio::spawn(async move {
            run_processor(index, rx, router).await;
        }));
    }

    PipelineHandle { tasks }
}

async fn run_processor(
    index: usize,
    rx: Arc<Mutex<mpsc::Receiver<Delivery>>>,
    router: Arc<ActorRouter>,
) {
    tracing::debug!("Processor {} started", index);
    loop {
        let delivery = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(delivery) = delivery else {
            break;
        };
        process_delivery(&router, delivery).await;
    }
    tracing::debug!("Processor {} stopped", index);
}

/// Decode and dispatch one delivery, settling its ack handle.
pub async fn process_delivery(router: &ActorRouter, delivery: Delivery) {
    let Delivery { topic, body, acker } = delivery;

    let value: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Dropping undecodable message on {}: {}", topic, e);
            acker.ack().await;
            return;
        }
    };

    match topic.as_str() {
        TOPIC_JOBS_COMPLETE => handle_job(router, value, acker).await,
        TOPIC_ENTITLEMENTS => handle_entitlements(router, value, acker).await,
        other => {
            tracing::debug!("Ignoring message on unhandled topic: {}", other);
            acker.ack().await;
        }
    }
}

/// Record the event id before dispatch, handing the ack handle back when
/// the caller should proceed.
///
/// A duplicate id acks without touching the actor; a change-log failure
/// nacks, since dedup cannot be verified.
async fn claim_event(
    event_id: Option<&str>,
    user_id: UserId,
    topic: &str,
    acker: AckHandle,
) -> Option<AckHandle> {
    let Some(event_id) = event_id else {
        return Some(acker);
    };

    match ChangeLogRepository::record_if_new(event_id, user_id, topic).await {
        Ok(true) => Some(acker),
        Ok(false) => {
            tracing::info!("Skipping duplicate event {} on {}", event_id, topic);
            acker.ack().await;
            None
        }
        Err(e) => {
            tracing::warn!("Change log unavailable for event {}: {}", event_id, e);
            acker.nack().await;
            None
        }
    }
}

/// Undo a claimed event id after a transient dispatch failure, so the
/// redelivered message is not skipped as a duplicate.
async fn release_event(event_id: Option<&str>) {
    if let Some(event_id) = event_id
        && let Err(e) = ChangeLogRepository::remove(event_id).await
    {
        tracing::warn!("Failed to release event {}: {}", event_id, e);
    }
}

async fn handle_job(router: &ActorRouter, value: Value, acker: AckHandle) {
    let job: JobComplete = match serde_json::from_value(value) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!("Dropping malformed job completion: {}", e);
            acker.ack().await;
            return;
        }
    };

    let event_id = job.id.clone();
    let Some(acker) =
        claim_event(event_id.as_deref(), job.user_id, TOPIC_JOBS_COMPLETE, acker).await
    else {
        return;
    };

    match router.complete_job(job).await {
        Ok(()) => acker.ack().await,
        Err(e) => {
            tracing::warn!("Job completion failed, nacking for redelivery: {}", e);
            release_event(event_id.as_deref()).await;
            acker.nack().await;
        }
    }
}

/// Body shape of `entitlements.credits` messages.
#[derive(Debug, Deserialize)]
struct EntitlementsBody {
    #[serde(default)]
    id: Option<String>,
    user_id: UserId,
    #[serde(default)]
    entitlements: Vec<Value>,
}

async fn handle_entitlements(router: &ActorRouter, value: Value, acker: AckHandle) {
    let body: EntitlementsBody = match serde_json::from_value(value) {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("Dropping malformed entitlements message: {}", e);
            acker.ack().await;
            return;
        }
    };

    // Entries decode individually; a malformed one contributes nothing
    // rather than poisoning the batch.
    let entitlements: Vec<Entitlement> = body
        .entitlements
        .iter()
        .filter_map(|entry| match serde_json::from_value(entry.clone()) {
            Ok(entitlement) => Some(entitlement),
            Err(e) => {
                tracing::warn!("Skipping malformed entitlement for {}: {}", body.user_id, e);
                None
            }
        })
        .collect();

    let grant = entitlements_to_grant(body.user_id, &entitlements, Utc::now());
    if grant.is_empty() {
        acker.ack().await;
        return;
    }

    let Some(acker) =
        claim_event(body.id.as_deref(), body.user_id, TOPIC_ENTITLEMENTS, acker).await
    else {
        return;
    };

    match router.grant(body.user_id, grant, body.id.clone()).await {
        Ok(_) => acker.ack().await,
        Err(e) => {
            tracing::warn!("Grant failed, nacking for redelivery: {}", e);
            release_event(body.id.as_deref()).await;
            acker.nack().await;
        }
    }
}
