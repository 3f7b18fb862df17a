mod common;

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use credits_core::{CapTable, UserCredits, UserId};
use serde_json::json;

use actors::{Actor, ActorRouter, NodeId, NodeSupervisor, NodeSupervisorArgs, RouterConfig};
use pipeline::{BusSubscription, InMemoryBus, PipelineConfig, PipelineHandle};

async fn start_node() -> Arc<ActorRouter> {
    let (supervisor, _handle) = Actor::spawn(
        None,
        NodeSupervisor,
        NodeSupervisorArgs {
            caps: CapTable::default(),
            idle_timeout: Duration::from_secs(3600),
        },
    )
    .await
    .expect("failed to spawn supervisor");

    ActorRouter::new(
        RouterConfig::new(NodeId::new("node-a")).with_call_timeout(Duration::from_secs(5)),
        supervisor,
    )
}

fn start_pipeline(router: Arc<ActorRouter>) -> (InMemoryBus, PipelineHandle) {
    let bus = InMemoryBus::new();
    // Two competing subscriptions, as a two-producer deployment would open.
    let subscriptions: Vec<Box<dyn BusSubscription>> =
        vec![Box::new(bus.subscribe()), Box::new(bus.subscribe())];
    let handle = pipeline::start(
        PipelineConfig {
            processors: 4,
            max_demand: 16,
        },
        subscriptions,
        router,
    );
    (bus, handle)
}

fn publish_json(bus: &InMemoryBus, topic: &str, body: serde_json::Value) {
    bus.publish(topic, serde_json::to_vec(&body).unwrap());
}

async fn wait_for(
    router: &ActorRouter,
    user_id: UserId,
    pred: impl Fn(&UserCredits) -> bool,
) -> UserCredits {
    for _ in 0..100 {
        if let Ok(credits) = router.get_credits(user_id).await
            && pred(&credits)
        {
            return credits;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("pipeline never reached the expected balance");
}

#[test]
fn entitlements_and_jobs_flow_end_to_end() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;
    let router = start_node().await;
    let (bus, pipeline) = start_pipeline(router.clone());

    let user_id = UserId::new();
    publish_json(
        &bus,
        pipeline::TOPIC_ENTITLEMENTS,
        json!({
            "id": "evt-grant-1",
            "user_id": user_id.to_string(),
            "entitlements": [
                { "kind": "credits", "bucket": "trial", "amount": { "hours": 1 } },
            ],
        }),
    );
    wait_for(&router, user_id, |c| c.trial == 3_600_000).await;

    // Cost 600000 of an unknown type caps at 300000.
    publish_json(
        &bus,
        pipeline::TOPIC_JOBS_COMPLETE,
        json!({
            "id": "evt-job-1",
            "user_id": user_id.to_string(),
            "type": "render",
            "charge_credits": true,
            "cost": 600_000,
        }),
    );
    let credits = wait_for(&router, user_id, |c| c.trial == 3_300_000).await;
    assert_eq!(credits.permanent, 0);

    pipeline.abort();
    Ok(())
    })
}

#[test]
fn duplicate_events_are_applied_once() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;
    let router = start_node().await;
    let (bus, pipeline) = start_pipeline(router.clone());

    let user_id = UserId::new();
    let body = json!({
        "id": "evt-dup-1",
        "user_id": user_id.to_string(),
        "entitlements": [
            { "kind": "credits", "bucket": "permanent", "amount": { "minutes": 1 } },
        ],
    });

    publish_json(&bus, pipeline::TOPIC_ENTITLEMENTS, body.clone());
    wait_for(&router, user_id, |c| c.permanent == 60_000).await;

    // The same event id redelivered must not grant twice.
    publish_json(&bus, pipeline::TOPIC_ENTITLEMENTS, body);
    tokio::time::sleep(Duration::from_millis(400)).await;

    let credits = router.get_credits(user_id).await?;
    assert_eq!(credits.permanent, 60_000);

    pipeline.abort();
    Ok(())
    })
}

#[test]
fn poison_messages_are_dropped_not_retried() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;
    let router = start_node().await;
    let (bus, pipeline) = start_pipeline(router.clone());

    // None of these may wedge the pipeline: broken JSON, a bad user id,
    // a topic nobody handles.
    bus.publish(pipeline::TOPIC_JOBS_COMPLETE, &b"{not json"[..]);
    publish_json(
        &bus,
        pipeline::TOPIC_JOBS_COMPLETE,
        json!({ "id": "evt-bad-user", "user_id": "not-a-user", "type": "render", "cost": 1000 }),
    );
    publish_json(
        &bus,
        "billing.unrelated",
        json!({ "user_id": "whatever" }),
    );

    // A healthy message behind them still lands.
    let user_id = UserId::new();
    publish_json(
        &bus,
        pipeline::TOPIC_ENTITLEMENTS,
        json!({
            "user_id": user_id.to_string(),
            "entitlements": [
                { "kind": "credits", "bucket": "trial", "amount": { "seconds": 5 } },
            ],
        }),
    );
    wait_for(&router, user_id, |c| c.trial == 5_000).await;

    pipeline.abort();
    Ok(())
    })
}

#[test]
fn malformed_entitlement_entries_contribute_nothing() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;
    let router = start_node().await;
    let (bus, pipeline) = start_pipeline(router.clone());

    let user_id = UserId::new();
    publish_json(
        &bus,
        pipeline::TOPIC_ENTITLEMENTS,
        json!({
            "user_id": user_id.to_string(),
            "entitlements": [
                "not an entitlement",
                { "kind": "subscription", "bucket": "trial", "amount": { "hours": 2 } },
                { "kind": "credits", "bucket": "expiring", "amount": { "minutes": 30 },
                  "expires": { "days": 7 } },
            ],
        }),
    );

    let credits = wait_for(&router, user_id, |c| !c.expiring.is_empty()).await;
    assert_eq!(credits.trial, 0);
    assert_eq!(credits.expiring.len(), 1);
    assert_eq!(credits.expiring[0].amount, 1_800_000);

    pipeline.abort();
    Ok(())
    })
}
