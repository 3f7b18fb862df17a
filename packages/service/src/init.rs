//! Node initialization for the credit ledger.

use std::sync::Arc;

use actors::{
    ActorRef, ActorRouter, NodeSupervisorArgs, RouterConfig, StaticMembership,
    SupervisorMessage, start_supervisor,
};
use pipeline::{BusSubscription, InMemoryBus, PipelineHandle};

use crate::config::{Config, ConfigError};

/// Long-lived handles of a running node.
///
/// One supervisor and one router exist per node; everything that needs them
/// gets them from here rather than a process-global lookup.
pub struct LedgerNode {
    pub supervisor: ActorRef<SupervisorMessage>,
    pub router: Arc<ActorRouter>,
    pub pipeline: PipelineHandle,
    /// Publisher of the in-process bus, when running in `memory` mode.
    pub local_bus: Option<InMemoryBus>,
}

/// Initialize the node: stores, supervisor, router, membership, pipeline.
///
/// This should be called once at startup before handling any traffic.
pub async fn init_ledger(config: &Config) -> Result<LedgerNode, Box<dyn std::error::Error>> {
    tracing::info!("Initializing credit ledger node {}...", config.node_id);

    db::init(config.db.clone(), config.legacy.clone()).await?;

    let (supervisor, _handle) = start_supervisor(NodeSupervisorArgs {
        caps: config.caps.clone(),
        idle_timeout: config.idle_timeout,
    })
    .await?;

    let router_config =
        RouterConfig::new(config.node_id.clone()).with_call_timeout(config.call_timeout);
    let router = ActorRouter::new(router_config, supervisor.clone());

    // Static membership: this node plus any configured peers. A clustered
    // deployment replaces this with a watcher over the discovery
    // collaborator, selected by `membership_selector`.
    let mut members = vec![config.node_id.clone()];
    members.extend(config.peers.iter().cloned());
    if !config.membership_selector.is_empty() {
        tracing::info!(
            "Membership selector {:?} configured; static peers used until a discovery adapter is attached",
            config.membership_selector
        );
    }
    tokio::spawn(router.clone().run_membership(StaticMembership::new(members)));

    let (local_bus, subscriptions) = open_bus(config)?;

    let pipeline = pipeline::start(config.pipeline(), subscriptions, router.clone());

    tracing::info!(
        "Credit ledger node initialized ({} producers, {} processors, {} subscriptions)",
        config.producer_concurrency,
        config.processor_concurrency,
        config.subscriptions.len()
    );

    Ok(LedgerNode {
        supervisor,
        router,
        pipeline,
        local_bus,
    })
}

/// Open the configured bus with `producer_concurrency` competing
/// subscriptions; the pipeline runs one producer task per subscription.
///
/// `memory` is the only built-in endpoint; external buses plug in by
/// implementing [`BusSubscription`] over their own client.
fn open_bus(
    config: &Config,
) -> Result<(Option<InMemoryBus>, Vec<Box<dyn BusSubscription>>), ConfigError> {
    match config.bus_endpoint.as_str() {
        "memory" => {
            let bus = InMemoryBus::new();
            let subscriptions = (0..config.producer_concurrency.max(1))
                .map(|_| Box::new(bus.subscribe()) as Box<dyn BusSubscription>)
                .collect();
            Ok((Some(bus), subscriptions))
        }
        other => Err(ConfigError::Invalid(format!(
            "unsupported BUS_ENDPOINT={} (expected memory, or attach an external adapter)",
            other
        ))),
    }
}
