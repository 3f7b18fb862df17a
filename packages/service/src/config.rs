//! Service configuration, read once from the environment at startup.

use std::time::Duration;

use actors::NodeId;
use credits_core::{CapTable, DEFAULT_COST_CAP_MS};
use db::DbConfig;
use pipeline::PipelineConfig;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// One bus subscription to open.
#[derive(Debug, Clone)]
pub struct BusSubscriptionConfig {
    pub subject: String,
    pub queue_group: Option<String>,
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Per-job-type cost caps.
    pub caps: CapTable,
    /// Producer tasks to run against the bus.
    pub producer_concurrency: usize,
    /// Processor workers.
    pub processor_concurrency: usize,
    /// Producer->processor channel capacity.
    pub max_demand: usize,
    /// Idle timeout before a user actor releases itself.
    pub idle_timeout: Duration,
    /// Per-request routing timeout.
    pub call_timeout: Duration,
    /// Opaque selector handed to the discovery collaborator.
    pub membership_selector: String,
    /// This node's identity in the ring.
    pub node_id: NodeId,
    /// Peer node identities known at startup (static membership).
    pub peers: Vec<NodeId>,
    /// Bus endpoint; `memory` runs the in-process bus for local dev.
    pub bus_endpoint: String,
    /// Subscriptions to open on the bus.
    pub subscriptions: Vec<BusSubscriptionConfig>,
    /// Authoritative store.
    pub db: DbConfig,
    /// Legacy document store, while tenants remain unmigrated.
    pub legacy: Option<DbConfig>,
}

impl Config {
    /// Build a config from environment variables.
    ///
    /// Recognized variables:
    /// - `CAPS` (e.g. `transcribe=60000,render=120000`), `CAP_DEFAULT_MS`
    /// - `PRODUCER_CONCURRENCY`, `PROCESSOR_CONCURRENCY`, `PROCESSOR_MAX_DEMAND`
    /// - `IDLE_TIMEOUT_MS` (default 3600000), `CALL_TIMEOUT_MS` (default 5000)
    /// - `MEMBERSHIP_SELECTOR`, `NODE_ID` (default `node-1`), `CLUSTER_PEERS`
    /// - `BUS_ENDPOINT` (default `memory`), `BUS_SUBSCRIPTIONS`
    ///   (`subject[:queue_group]` comma list)
    /// - `DB_ENDPOINT` (default `mem://`), `DB_NAMESPACE`, `DB_DATABASE`,
    ///   `DB_POOL_SIZE`, `DB_USER`/`DB_PASS`
    /// - `LEGACY_DB_ENDPOINT` (unset disables the legacy store),
    ///   `LEGACY_DB_NAMESPACE`, `LEGACY_DB_DATABASE`, `LEGACY_DB_POOL_SIZE`
    pub fn from_env() -> Result<Self, ConfigError> {
        let caps = read_caps()?;

        let node_id = NodeId::new(env_or("NODE_ID", "node-1"));
        let peers = env_non_empty("CLUSTER_PEERS")
            .map(|raw| raw.split(',').map(|p| NodeId::new(p.trim())).collect())
            .unwrap_or_default();

        Ok(Self {
            caps,
            producer_concurrency: parse_usize("PRODUCER_CONCURRENCY", 1)?,
            processor_concurrency: parse_usize("PROCESSOR_CONCURRENCY", 10)?,
            max_demand: parse_usize("PROCESSOR_MAX_DEMAND", 64)?,
            idle_timeout: Duration::from_millis(parse_u64("IDLE_TIMEOUT_MS", 3_600_000)?),
            call_timeout: Duration::from_millis(parse_u64("CALL_TIMEOUT_MS", 5_000)?),
            membership_selector: env_or("MEMBERSHIP_SELECTOR", ""),
            node_id,
            peers,
            bus_endpoint: env_or("BUS_ENDPOINT", "memory"),
            subscriptions: read_subscriptions(),
            db: read_db_config("DB", "mem://", 10)?,
            legacy: read_legacy_config()?,
        })
    }

    /// Sizing for the event pipeline.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            processors: self.processor_concurrency,
            max_demand: self.max_demand,
        }
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_or(name: &str, default: &str) -> String {
    env_non_empty(name).unwrap_or_else(|| default.to_string())
}

fn parse_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match env_non_empty(name) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{}={} is not an integer", name, raw))),
    }
}

fn parse_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    Ok(parse_u64(name, default as u64)? as usize)
}

/// Parse `CAPS`, a `job_type=ms` comma list.
fn read_caps() -> Result<CapTable, ConfigError> {
    let default_cap = parse_u64("CAP_DEFAULT_MS", DEFAULT_COST_CAP_MS as u64)? as i64;
    let mut caps = CapTable::new(default_cap);

    if let Some(raw) = env_non_empty("CAPS") {
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (job_type, cap) = entry.split_once('=').ok_or_else(|| {
                ConfigError::Invalid(format!("CAPS entry {:?} is not job_type=ms", entry))
            })?;
            let cap_ms: i64 = cap.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("CAPS entry {:?} has a bad cap", entry))
            })?;
            caps = caps.with_cap(job_type.trim(), cap_ms);
        }
    }

    Ok(caps)
}

/// Parse `BUS_SUBSCRIPTIONS`, a `subject[:queue_group]` comma list.
fn read_subscriptions() -> Vec<BusSubscriptionConfig> {
    let raw = env_or(
        "BUS_SUBSCRIPTIONS",
        "jobs.complete:ledger,entitlements.credits:ledger",
    );

    raw.split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (subject, queue_group) = match entry.split_once(':') {
                Some((subject, group)) => (subject, Some(group.to_string())),
                None => (entry, None),
            };
            Some(BusSubscriptionConfig {
                subject: subject.to_string(),
                queue_group,
            })
        })
        .collect()
}

fn read_db_config(prefix: &str, default_endpoint: &str, default_pool: u32) -> Result<DbConfig, ConfigError> {
    let var = |suffix: &str| env_non_empty(&format!("{}_{}", prefix, suffix));

    let mut config = DbConfig::remote(var("ENDPOINT").unwrap_or_else(|| default_endpoint.to_string()));
    if let Some(namespace) = var("NAMESPACE") {
        config = config.with_namespace(namespace);
    }
    if let Some(database) = var("DATABASE") {
        config = config.with_database(database);
    }
    config = config.with_pool_size(
        parse_u64(&format!("{}_POOL_SIZE", prefix), default_pool as u64)? as u32,
    );
    if let (Some(user), Some(pass)) = (var("USER"), var("PASS")) {
        config = config.with_credentials(user, pass);
    }

    Ok(config)
}

fn read_legacy_config() -> Result<Option<DbConfig>, ConfigError> {
    if env_non_empty("LEGACY_DB_ENDPOINT").is_none() {
        return Ok(None);
    }
    Ok(Some(read_db_config("LEGACY_DB", "mem://", 50)?))
}
