//! Job-completion messages and per-type cost caps.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::credits::UserId;

/// Cap applied to job types without an explicit entry: five minutes.
pub const DEFAULT_COST_CAP_MS: i64 = 300_000;

fn default_charge() -> bool {
    true
}

/// A completed job as delivered on the `jobs.complete` topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobComplete {
    /// Source event id, used by the idempotency hook when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// The user to charge.
    pub user_id: UserId,
    /// Job type, used to look up the cost cap.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Whether this job debits credits at all.
    #[serde(default = "default_charge")]
    pub charge_credits: bool,
    /// Cost in milliseconds, capped per job type before charging.
    #[serde(default)]
    pub cost: i64,
}

impl JobComplete {
    /// Create a charging completion message.
    pub fn new(user_id: UserId, job_type: impl Into<String>, cost: i64) -> Self {
        Self {
            id: None,
            user_id,
            job_type: job_type.into(),
            charge_credits: true,
            cost,
        }
    }

    /// Attach a source event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Static mapping from job type to the maximum milliseconds one job of that
/// type may cost.
#[derive(Debug, Clone)]
pub struct CapTable {
    caps: HashMap<String, i64>,
    default_cap: i64,
}

impl CapTable {
    /// Create a table with the given fallback cap.
    pub fn new(default_cap: i64) -> Self {
        Self {
            caps: HashMap::new(),
            default_cap,
        }
    }

    /// Register a cap for a job type.
    pub fn with_cap(mut self, job_type: impl Into<String>, cap_ms: i64) -> Self {
        self.caps.insert(job_type.into(), cap_ms);
        self
    }

    /// The cap for a job type, falling back to the default.
    pub fn cap_for(&self, job_type: &str) -> i64 {
        self.caps.get(job_type).copied().unwrap_or(self.default_cap)
    }

    /// Clamp a cost to the cap for its job type.
    pub fn clamp(&self, job_type: &str, cost: i64) -> i64 {
        cost.min(self.cap_for(job_type))
    }
}

impl Default for CapTable {
    fn default() -> Self {
        Self::new(DEFAULT_COST_CAP_MS)
    }
}
