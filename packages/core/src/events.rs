//! Change events emitted for downstream audit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::credits::{UserCredits, UserId};

/// Per-bucket signed change between two balances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketDelta {
    pub trial: i64,
    pub expiring: i64,
    pub permanent: i64,
}

impl BucketDelta {
    /// Difference `after - before`, bucket by bucket.
    pub fn between(before: &UserCredits, after: &UserCredits) -> Self {
        let sum = |c: &UserCredits| c.expiring.iter().map(|t| t.amount).sum::<i64>();
        Self {
            trial: after.trial - before.trial,
            expiring: sum(after) - sum(before),
            permanent: after.permanent - before.permanent,
        }
    }

    /// Net change across all buckets.
    pub fn total(&self) -> i64 {
        self.trial + self.expiring + self.permanent
    }
}

/// Events emitted by user actors after each persisted mutation.
///
/// Optional: correctness never depends on them, but downstream audit can
/// subscribe to the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CreditEvent {
    /// Credits were granted from an entitlement batch.
    Granted {
        user_id: UserId,
        delta: BucketDelta,
        source_event_id: Option<String>,
        timestamp: DateTime<Utc>,
    },
    /// Credits were debited by a completed job.
    Charged {
        user_id: UserId,
        delta: BucketDelta,
        source_event_id: Option<String>,
        /// Cost the balance could not cover; charged-what-they-had.
        remainder: i64,
        timestamp: DateTime<Utc>,
    },
    /// Expired tranches were dropped.
    Expired {
        user_id: UserId,
        delta: BucketDelta,
        timestamp: DateTime<Utc>,
    },
}

impl CreditEvent {
    /// Get the user this event is about.
    pub fn user_id(&self) -> UserId {
        match self {
            CreditEvent::Granted { user_id, .. } => *user_id,
            CreditEvent::Charged { user_id, .. } => *user_id,
            CreditEvent::Expired { user_id, .. } => *user_id,
        }
    }

    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            CreditEvent::Granted { timestamp, .. } => *timestamp,
            CreditEvent::Charged { timestamp, .. } => *timestamp,
            CreditEvent::Expired { timestamp, .. } => *timestamp,
        }
    }

    /// Short description for logging.
    pub fn description(&self) -> String {
        match self {
            CreditEvent::Granted { user_id, delta, .. } => {
                format!("granted {}ms to {}", delta.total(), user_id)
            }
            CreditEvent::Charged {
                user_id,
                delta,
                remainder,
                ..
            } => {
                if *remainder > 0 {
                    format!(
                        "charged {}ms to {} ({}ms uncovered)",
                        -delta.total(),
                        user_id,
                        remainder
                    )
                } else {
                    format!("charged {}ms to {}", -delta.total(), user_id)
                }
            }
            CreditEvent::Expired { user_id, delta, .. } => {
                format!("expired {}ms from {}", -delta.total(), user_id)
            }
        }
    }
}
