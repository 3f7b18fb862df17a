//! Balance domain types for the credit ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a user, 128 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Ulid);

impl UserId {
    /// Create a new unique user ID.
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    /// Parse a user ID from a string.
    pub fn parse(s: &str) -> Result<Self, ulid::DecodeError> {
        Ok(Self(Ulid::from_string(s)?))
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One tranche of time-limited credits.
///
/// All quantities are milliseconds of service time. A tranche with
/// `amount == 0` or `expires_at <= now` is removed by the next arithmetic
/// pass over the balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiringCredit {
    /// Owner of this tranche.
    pub user_id: UserId,
    /// The amount granted at creation. Never changes after creation.
    pub initial: i64,
    /// Remaining amount, `0 <= amount <= initial`.
    pub amount: i64,
    /// When the tranche was granted.
    pub created_at: DateTime<Utc>,
    /// When the tranche stops being usable.
    pub expires_at: DateTime<Utc>,
    /// Opaque annotation, e.g. the name of the product that granted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ExpiringCredit {
    /// Create a fresh tranche with its full amount remaining.
    pub fn new(
        user_id: UserId,
        amount: i64,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            initial: amount,
            amount,
            created_at,
            expires_at,
            note: None,
        }
    }

    /// Attach an annotation to this tranche.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// A tranche expiring exactly at `now` counts as expired.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The balance record for one user, split across the three buckets.
///
/// Invariants: `trial >= 0`, `permanent >= 0`, every tranche amount `>= 0`,
/// and `expiring` is sorted ascending by `expires_at`. The arithmetic in
/// [`crate::arith`] preserves all of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCredits {
    /// Owner of this balance.
    pub user_id: UserId,
    /// Trial-bucket credits (milliseconds). Consumed first.
    pub trial: i64,
    /// Permanent credits (milliseconds). Consumed last.
    pub permanent: i64,
    /// Time-limited tranches, sorted ascending by expiry.
    pub expiring: Vec<ExpiringCredit>,
}

impl UserCredits {
    /// A zero balance for a user that has never been granted anything.
    pub fn zero(user_id: UserId) -> Self {
        Self {
            user_id,
            trial: 0,
            permanent: 0,
            expiring: Vec::new(),
        }
    }

    /// Sum across all three buckets.
    pub fn total(&self) -> i64 {
        self.trial
            + self.permanent
            + self.expiring.iter().map(|t| t.amount.max(0)).sum::<i64>()
    }

    /// Expiry of the earliest-expiring tranche, if any.
    pub fn next_expiration(&self) -> Option<DateTime<Utc>> {
        self.expiring.first().map(|t| t.expires_at)
    }
}

/// A set of balance changes applied in one step by [`crate::arith::grant`].
///
/// `trial` and `permanent` are signed deltas; `expiring` is a set of new
/// tranches merged into the existing list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrantMap {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permanent: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expiring: Vec<ExpiringCredit>,
}

impl GrantMap {
    /// A grant that changes nothing.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True if applying this grant would leave any state unchanged.
    pub fn is_empty(&self) -> bool {
        self.trial.is_none() && self.permanent.is_none() && self.expiring.is_empty()
    }

    /// Set the trial delta.
    pub fn with_trial(mut self, delta: i64) -> Self {
        self.trial = Some(delta);
        self
    }

    /// Set the permanent delta.
    pub fn with_permanent(mut self, delta: i64) -> Self {
        self.permanent = Some(delta);
        self
    }

    /// Add a tranche to be merged in.
    pub fn with_tranche(mut self, tranche: ExpiringCredit) -> Self {
        self.expiring.push(tranche);
        self
    }

    /// Fold another grant into this one: deltas add, tranches concatenate.
    pub fn combine(mut self, other: GrantMap) -> Self {
        if let Some(delta) = other.trial {
            self.trial = Some(self.trial.unwrap_or(0) + delta);
        }
        if let Some(delta) = other.permanent {
            self.permanent = Some(self.permanent.unwrap_or(0) + delta);
        }
        self.expiring.extend(other.expiring);
        self
    }
}
