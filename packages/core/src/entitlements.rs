//! Entitlement payloads and their conversion to grants.
//!
//! Entitlements are the normalized form of payment events published on the
//! bus. Each one names a bucket and an amount expressed in humane duration
//! units; conversion turns a batch of them into a single [`GrantMap`].

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::credits::{ExpiringCredit, GrantMap, UserId};

/// Default lifetime of an expiring grant that does not say otherwise.
const DEFAULT_EXPIRY_DAYS: i64 = 30;

/// Expiry of an expiring-bucket entitlement: either an absolute unix-ms
/// timestamp or a duration map added to the creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExpiresSpec {
    At(i64),
    After(BTreeMap<String, f64>),
}

/// One external declaration that a user is to receive credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Only `"credits"` entitlements carry balance changes.
    #[serde(default)]
    pub kind: String,
    /// Target bucket: `"trial"`, `"permanent"` or `"expiring"`.
    #[serde(default)]
    pub bucket: String,
    /// Amount per duration unit (`seconds`, `minutes`, `hours`, `days`,
    /// `weeks`); summed across units.
    #[serde(default)]
    pub amount: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<ExpiresSpec>,
    /// Grant time as unix milliseconds; defaults to now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

fn unit_seconds(unit: &str) -> Option<f64> {
    match unit {
        "seconds" => Some(1.0),
        "minutes" => Some(60.0),
        "hours" => Some(3600.0),
        "days" => Some(86_400.0),
        "weeks" => Some(604_800.0),
        _ => None,
    }
}

/// Sum a duration map into truncated integer milliseconds. Unknown units
/// contribute nothing.
fn duration_ms(amount: &BTreeMap<String, f64>) -> i64 {
    let seconds: f64 = amount
        .iter()
        .filter_map(|(unit, value)| unit_seconds(unit).map(|s| s * value))
        .sum();
    (seconds * 1000.0) as i64
}

fn timestamp_or(default: DateTime<Utc>, ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or(default)
}

/// Convert one entitlement into its grant contribution.
///
/// Non-`credits` kinds, unknown buckets and malformed entries contribute
/// nothing (`None`).
fn to_grant(user_id: UserId, entitlement: &Entitlement, now: DateTime<Utc>) -> Option<GrantMap> {
    if entitlement.kind != "credits" {
        return None;
    }

    let ms = duration_ms(&entitlement.amount);
    match entitlement.bucket.as_str() {
        "trial" => Some(GrantMap::empty().with_trial(ms)),
        "permanent" => Some(GrantMap::empty().with_permanent(ms)),
        "expiring" => {
            if ms <= 0 {
                return None;
            }
            let created_at = timestamp_or(now, entitlement.created);
            let expires_at = match &entitlement.expires {
                Some(ExpiresSpec::At(at)) => timestamp_or(
                    created_at + Duration::days(DEFAULT_EXPIRY_DAYS),
                    Some(*at),
                ),
                Some(ExpiresSpec::After(duration)) => {
                    created_at + Duration::milliseconds(duration_ms(duration))
                }
                None => created_at + Duration::days(DEFAULT_EXPIRY_DAYS),
            };
            let mut tranche = ExpiringCredit::new(user_id, ms, created_at, expires_at);
            tranche.note = entitlement.note.clone();
            Some(GrantMap::empty().with_tranche(tranche))
        }
        _ => None,
    }
}

/// Convert a batch of entitlements into one combined grant.
///
/// Entries convert individually; trial/permanent deltas add up and expiring
/// tranches concatenate (the arithmetic core sorts them on merge).
pub fn entitlements_to_grant(
    user_id: UserId,
    entitlements: &[Entitlement],
    now: DateTime<Utc>,
) -> GrantMap {
    entitlements
        .iter()
        .filter_map(|e| to_grant(user_id, e, now))
        .fold(GrantMap::empty(), GrantMap::combine)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credits(bucket: &str, amount: &[(&str, f64)]) -> Entitlement {
        Entitlement {
            kind: "credits".to_string(),
            bucket: bucket.to_string(),
            amount: amount
                .iter()
                .map(|(unit, value)| (unit.to_string(), *value))
                .collect(),
            expires: None,
            created: None,
            note: None,
        }
    }

    #[test]
    fn converts_units_to_milliseconds() {
        let user_id = UserId::new();
        let now = Utc::now();

        let mut expiring = credits("expiring", &[("minutes", 30.0)]);
        expiring.expires = Some(ExpiresSpec::After(
            [("days".to_string(), 7.0)].into_iter().collect(),
        ));

        let grant = entitlements_to_grant(
            user_id,
            &[credits("trial", &[("hours", 1.0)]), expiring],
            now,
        );

        assert_eq!(grant.trial, Some(3_600_000));
        assert_eq!(grant.permanent, None);
        assert_eq!(grant.expiring.len(), 1);
        let tranche = &grant.expiring[0];
        assert_eq!(tranche.initial, 1_800_000);
        assert_eq!(tranche.amount, 1_800_000);
        assert_eq!(tranche.created_at, now);
        assert_eq!(tranche.expires_at, now + Duration::days(7));
    }

    #[test]
    fn sums_amounts_across_units() {
        let grant = entitlements_to_grant(
            UserId::new(),
            &[credits("permanent", &[("minutes", 1.0), ("seconds", 30.0)])],
            Utc::now(),
        );
        assert_eq!(grant.permanent, Some(90_000));
    }

    #[test]
    fn unknown_kinds_buckets_and_units_contribute_nothing() {
        let user_id = UserId::new();
        let now = Utc::now();

        let mut refund = credits("trial", &[("hours", 1.0)]);
        refund.kind = "refund".to_string();

        let grant = entitlements_to_grant(
            user_id,
            &[
                refund,
                credits("mystery", &[("hours", 1.0)]),
                credits("trial", &[("fortnights", 2.0)]),
            ],
            now,
        );
        assert_eq!(grant.trial, Some(0));
        assert!(grant.expiring.is_empty());
    }

    #[test]
    fn expiring_defaults_to_thirty_days() {
        let now = Utc::now();
        let grant =
            entitlements_to_grant(UserId::new(), &[credits("expiring", &[("hours", 2.0)])], now);
        assert_eq!(grant.expiring[0].expires_at, now + Duration::days(30));
    }

    #[test]
    fn absolute_expiry_and_explicit_created_are_honored() {
        let now = Utc::now();
        let created = 1_700_000_000_000i64;
        let expires = created + 86_400_000;

        let mut entitlement = credits("expiring", &[("days", 1.0)]);
        entitlement.created = Some(created);
        entitlement.expires = Some(ExpiresSpec::At(expires));

        let grant = entitlements_to_grant(UserId::new(), &[entitlement], now);
        let tranche = &grant.expiring[0];
        assert_eq!(tranche.created_at.timestamp_millis(), created);
        assert_eq!(tranche.expires_at.timestamp_millis(), expires);
    }

    #[test]
    fn batch_entries_combine_additively() {
        let grant = entitlements_to_grant(
            UserId::new(),
            &[
                credits("trial", &[("seconds", 1.0)]),
                credits("trial", &[("seconds", 2.0)]),
                credits("expiring", &[("seconds", 3.0)]),
                credits("expiring", &[("seconds", 4.0)]),
            ],
            Utc::now(),
        );
        assert_eq!(grant.trial, Some(3_000));
        assert_eq!(grant.expiring.len(), 2);
    }
}
