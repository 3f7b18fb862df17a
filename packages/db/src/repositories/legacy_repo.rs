//! Adapter over the legacy document store.
//!
//! The legacy `balances` collection accumulated three historical tranche
//! layouts and three timestamp encodings over its lifetime; this adapter
//! maps all of them onto the canonical types. Once every tenant has been
//! migrated this module and the mirror write can be deleted.

use chrono::{DateTime, Utc};
use credits_core::{ExpiringCredit, UserCredits, UserId, arith};
use serde_json::{Value, json};

use crate::{DbError, try_get_legacy_db};

/// Repository for pre-migration balance documents.
pub struct LegacyBalanceRepository;

/// Integer timestamps at or above this magnitude are unix milliseconds;
/// below it, unix seconds.
const MS_EPOCH_CUTOFF: i64 = 100_000_000_000;

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|ts| ts.with_timezone(&Utc)),
        Value::Number(_) => {
            let n = value.as_i64()?;
            if n >= MS_EPOCH_CUTOFF {
                DateTime::from_timestamp_millis(n)
            } else {
                DateTime::from_timestamp(n, 0)
            }
        }
        _ => None,
    }
}

/// Decode one tranche document, discriminating the layout by field presence:
/// `{initial, left, ...}`, `{initial, amount, ...}` or `{amount, left, ...}`.
fn decode_tranche(user_id: UserId, doc: &Value) -> Option<ExpiringCredit> {
    let initial = doc.get("initial").and_then(Value::as_i64);
    let left = doc.get("left").and_then(Value::as_i64);
    let amount = doc.get("amount").and_then(Value::as_i64);

    let (initial, remaining) = match (initial, left, amount) {
        (Some(initial), Some(left), _) => (initial, left),
        (Some(initial), None, Some(amount)) => (initial, amount),
        (None, Some(left), Some(amount)) => (amount, left),
        _ => return None,
    };

    let expires_at = parse_timestamp(doc.get("expires")?)?;
    // The oldest layout never recorded a creation time.
    let created_at = doc
        .get("created")
        .and_then(parse_timestamp)
        .unwrap_or(expires_at);

    let remaining = remaining.max(0);
    Some(ExpiringCredit {
        user_id,
        initial: initial.max(remaining),
        amount: remaining,
        created_at,
        expires_at,
        note: doc
            .get("note")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

fn decode_document(user_id: UserId, doc: &Value) -> UserCredits {
    let mut expiring: Vec<ExpiringCredit> = doc
        .get("expiring")
        .and_then(Value::as_array)
        .map(|tranches| {
            tranches
                .iter()
                .filter_map(|t| decode_tranche(user_id, t))
                .collect()
        })
        .unwrap_or_default();
    arith::sort_expiring(&mut expiring);

    let bucket = |field: &str| doc.get(field).and_then(Value::as_i64).unwrap_or(0).max(0);

    UserCredits {
        user_id,
        trial: bucket("trial"),
        permanent: bucket("permanent"),
        expiring,
    }
}

impl LegacyBalanceRepository {
    /// Read and decode a legacy balance document.
    ///
    /// `None` when the legacy store is not configured or holds no document
    /// for this user.
    pub async fn get(user_id: UserId) -> Result<Option<UserCredits>, DbError> {
        let Some(db) = try_get_legacy_db() else {
            return Ok(None);
        };

        let doc: Option<Value> = db.select(("balances", user_id.to_string())).await?;

        Ok(doc.map(|doc| decode_document(user_id, &doc)))
    }

    /// Mirror a balance into the legacy store, in the newest layout.
    ///
    /// No-op when the legacy store is not configured. Callers treat a
    /// failure as non-fatal; the authoritative store has already committed.
    pub async fn mirror(credits: &UserCredits) -> Result<(), DbError> {
        let Some(db) = try_get_legacy_db() else {
            return Ok(());
        };

        let doc = json!({
            "trial": credits.trial,
            "permanent": credits.permanent,
            "expiring": credits
                .expiring
                .iter()
                .map(|t| {
                    json!({
                        "initial": t.initial,
                        "amount": t.amount,
                        "created": t.created_at.timestamp_millis(),
                        "expires": t.expires_at.timestamp_millis(),
                        "note": t.note,
                    })
                })
                .collect::<Vec<_>>(),
            "updated": Utc::now().timestamp_millis(),
        });

        db.query("UPSERT type::thing('balances', $id) CONTENT $doc")
            .bind(("id", credits.user_id.to_string()))
            .bind(("doc", doc))
            .await?;

        Ok(())
    }

    /// Seed a raw legacy document. Test helper.
    pub async fn put_raw(user_id: UserId, doc: Value) -> Result<(), DbError> {
        let Some(db) = try_get_legacy_db() else {
            return Ok(());
        };
        db.query("UPSERT type::thing('balances', $id) CONTENT $doc")
            .bind(("id", user_id.to_string()))
            .bind(("doc", doc))
            .await?;
        Ok(())
    }
}
