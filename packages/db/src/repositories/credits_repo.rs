//! Balance repository for the authoritative store.

use chrono::{DateTime, SecondsFormat, Utc};
use credits_core::{ExpiringCredit, UserCredits, UserId};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{DbError, get_db};

/// Repository for balance rows in the authoritative store.
pub struct CreditsRepository;

/// One tranche as stored: timestamps are ISO-8601 UTC strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrancheRecord {
    initial: i64,
    amount: i64,
    created_at: String,
    expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    note: Option<String>,
}

impl TrancheRecord {
    fn from_tranche(tranche: &ExpiringCredit) -> Self {
        Self {
            initial: tranche.initial,
            amount: tranche.amount,
            created_at: iso(tranche.created_at),
            expires_at: iso(tranche.expires_at),
            note: tranche.note.clone(),
        }
    }

    fn into_tranche(self, user_id: UserId) -> Result<ExpiringCredit, DbError> {
        Ok(ExpiringCredit {
            user_id,
            initial: self.initial,
            amount: self.amount,
            created_at: parse_iso(&self.created_at)?,
            expires_at: parse_iso(&self.expires_at)?,
            note: self.note,
        })
    }
}

/// Internal record type for reading from SurrealDB.
#[derive(Debug, Deserialize)]
struct CreditsRecord {
    #[allow(dead_code)]
    id: Option<Thing>,
    trial: i64,
    permanent: i64,
    expiring: Vec<TrancheRecord>,
    #[allow(dead_code)]
    updated_at: Option<String>,
}

impl CreditsRecord {
    fn into_credits(self, user_id: UserId) -> Result<UserCredits, DbError> {
        let expiring = self
            .expiring
            .into_iter()
            .map(|t| t.into_tranche(user_id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(UserCredits {
            user_id,
            trial: self.trial,
            permanent: self.permanent,
            expiring,
        })
    }
}

/// Struct for writing rows; the record id carries the user id.
#[derive(Debug, Serialize)]
struct CreditsContent {
    trial: i64,
    permanent: i64,
    expiring: Vec<TrancheRecord>,
    updated_at: String,
}

impl CreditsContent {
    fn from_credits(credits: &UserCredits) -> Self {
        Self {
            trial: credits.trial,
            permanent: credits.permanent,
            expiring: credits.expiring.iter().map(TrancheRecord::from_tranche).collect(),
            updated_at: iso(Utc::now()),
        }
    }
}

fn iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_iso(s: &str) -> Result<DateTime<Utc>, DbError> {
    DateTime::parse_from_rfc3339(s)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| DbError::Serialization(format!("bad timestamp {:?}: {}", s, e)))
}

impl CreditsRepository {
    /// Get a balance by user id. `None` when the user has no row yet.
    pub async fn get(user_id: UserId) -> Result<Option<UserCredits>, DbError> {
        let db = get_db()?;

        let record: Option<CreditsRecord> =
            db.select(("user_credits", user_id.to_string())).await?;

        record.map(|r| r.into_credits(user_id)).transpose()
    }

    /// Upsert a balance row.
    ///
    /// A failed upsert (e.g. a stale-version conflict from a concurrent
    /// migration write) is retried once as a plain create before the error
    /// is surfaced.
    pub async fn upsert(credits: &UserCredits) -> Result<UserCredits, DbError> {
        let db = get_db()?;
        let content = CreditsContent::from_credits(credits);

        let mut result = match db
            .query(
                "UPSERT type::thing('user_credits', $id) CONTENT $content RETURN AFTER",
            )
            .bind(("id", credits.user_id.to_string()))
            .bind(("content", content))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    "Upsert for user {} failed, retrying as insert: {}",
                    credits.user_id,
                    e
                );
                let content = CreditsContent::from_credits(credits);
                db.query("CREATE type::thing('user_credits', $id) CONTENT $content")
                    .bind(("id", credits.user_id.to_string()))
                    .bind(("content", content))
                    .await?
            }
        };

        let records: Vec<CreditsRecord> = result.take(0)?;

        records
            .into_iter()
            .next()
            .map(|r| r.into_credits(credits.user_id))
            .transpose()?
            .ok_or_else(|| DbError::Query(format!("Failed to upsert balance for {}", credits.user_id)))
    }

    /// Insert a balance row only if none exists; an existing row wins.
    ///
    /// Used when reconciling a legacy document into the authoritative store.
    pub async fn create_if_absent(credits: &UserCredits) -> Result<(), DbError> {
        let db = get_db()?;
        let content = CreditsContent::from_credits(credits);

        let created: Result<Option<CreditsRecord>, surrealdb::Error> = db
            .create(("user_credits", credits.user_id.to_string()))
            .content(content)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a balance row. Test helper.
    pub async fn delete(user_id: UserId) -> Result<(), DbError> {
        let db = get_db()?;
        let _: Option<CreditsRecord> = db.delete(("user_credits", user_id.to_string())).await?;
        Ok(())
    }
}
