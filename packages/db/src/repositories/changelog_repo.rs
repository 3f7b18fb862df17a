//! Change-log repository: idempotency tracking keyed by source event id.

use chrono::{SecondsFormat, Utc};
use credits_core::UserId;
use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::{DbError, get_db};

/// Repository for processed-event records.
pub struct ChangeLogRepository;

#[derive(Debug, Serialize)]
struct ChangeLogContent {
    user_id: String,
    topic: String,
    recorded_at: String,
}

#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct ChangeLogRecord {
    id: Option<Thing>,
    user_id: String,
    topic: String,
    recorded_at: String,
}

impl ChangeLogRepository {
    /// Record a source event id before its mutation is applied.
    ///
    /// Returns `true` when the id was fresh; `false` when a record already
    /// exists, meaning the delivery is a duplicate and must be acked without
    /// touching the actor.
    pub async fn record_if_new(
        event_id: &str,
        user_id: UserId,
        topic: &str,
    ) -> Result<bool, DbError> {
        let db = get_db()?;

        let content = ChangeLogContent {
            user_id: user_id.to_string(),
            topic: topic.to_string(),
            recorded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let created: Result<Option<ChangeLogRecord>, surrealdb::Error> =
            db.create(("change_log", event_id)).content(content).await;

        match created {
            Ok(_) => Ok(true),
            Err(e) if e.to_string().contains("already exists") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a source event id has been seen.
    pub async fn contains(event_id: &str) -> Result<bool, DbError> {
        let db = get_db()?;
        let record: Option<ChangeLogRecord> = db.select(("change_log", event_id)).await?;
        Ok(record.is_some())
    }

    /// Remove a recorded event id.
    ///
    /// Used when the mutation behind a freshly recorded id failed
    /// transiently: the record must not survive, or the redelivered message
    /// would be skipped as a duplicate.
    pub async fn remove(event_id: &str) -> Result<(), DbError> {
        let db = get_db()?;
        let _: Option<ChangeLogRecord> = db.delete(("change_log", event_id)).await?;
        Ok(())
    }
}
