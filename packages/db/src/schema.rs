//! Database schema definitions using SurrealQL.

use crate::{DbError, get_db};

/// Initialize the authoritative-store schema.
///
/// This creates all necessary tables, fields, and indexes. The legacy store
/// is intentionally left schemaless; its documents predate this service.
pub async fn init_schema() -> Result<(), DbError> {
    let db = get_db()?;

    tracing::info!("Initializing database schema...");

    db.query(USER_CREDITS_SCHEMA).await?;
    db.query(CHANGE_LOG_SCHEMA).await?;

    tracing::info!("Database schema initialized");

    Ok(())
}

/// Balance table schema.
///
/// Timestamps are ISO-8601 UTC strings rather than native datetimes so rows
/// stay portable across the migration tooling.
const USER_CREDITS_SCHEMA: &str = r#"
-- One row per user, keyed by user id
DEFINE TABLE IF NOT EXISTS user_credits SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS trial ON user_credits TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS permanent ON user_credits TYPE int DEFAULT 0;
DEFINE FIELD IF NOT EXISTS expiring ON user_credits TYPE array DEFAULT [];
DEFINE FIELD IF NOT EXISTS expiring.* ON user_credits FLEXIBLE TYPE object;
DEFINE FIELD IF NOT EXISTS updated_at ON user_credits TYPE string;
"#;

/// Change-log table schema, keyed by source event id.
///
/// Serves both as the idempotency tracker for bus deliveries and as the
/// audit trail of applied changes.
const CHANGE_LOG_SCHEMA: &str = r#"
DEFINE TABLE IF NOT EXISTS change_log SCHEMAFULL;

DEFINE FIELD IF NOT EXISTS user_id ON change_log TYPE string;
DEFINE FIELD IF NOT EXISTS topic ON change_log TYPE string;
DEFINE FIELD IF NOT EXISTS recorded_at ON change_log TYPE string;

DEFINE INDEX IF NOT EXISTS change_log_user ON change_log FIELDS user_id;
"#;
