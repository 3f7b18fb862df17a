//! SurrealDB integration for the credit ledger.
//!
//! Two stores are managed here:
//! - the authoritative store, a SCHEMAFULL `user_credits` table plus the
//!   `change_log` idempotency table;
//! - optionally, the legacy document store still holding pre-migration
//!   balances, read (and best-effort mirrored) during the transition.
//!
//! The [`gateway::PersistenceGateway`] is the only entry point actors use;
//! the repositories underneath it are also exercised directly by tests.

mod connection;
pub mod gateway;
pub mod repositories;
mod schema;

pub use connection::{Database, DbConfig, DbError, get_db, init_db, init_legacy_db, try_get_legacy_db};
pub use gateway::PersistenceGateway;
pub use schema::init_schema;

/// Initialize the authoritative store (and optionally the legacy store)
/// with the given configurations.
///
/// This should be called once at application startup.
pub async fn init(config: DbConfig, legacy: Option<DbConfig>) -> Result<(), DbError> {
    init_db(config).await?;
    init_schema().await?;
    if let Some(legacy) = legacy {
        init_legacy_db(legacy).await?;
    }
    Ok(())
}
