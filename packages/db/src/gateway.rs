//! Write-through persistence gateway.
//!
//! The authoritative store always wins; the legacy document store is only
//! consulted on a first-touch miss, and mirrored on a best-effort basis
//! while tenants remain unmigrated.

use credits_core::{UserCredits, UserId};

use crate::DbError;
use crate::repositories::{CreditsRepository, LegacyBalanceRepository};

/// The persistence facade user actors write through.
pub struct PersistenceGateway;

impl PersistenceGateway {
    /// Fetch a user's balance.
    ///
    /// Reads the authoritative store first. On a miss, reads the legacy
    /// store; a legacy hit is reconciled into the authoritative store with
    /// an existing-row-wins insert and then returned. When both stores miss,
    /// a zero balance is returned without inserting anything.
    pub async fn fetch(user_id: UserId) -> Result<UserCredits, DbError> {
        if let Some(credits) = CreditsRepository::get(user_id).await? {
            return Ok(credits);
        }

        if let Some(credits) = LegacyBalanceRepository::get(user_id).await? {
            tracing::info!("Reconciling legacy balance for user {}", user_id);
            CreditsRepository::create_if_absent(&credits).await?;
            return Ok(credits);
        }

        Ok(UserCredits::zero(user_id))
    }

    /// Write a balance through to the stores.
    ///
    /// The authoritative upsert must succeed; the legacy mirror is logged
    /// and swallowed on failure because the authoritative row has already
    /// committed.
    pub async fn update(credits: &UserCredits) -> Result<UserCredits, DbError> {
        let stored = CreditsRepository::upsert(credits).await?;

        if let Err(e) = LegacyBalanceRepository::mirror(credits).await {
            tracing::warn!(
                "Legacy mirror write failed for user {}: {}",
                credits.user_id,
                e
            );
        }

        Ok(stored)
    }
}
