mod common;

use std::error::Error;

use chrono::{DateTime, Utc};
use credits_core::{ExpiringCredit, UserCredits, UserId};
use serde_json::json;

use db::PersistenceGateway;
use db::repositories::{ChangeLogRepository, CreditsRepository, LegacyBalanceRepository};

fn ms(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts).unwrap()
}

fn sample_credits(user_id: UserId) -> UserCredits {
    UserCredits {
        user_id,
        trial: 1_500,
        permanent: 42_000,
        expiring: vec![
            ExpiringCredit::new(user_id, 300, ms(1_700_000_000_000), ms(1_700_086_400_000)),
            ExpiringCredit::new(user_id, 800, ms(1_700_000_000_000), ms(1_700_172_800_000))
                .with_note("launch promo"),
        ],
    }
}

#[test]
fn balance_round_trips_through_the_store() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;

    let user_id = UserId::new();
    let credits = sample_credits(user_id);

    let stored = CreditsRepository::upsert(&credits).await?;
    assert_eq!(stored, credits);

    let loaded = CreditsRepository::get(user_id).await?.unwrap();
    assert_eq!(loaded, credits);

    // Upsert replaces, not accumulates.
    let mut drained = credits.clone();
    drained.trial = 0;
    drained.expiring.remove(0);
    CreditsRepository::upsert(&drained).await?;

    let reloaded = CreditsRepository::get(user_id).await?.unwrap();
    assert_eq!(reloaded, drained);

    Ok(())
})
}

#[test]
fn missing_user_reads_as_none() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;

    let loaded = CreditsRepository::get(UserId::new()).await?;
    assert!(loaded.is_none());

    Ok(())
})
}

#[test]
fn create_if_absent_keeps_the_existing_row() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;

    let user_id = UserId::new();
    let original = sample_credits(user_id);
    CreditsRepository::upsert(&original).await?;

    let mut competing = UserCredits::zero(user_id);
    competing.permanent = 1;
    CreditsRepository::create_if_absent(&competing).await?;

    let loaded = CreditsRepository::get(user_id).await?.unwrap();
    assert_eq!(loaded, original);

    Ok(())
})
}

#[test]
fn gateway_returns_zero_balance_without_inserting() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;

    let user_id = UserId::new();
    let credits = PersistenceGateway::fetch(user_id).await?;
    assert_eq!(credits, UserCredits::zero(user_id));

    // A first touch must not create a row.
    assert!(CreditsRepository::get(user_id).await?.is_none());

    Ok(())
})
}

#[test]
fn gateway_reconciles_legacy_balances_on_first_touch() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;

    let user_id = UserId::new();
    LegacyBalanceRepository::put_raw(
        user_id,
        json!({
            "trial": 2_000,
            "permanent": 9_000,
            "expiring": [
                // Oldest layout: initial/left with second-precision timestamps.
                { "initial": 700, "left": 400, "created": 1_700_000_000, "expires": 1_700_086_400 },
                // Newest layout: initial/amount with millisecond timestamps.
                { "initial": 500, "amount": 500, "created": 1_700_000_000_000i64, "expires": 1_700_000_100_000i64 },
            ],
        }),
    )
    .await?;

    let credits = PersistenceGateway::fetch(user_id).await?;
    assert_eq!(credits.trial, 2_000);
    assert_eq!(credits.permanent, 9_000);
    assert_eq!(credits.expiring.len(), 2);
    assert_eq!(credits.expiring[0].amount, 500);
    assert_eq!(credits.expiring[1].amount, 400);

    // Reconciled into the authoritative store...
    let reconciled = CreditsRepository::get(user_id).await?.unwrap();
    assert_eq!(reconciled, credits);

    // ...which wins on every later read.
    let mut updated = credits.clone();
    updated.permanent = 1;
    CreditsRepository::upsert(&updated).await?;
    let refetched = PersistenceGateway::fetch(user_id).await?;
    assert_eq!(refetched.permanent, 1);

    Ok(())
})
}

#[test]
fn gateway_update_mirrors_to_the_legacy_store() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;

    let user_id = UserId::new();
    let credits = sample_credits(user_id);
    PersistenceGateway::update(&credits).await?;

    let legacy = db::try_get_legacy_db().unwrap();
    let mut response = legacy
        .query("SELECT trial, permanent FROM type::thing('balances', $id)")
        .bind(("id", user_id.to_string()))
        .await?;
    let docs: Vec<serde_json::Value> = response.take(0)?;
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0]["trial"], json!(1_500));
    assert_eq!(docs[0]["permanent"], json!(42_000));

    // The mirror must round-trip through the legacy reader too.
    let read_back = LegacyBalanceRepository::get(user_id).await?.unwrap();
    assert_eq!(read_back.trial, credits.trial);
    assert_eq!(read_back.permanent, credits.permanent);
    assert_eq!(read_back.expiring.len(), credits.expiring.len());

    Ok(())
})
}

#[test]
fn change_log_records_each_event_once() -> Result<(), Box<dyn Error>> {
    common::RUNTIME.block_on(async {
    let _guard = common::setup_db().await?;

    let user_id = UserId::new();
    assert!(ChangeLogRepository::record_if_new("evt-1", user_id, "jobs.complete").await?);
    assert!(!ChangeLogRepository::record_if_new("evt-1", user_id, "jobs.complete").await?);
    assert!(ChangeLogRepository::contains("evt-1").await?);

    assert!(ChangeLogRepository::record_if_new("evt-2", user_id, "entitlements.credits").await?);

    ChangeLogRepository::remove("evt-1").await?;
    assert!(!ChangeLogRepository::contains("evt-1").await?);
    assert!(ChangeLogRepository::record_if_new("evt-1", user_id, "jobs.complete").await?);

    Ok(())
})
}
