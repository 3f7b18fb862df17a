use std::sync::LazyLock;

use tokio::sync::{Mutex, MutexGuard};

use db::{DbConfig, DbError};

/// Shared across all tests in this binary so the process-global DB
/// connection (a `OnceCell`) doesn't outlive the runtime that opened it.
pub static RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
});

static TEST_LOCK: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

pub async fn setup_db() -> Result<MutexGuard<'static, ()>, DbError> {
    let guard = TEST_LOCK.lock().await;
    db::init(
        DbConfig::memory(),
        Some(DbConfig::memory().with_database("legacy")),
    )
    .await?;

    let db_conn = db::get_db()?;
    db_conn
        .query("DELETE change_log; DELETE user_credits;")
        .await?;

    if let Some(legacy) = db::try_get_legacy_db() {
        legacy.query("DELETE balances;").await?;
    }

    Ok(guard)
}
