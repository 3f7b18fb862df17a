//! Database connection management with lazy initialization.

use std::sync::LazyLock;
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;
use thiserror::Error;
use tokio::sync::OnceCell;

/// Global connection to the authoritative store.
static DB: LazyLock<OnceCell<Surreal<Any>>> = LazyLock::new(OnceCell::new);

/// Global connection to the legacy document store, if configured.
static LEGACY_DB: LazyLock<OnceCell<Surreal<Any>>> = LazyLock::new(OnceCell::new);

/// Database connection wrapper.
pub type Database = Surreal<Any>;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Connection mode: "mem://", "ws://host:port", ...
    pub endpoint: String,
    /// Namespace to use
    pub namespace: String,
    /// Database name to use
    pub database: String,
    /// Connection pool size hint, forwarded to remote engines.
    pub pool_size: u32,
    /// Optional root credentials for authentication
    pub credentials: Option<(String, String)>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            endpoint: "mem://".to_string(),
            namespace: "ledger".to_string(),
            database: "main".to_string(),
            pool_size: 10,
            credentials: None,
        }
    }
}

impl DbConfig {
    /// Create a config for in-memory testing.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Create a config for a remote endpoint.
    pub fn remote(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Set the namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    /// Set the pool size hint.
    pub fn with_pool_size(mut self, pool_size: u32) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Set root credentials for authentication.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// Database errors.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("Database not initialized - call init_db first")]
    NotInitialized,
    #[error("Connection error: {0}")]
    Connection(#[from] surrealdb::Error),
    #[error("Query error: {0}")]
    Query(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

async fn open(config: &DbConfig, label: &str) -> Result<Database, DbError> {
    tracing::info!("Connecting to {} store: {}", label, config.endpoint);

    let db = connect(&config.endpoint).await?;

    if let Some((username, password)) = &config.credentials {
        db.signin(Root { username, password }).await?;
    }

    db.use_ns(&config.namespace)
        .use_db(&config.database)
        .await?;

    tracing::info!(
        "Connected to {} store: {}/{}",
        label,
        config.namespace,
        config.database
    );

    Ok(db)
}

/// Initialize the authoritative connection.
///
/// This should be called once at application startup before any database
/// operations.
pub async fn init_db(config: DbConfig) -> Result<&'static Database, DbError> {
    DB.get_or_try_init(|| async { open(&config, "authoritative").await })
        .await
}

/// Initialize the legacy document-store connection.
///
/// Only needed while tenants remain unmigrated; when never called, the
/// gateway skips legacy reconciliation and mirroring entirely.
pub async fn init_legacy_db(config: DbConfig) -> Result<&'static Database, DbError> {
    LEGACY_DB
        .get_or_try_init(|| async { open(&config, "legacy").await })
        .await
}

/// Get the authoritative connection.
pub fn get_db() -> Result<&'static Database, DbError> {
    DB.get().ok_or(DbError::NotInitialized)
}

/// Get the legacy connection, if one was configured.
pub fn try_get_legacy_db() -> Option<&'static Database> {
    LEGACY_DB.get()
}
