//! SQLite connection setup

use custody_queue::OutboxError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// SQLite configuration options
#[derive(Debug, Clone)]
pub struct SqliteConfig {
    /// Database URL (e.g., "sqlite:custody.db?mode=rwc" or "sqlite::memory:")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Enable WAL journal mode for better concurrency
    pub wal_mode: bool,
    /// Enable foreign key enforcement
    pub foreign_keys: bool,
    /// Busy timeout in seconds
    pub busy_timeout_secs: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:custody.db?mode=rwc".to_string(),
            max_connections: 5,
            wal_mode: true,
            foreign_keys: true,
            busy_timeout_secs: 30,
        }
    }
}

impl SqliteConfig {
    /// Config for a given URL with default pool settings
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// In-memory database (testing). A single connection, since every
    /// connection to `:memory:` opens its own database.
    pub fn memory() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            wal_mode: false,
            foreign_keys: true,
            busy_timeout_secs: 5,
        }
    }

    /// File-backed database, created if missing
    pub fn file(path: &Path) -> Self {
        Self::with_url(format!("sqlite:{}?mode=rwc", path.display()))
    }
}

/// Open a pool and run the embedded migrations
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, OutboxError> {
    let mut options = SqliteConnectOptions::from_str(&config.url)
        .map_err(|e| OutboxError::Backend(e.to_string()))?;

    if config.foreign_keys {
        options = options.pragma("foreign_keys", "ON");
    }
    options = options.pragma("busy_timeout", (config.busy_timeout_secs * 1000).to_string());
    if config.wal_mode {
        options = options.pragma("journal_mode", "WAL");
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(options)
        .await
        .map_err(|e| OutboxError::Backend(e.to_string()))?;

    info!(url = %config.url, wal = config.wal_mode, "Connected to SQLite");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| OutboxError::Backend(format!("Migration failed: {}", e)))?;

    Ok(pool)
}
