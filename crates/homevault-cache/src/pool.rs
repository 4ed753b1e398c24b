//! SQLite pool for the identity store
//!
//! File databases run in WAL mode so the scheduler's concurrent passes can
//! read while one of them writes. In-memory databases pin a single
//! connection, since each SQLite connection would otherwise see its own
//! empty database.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use homevault_core::config::StorageConfig;

use crate::CacheError;

const FILE_MAX_CONNECTIONS: u32 = 5;
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const SCHEMA: &str = include_str!("migrations/20261019_initial.sql");

/// Owns the connection pool and guarantees the schema exists
pub struct DatabasePool {
    pool: SqlitePool,
}

impl DatabasePool {
    /// Opens (creating if needed) the database at `db_path` and applies the schema
    ///
    /// Missing parent directories are created first.
    pub async fn new(db_path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CacheError::ConnectionFailed(format!("cannot create {}: {e}", parent.display()))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(FILE_MAX_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|e| {
                CacheError::ConnectionFailed(format!("{}: {e}", db_path.display()))
            })?;

        let db = Self::with_schema(pool).await?;
        tracing::info!(path = %db_path.display(), "Identity store opened");
        Ok(db)
    }

    /// Opens the database named by the storage configuration
    pub async fn open(storage: &StorageConfig) -> Result<Self, CacheError> {
        Self::new(&storage.database_path).await
    }

    /// Private in-memory database, used by tests
    pub async fn in_memory() -> Result<Self, CacheError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory database: {e}")))?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::ConnectionFailed(format!("in-memory database: {e}")))?;

        Self::with_schema(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // Every statement in the schema is `IF NOT EXISTS`, so reopening is safe.
    async fn with_schema(pool: SqlitePool) -> Result<Self, CacheError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| CacheError::MigrationFailed(e.to_string()))?;
        tracing::debug!("Schema applied");
        Ok(Self { pool })
    }
}
