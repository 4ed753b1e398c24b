//! HomeVault Cache - Local state persistence
//!
//! SQLite-based storage for:
//! - Files, folders and their per-client mappings
//! - Registered clients and sync folder bindings
//! - The per-client sync ledger (`FileSyncState` rows)
//!
//! plus the blob stores that hold file content.
//!
//! ## Architecture
//!
//! This crate implements the `IIdentityStore` and `IBlobStore` ports from
//! `homevault-core`. It is a driven (secondary) adapter in the hexagonal
//! architecture.
//!
//! ## Key Components
//!
//! - [`DatabasePool`] - Connection pool that applies the schema on open
//! - [`SqliteIdentityStore`] - Full `IIdentityStore` implementation
//! - [`LocalBlobStore`] - Content on the local filesystem
//! - [`MemoryBlobStore`] - Content in memory, for tests and scratch use
//! - [`CacheError`] - Error types for cache operations
//!
//! ## Usage
//!
//! ```no_run
//! use homevault_cache::{DatabasePool, SqliteIdentityStore};
//! use homevault_core::config::Config;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load_or_default(&Config::default_path());
//! let pool = DatabasePool::open(&config.storage).await?;
//! let store = SqliteIdentityStore::new(pool.pool().clone());
//! // Use store as IIdentityStore...
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod pool;
pub mod repository;

pub use blob::{LocalBlobStore, MemoryBlobStore};
pub use pool::DatabasePool;
pub use repository::SqliteIdentityStore;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Serialization or deserialization of domain types failed
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A blob path escapes the storage root or is otherwise unusable
    #[error("Invalid blob path: {0}")]
    InvalidBlobPath(String),

    /// A blob does not exist
    #[error("Blob not found: {0}")]
    BlobNotFound(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}
