//! Blob store port (driven/secondary port)
//!
//! Byte storage for file content, addressed by `File::storage_path`.

use chrono::{DateTime, Utc};

/// Size and modification time of a stored blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobStat {
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Content storage used by the engine and the file use cases
///
/// ## Implementation Notes
///
/// - `write` replaces existing content atomically; readers never observe a
///   partially written blob.
/// - `delete` of a missing blob succeeds.
#[async_trait::async_trait]
pub trait IBlobStore: Send + Sync {
    /// Reads the full content stored at `path`
    async fn read(&self, path: &str) -> anyhow::Result<Vec<u8>>;

    /// Writes `data` at `path`, replacing existing content
    async fn write(&self, path: &str, data: &[u8]) -> anyhow::Result<()>;

    /// Removes the content at `path`
    async fn delete(&self, path: &str) -> anyhow::Result<()>;

    /// Size and mtime of the content at `path`, `None` when missing
    async fn stat(&self, path: &str) -> anyhow::Result<Option<BlobStat>>;
}
