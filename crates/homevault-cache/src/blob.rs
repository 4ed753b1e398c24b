//! Blob store adapters
//!
//! [`LocalBlobStore`] keeps file content under a root directory using
//! `tokio::fs`. Writes go to a temporary sibling first and are renamed into
//! place, so readers never see a partial blob.
//!
//! [`MemoryBlobStore`] keeps content in a concurrent map and is used by
//! tests and ephemeral setups.

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, instrument};

use homevault_core::ports::{BlobStat, IBlobStore};

use crate::CacheError;

// ============================================================================
// LocalBlobStore
// ============================================================================

/// Content store rooted at a local directory
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a storage path below the root
    ///
    /// Absolute paths and `..` components are rejected.
    fn resolve(&self, path: &str) -> Result<PathBuf, CacheError> {
        let relative = Path::new(path);
        if path.is_empty() {
            return Err(CacheError::InvalidBlobPath("empty path".to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(CacheError::InvalidBlobPath(path.to_string())),
            }
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait::async_trait]
impl IBlobStore for LocalBlobStore {
    #[instrument(skip(self))]
    async fn read(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => {
                debug!(bytes = data.len(), "blob read");
                Ok(data)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CacheError::BlobNotFound(path.to_string()).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn write(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Same directory, so the rename stays on one filesystem
        let tmp_path = {
            let mut p = target.as_os_str().to_owned();
            p.push(".tmp");
            PathBuf::from(p)
        };
        tokio::fs::write(&tmp_path, data).await?;
        tokio::fs::rename(&tmp_path, &target).await?;

        debug!("blob written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<BlobStat>> {
        let target = self.resolve(path)?;
        let metadata = match tokio::fs::metadata(&target).await {
            Ok(m) => m,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let modified = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(Utc::now);

        Ok(Some(BlobStat {
            size: metadata.len(),
            modified,
        }))
    }
}

// ============================================================================
// MemoryBlobStore
// ============================================================================

/// In-memory content store
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, (Vec<u8>, DateTime<Utc>)>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.blobs.contains_key(path)
    }
}

#[async_trait::async_trait]
impl IBlobStore for MemoryBlobStore {
    async fn read(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        self.blobs
            .get(path)
            .map(|entry| entry.0.clone())
            .ok_or_else(|| CacheError::BlobNotFound(path.to_string()).into())
    }

    async fn write(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        self.blobs
            .insert(path.to_string(), (data.to_vec(), Utc::now()));
        Ok(())
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.blobs.remove(path);
        Ok(())
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<BlobStat>> {
        Ok(self.blobs.get(path).map(|entry| BlobStat {
            size: entry.0.len() as u64,
            modified: entry.1,
        }))
    }
}
