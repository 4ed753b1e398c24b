//! Per-file mutual exclusion
//!
//! Local mutations and the reconciliation engine both load a `File`, change
//! it and save it back. Sharing one [`FileLocks`] between them makes each of
//! those read-modify-write sequences atomic per file, so a download cannot
//! overwrite an edit that landed after it was checked.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::FileId;

/// Lock table keyed by file id
///
/// Entries exist only while someone holds or waits for the lock.
#[derive(Default)]
pub struct FileLocks {
    locks: DashMap<FileId, Arc<Mutex<()>>>,
}

/// Held lock on one file; released on drop
pub struct FileLockGuard<'a> {
    locks: &'a FileLocks,
    file: FileId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until `file` is free and locks it
    pub async fn lock(&self, file: &FileId) -> FileLockGuard<'_> {
        let mutex = Arc::clone(self.locks.entry(*file).or_default().value());
        let guard = mutex.lock_owned().await;
        FileLockGuard {
            locks: self,
            file: *file,
            guard: Some(guard),
        }
    }

    /// Number of files currently locked or waited on
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for FileLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        // Clones are only taken under the shard lock, so a count of one
        // means no other holder or waiter exists.
        self.locks
            .locks
            .remove_if(&self.file, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
