//! File lifecycle use case
//!
//! Local mutations of stored files: create, content overwrite, rename,
//! move to trash, restore and permanent purge. Every mutation that matters
//! to sync is fanned out to the change tracker.
//!
//! Mutations of an existing file run under its [`FileLocks`] entry and
//! reload the record inside the lock, so they never save a stale copy.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, info};

use crate::domain::{ChangeKind, ContentHash, File, FileId, FolderId, OwnerId};
use crate::ports::{IBlobStore, IIdentityStore};

use super::change_tracker::ChangeTracker;
use super::file_locks::FileLocks;

/// Use case for local file mutations
pub struct FileLifecycle {
    store: Arc<dyn IIdentityStore>,
    blobs: Arc<dyn IBlobStore>,
    tracker: ChangeTracker,
    locks: Arc<FileLocks>,
}

impl FileLifecycle {
    pub fn new(store: Arc<dyn IIdentityStore>, blobs: Arc<dyn IBlobStore>) -> Self {
        let tracker = ChangeTracker::new(Arc::clone(&store));
        Self {
            store,
            blobs,
            tracker,
            locks: Arc::new(FileLocks::new()),
        }
    }

    /// Shares a lock table with the sync engine
    #[must_use]
    pub fn with_file_locks(mut self, locks: Arc<FileLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn file_locks(&self) -> &Arc<FileLocks> {
        &self.locks
    }

    /// Check that `folder` (root when `None`) exists, belongs to `owner` and
    /// is not in the trash
    ///
    /// # Errors
    /// Fails without side effects on any violation.
    pub async fn ensure_folder(&self, owner: &OwnerId, folder: Option<&FolderId>) -> Result<()> {
        let Some(folder_id) = folder else {
            return Ok(());
        };
        let folder = self
            .store
            .get_folder(folder_id)
            .await
            .context("Failed to load folder")?;
        match folder {
            Some(f) if f.owner() == owner && !f.is_deleted() => Ok(()),
            Some(f) if f.owner() != owner => bail!("Folder {folder_id} belongs to another owner"),
            Some(_) => bail!("Folder {folder_id} is in the trash"),
            None => bail!("Folder {folder_id} not found"),
        }
    }

    /// Store new content as a file in `folder`
    pub async fn create(
        &self,
        owner: OwnerId,
        folder: Option<FolderId>,
        name: &str,
        content: &[u8],
        mime_type: &str,
    ) -> Result<File> {
        self.ensure_folder(&owner, folder.as_ref()).await?;
        let file = File::new(
            owner,
            folder,
            name,
            mime_type,
            content.len() as u64,
            ContentHash::of(content),
        )?;

        self.blobs
            .write(file.storage_path(), content)
            .await
            .context("Failed to write file content")?;
        self.store
            .save_file(&file)
            .await
            .context("Failed to save new file")?;
        let tracked = self
            .tracker
            .record_file_change(&file, ChangeKind::Created, None)
            .await?;

        info!(file_id = %file.id(), name = %file.name(), tracked, "File created");
        Ok(file)
    }

    /// Replace a file's content in place, keeping its id and mappings
    ///
    /// `file` is refreshed from the store before the change is applied.
    pub async fn overwrite(&self, file: &mut File, content: &[u8], mime_type: &str) -> Result<()> {
        let _lock = self.locks.lock(file.id()).await;
        *file = self.load(file.id()).await?;
        self.write_content(file, content, mime_type).await
    }

    async fn write_content(&self, file: &mut File, content: &[u8], mime_type: &str) -> Result<()> {
        let hash = ContentHash::of(content);
        self.blobs
            .write(file.storage_path(), content)
            .await
            .context("Failed to write file content")?;
        file.replace_content(content.len() as u64, hash, Utc::now());
        file.set_mime_type(mime_type);
        self.store
            .save_file(file)
            .await
            .context("Failed to save overwritten file")?;
        self.tracker
            .record_file_change(file, ChangeKind::Modified, None)
            .await?;

        debug!(file_id = %file.id(), "File content overwritten");
        Ok(())
    }

    /// Load an active or trashed file, failing if it does not exist
    pub async fn load(&self, id: &FileId) -> Result<File> {
        self.store
            .get_file(id)
            .await
            .context("Failed to load file")?
            .with_context(|| format!("File {id} not found"))
    }

    /// Replace a file's content by id
    pub async fn update_content(&self, id: &FileId, content: &[u8]) -> Result<File> {
        let _lock = self.locks.lock(id).await;
        let mut file = self.load(id).await?;
        if file.is_deleted() {
            bail!("File {id} is in the trash");
        }
        let mime = file.mime_type().to_string();
        self.write_content(&mut file, content, &mime).await?;
        Ok(file)
    }

    /// Rename a file; the new name is not checked for duplicates here
    pub async fn rename(&self, id: &FileId, name: &str) -> Result<File> {
        let _lock = self.locks.lock(id).await;
        let mut file = self.load(id).await?;
        file.rename(name, Utc::now())?;
        self.store
            .save_file(&file)
            .await
            .context("Failed to save renamed file")?;
        self.tracker
            .record_file_change(&file, ChangeKind::Modified, None)
            .await?;
        Ok(file)
    }

    /// Move a file to the trash
    pub async fn soft_delete(&self, id: &FileId) -> Result<File> {
        let _lock = self.locks.lock(id).await;
        let mut file = self.load(id).await?;
        file.soft_delete(Utc::now())?;
        self.store
            .save_file(&file)
            .await
            .context("Failed to save deleted file")?;
        let tracked = self
            .tracker
            .record_file_change(&file, ChangeKind::Deleted, None)
            .await?;
        info!(file_id = %id, tracked, "File moved to trash");
        Ok(file)
    }

    /// Bring a file back from the trash; every client re-uploads it
    pub async fn restore(&self, id: &FileId) -> Result<File> {
        let _lock = self.locks.lock(id).await;
        let mut file = self.load(id).await?;
        file.restore(Utc::now())?;
        self.store
            .save_file(&file)
            .await
            .context("Failed to save restored file")?;
        self.tracker
            .record_file_change(&file, ChangeKind::Restored, None)
            .await?;
        info!(file_id = %id, "File restored from trash");
        Ok(file)
    }

    /// Permanently delete a file with its content, mappings and ledger rows
    pub async fn purge(&self, id: &FileId) -> Result<()> {
        let _lock = self.locks.lock(id).await;
        let file = self.load(id).await?;
        self.tracker.forget_file(id).await?;
        self.blobs
            .delete(file.storage_path())
            .await
            .context("Failed to delete file content")?;
        self.store
            .delete_file(id)
            .await
            .context("Failed to delete file record")?;
        info!(file_id = %id, "File purged");
        Ok(())
    }
}
