//! Duplicate-name resolution at file-creation time
//!
//! A new file may collide with an active file of the same name in the same
//! folder. Without an explicit action the caller gets a `DUPLICATE_FILE`
//! error carrying the existing file and a free name to retry with. A
//! collision with trashed files only is not a duplicate: the most recently
//! trashed one is restored and its content replaced.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use homevault_core::domain::{
    guess_mime_type, validate_name, DomainError, File, FolderId, OwnerId,
};
use homevault_core::ports::{IBlobStore, IIdentityStore};
use homevault_core::usecases::{FileLifecycle, FileLocks};

use crate::error::ResolveError;
use crate::namer::unique_name;

/// What to do when the name is already taken by an active file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    /// Replace the existing file's content in place
    Overwrite,
    /// Store under the next free name
    Rename,
    /// Abort without side effects
    Cancel,
}

impl DuplicateAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Overwrite => "overwrite",
            Self::Rename => "rename",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for DuplicateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DuplicateAction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "overwrite" => Ok(Self::Overwrite),
            "rename" => Ok(Self::Rename),
            "cancel" => Ok(Self::Cancel),
            _ => Err(DomainError::UnknownVariant {
                kind: "duplicate action",
                value: s.to_string(),
            }),
        }
    }
}

/// A file the caller wants to store
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub owner: OwnerId,
    /// `None` is the owner's root
    pub folder: Option<FolderId>,
    pub name: String,
    pub content: Vec<u8>,
    /// Guessed from the name when absent
    pub mime_type: Option<String>,
}

impl CreateRequest {
    pub fn new(
        owner: OwnerId,
        folder: Option<FolderId>,
        name: impl Into<String>,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            owner,
            folder,
            name: name.into(),
            content: content.into(),
            mime_type: None,
        }
    }

    #[must_use]
    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    fn mime(&self) -> String {
        self.mime_type
            .clone()
            .unwrap_or_else(|| guess_mime_type(&self.name).to_string())
    }
}

/// Applies the duplicate policy and stores the file
pub struct DuplicateResolver {
    store: Arc<dyn IIdentityStore>,
    lifecycle: FileLifecycle,
}

impl DuplicateResolver {
    pub fn new(store: Arc<dyn IIdentityStore>, blobs: Arc<dyn IBlobStore>) -> Self {
        let lifecycle = FileLifecycle::new(Arc::clone(&store), blobs);
        Self { store, lifecycle }
    }

    /// Serializes overwrites with other users of the same lock table
    #[must_use]
    pub fn with_file_locks(mut self, locks: Arc<FileLocks>) -> Self {
        self.lifecycle = self.lifecycle.with_file_locks(locks);
        self
    }

    /// Creates the requested file, resolving name collisions per `action`
    ///
    /// # Errors
    /// - [`ResolveError::Validation`] for a bad name or folder, before any write
    /// - [`ResolveError::Duplicate`] for an active collision without action
    /// - [`ResolveError::Cancelled`] for an active collision with `Cancel`
    #[instrument(skip(self, request), fields(owner = %request.owner, name = %request.name, action = ?action))]
    pub async fn resolve_create(
        &self,
        request: CreateRequest,
        action: Option<DuplicateAction>,
    ) -> Result<File, ResolveError> {
        validate_name(&request.name).map_err(|e| ResolveError::Validation(e.to_string()))?;
        self.validate_folder(&request.owner, request.folder.as_ref())
            .await?;

        let matches = self
            .store
            .find_files_by_name(&request.owner, request.folder.as_ref(), &request.name)
            .await?;
        let (active, trashed): (Vec<File>, Vec<File>) =
            matches.into_iter().partition(|f| !f.is_deleted());

        let mime = request.mime();

        let Some(mut existing) = active.into_iter().next() else {
            if let Some(previous) = trashed.into_iter().max_by_key(|f| f.deleted_at()) {
                return self.restore_and_overwrite(previous, &request, &mime).await;
            }
            let file = self
                .lifecycle
                .create(
                    request.owner,
                    request.folder,
                    &request.name,
                    &request.content,
                    &mime,
                )
                .await?;
            return Ok(file);
        };

        match action {
            None => {
                let suggested_name = self.suggest_name(&request).await?;
                debug!(existing = %existing.id(), %suggested_name, "Duplicate name");
                Err(ResolveError::Duplicate {
                    existing_file: Box::new(existing),
                    suggested_name,
                })
            }
            Some(DuplicateAction::Cancel) => Err(ResolveError::Cancelled),
            Some(DuplicateAction::Overwrite) => {
                self.lifecycle
                    .overwrite(&mut existing, &request.content, &mime)
                    .await?;
                info!(file_id = %existing.id(), "Existing file overwritten");
                Ok(existing)
            }
            Some(DuplicateAction::Rename) => {
                let name = self.suggest_name(&request).await?;
                let file = self
                    .lifecycle
                    .create(request.owner, request.folder, &name, &request.content, &mime)
                    .await?;
                info!(file_id = %file.id(), %name, "Stored under a new name");
                Ok(file)
            }
        }
    }

    async fn validate_folder(
        &self,
        owner: &OwnerId,
        folder: Option<&FolderId>,
    ) -> Result<(), ResolveError> {
        let Some(folder_id) = folder else {
            return Ok(());
        };
        match self.store.get_folder(folder_id).await? {
            Some(f) if f.owner() != owner => Err(ResolveError::Validation(format!(
                "folder {folder_id} belongs to another owner"
            ))),
            Some(f) if f.is_deleted() => Err(ResolveError::Validation(format!(
                "folder {folder_id} is in the trash"
            ))),
            Some(_) => Ok(()),
            None => Err(ResolveError::Validation(format!(
                "folder {folder_id} not found"
            ))),
        }
    }

    /// First free name among the active files of the target folder
    async fn suggest_name(&self, request: &CreateRequest) -> Result<String, ResolveError> {
        let names: HashSet<String> = self
            .store
            .list_files_in_folder(&request.owner, request.folder.as_ref(), false)
            .await?
            .into_iter()
            .map(|f| f.name().to_string())
            .collect();
        Ok(unique_name(&request.name, |n| names.contains(n)))
    }

    async fn restore_and_overwrite(
        &self,
        trashed: File,
        request: &CreateRequest,
        mime: &str,
    ) -> Result<File, ResolveError> {
        // Restore first so the pending delete becomes a re-upload
        let mut file = self.lifecycle.restore(trashed.id()).await?;
        self.lifecycle
            .overwrite(&mut file, &request.content, mime)
            .await?;
        info!(file_id = %file.id(), "Trashed file restored with new content");
        Ok(file)
    }
}
