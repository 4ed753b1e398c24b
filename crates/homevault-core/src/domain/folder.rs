//! Folder domain entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{validate_name, FolderId, OwnerId};

/// A local folder
///
/// (owner, parent, name) is unique among non-deleted folders; the store
/// enforces this with a partial unique index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    id: FolderId,
    owner: OwnerId,
    name: String,
    parent: Option<FolderId>,
    share_token: Option<String>,
    is_deleted: bool,
    created_at: DateTime<Utc>,
}

impl Folder {
    /// # Errors
    /// Returns `DomainError::InvalidName` if `name` is not a valid folder name
    pub fn new(
        owner: OwnerId,
        parent: Option<FolderId>,
        name: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self {
            id: FolderId::new(),
            owner,
            name,
            parent,
            share_token: None,
            is_deleted: false,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> &FolderId {
        &self.id
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&FolderId> {
        self.parent.as_ref()
    }

    /// Public-share token, if the folder is shared
    pub fn share_token(&self) -> Option<&str> {
        self.share_token.as_deref()
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// # Errors
    /// Returns `DomainError::InvalidName` if `name` is not a valid folder name
    pub fn rename(&mut self, name: impl Into<String>) -> Result<(), DomainError> {
        let name = name.into();
        validate_name(&name)?;
        self.name = name;
        Ok(())
    }

    pub fn set_share_token(&mut self, token: Option<String>) {
        self.share_token = token;
    }

    pub fn soft_delete(&mut self) {
        self.is_deleted = true;
    }

    pub fn restore(&mut self) {
        self.is_deleted = false;
    }
}
