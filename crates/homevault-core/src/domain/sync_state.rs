//! FileSyncState domain entity
//!
//! The pending-operation ledger entry for one (owner, client, file) triple.
//!
//! ## State Machine
//!
//! ```text
//!   created ──► Added ──────────┐
//!                 │             │ confirm
//!                 │ delete      ▼
//!                 │         Unchanged ◄──── confirm ──── Modified
//!                 │             │  └──── local change ───►  │
//!                 ▼             │ delete                    │ delete
//!              Deleted ◄────────┴───────────────────────────┘
//!                 │
//!                 └── confirm ──► (row removed)
//! ```
//!
//! Restoring a file from the trash starts a new cycle at `Added`, whatever
//! the previous state was.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ClientId, ContentHash, FileId, FolderId, OwnerId, RemoteId};

// ============================================================================
// SyncOperation
// ============================================================================

/// Operation pending for one file on one client since the last confirmed sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOperation {
    /// Never synced to this client
    Added,
    /// Changed locally since the last confirmed sync
    Modified,
    /// Deleted locally, remote copy still to be removed
    Deleted,
    /// In sync as of the last confirmation
    Unchanged,
}

/// Local event that moves the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Restored,
}

impl SyncOperation {
    /// True for every state other than `Unchanged`
    pub fn is_pending(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
        }
    }

    /// Whether a confirmed sync may move this state to `target`
    pub fn can_transition_to(&self, target: SyncOperation) -> bool {
        use SyncOperation::*;
        matches!(
            (self, target),
            (Added, Unchanged)
                | (Added, Deleted)
                | (Modified, Unchanged)
                | (Modified, Deleted)
                | (Unchanged, Modified)
                | (Unchanged, Deleted)
                | (Unchanged, Unchanged)
        )
    }

    /// Next state after a local change, or `None` when no row is needed
    ///
    /// A deletion of a file the client never tracked leaves nothing to
    /// propagate.
    pub fn after_change(current: Option<SyncOperation>, change: ChangeKind) -> Option<Self> {
        use SyncOperation::*;
        match (current, change) {
            (_, ChangeKind::Restored) => Some(Added),
            (None, ChangeKind::Deleted) => None,
            (Some(_), ChangeKind::Deleted) => Some(Deleted),
            (None, ChangeKind::Created | ChangeKind::Modified) => Some(Added),
            (Some(Unchanged), ChangeKind::Created | ChangeKind::Modified) => Some(Modified),
            (Some(op), ChangeKind::Created | ChangeKind::Modified) => Some(op),
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(Self::Added),
            "modified" => Ok(Self::Modified),
            "deleted" => Ok(Self::Deleted),
            "unchanged" => Ok(Self::Unchanged),
            _ => Err(DomainError::UnknownVariant {
                kind: "sync operation",
                value: s.to_string(),
            }),
        }
    }
}

// ============================================================================
// Keys and remote references
// ============================================================================

/// Compound key of a FileSyncState row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyncStateKey {
    pub owner: OwnerId,
    pub client: ClientId,
    pub file: FileId,
}

impl fmt::Display for SyncStateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.client, self.file)
    }
}

/// Remote identity of a file as last seen on a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub remote_id: RemoteId,
    pub remote_name: String,
    pub remote_path: String,
    pub remote_last_modified: Option<DateTime<Utc>>,
}

// ============================================================================
// FileSyncState
// ============================================================================

/// Ledger entry driving the next reconciliation pass for one file/client pair
///
/// `version` is owned by the store: it is bumped on every successful write
/// and used as the compare-and-set token for confirmations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSyncState {
    owner: OwnerId,
    client: ClientId,
    file: FileId,
    folder: Option<FolderId>,
    operation: SyncOperation,
    last_known_hash: Option<ContentHash>,
    remote_id: Option<RemoteId>,
    remote_name: Option<String>,
    remote_path: Option<String>,
    remote_last_modified: Option<DateTime<Utc>>,
    last_sync_date: Option<DateTime<Utc>>,
    version: u64,
    updated_at: DateTime<Utc>,
}

impl FileSyncState {
    pub fn new(key: SyncStateKey, folder: Option<FolderId>, operation: SyncOperation) -> Self {
        Self {
            owner: key.owner,
            client: key.client,
            file: key.file,
            folder,
            operation,
            last_known_hash: None,
            remote_id: None,
            remote_name: None,
            remote_path: None,
            remote_last_modified: None,
            last_sync_date: None,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    // --- Getters ---

    pub fn key(&self) -> SyncStateKey {
        SyncStateKey {
            owner: self.owner,
            client: self.client,
            file: self.file,
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn client(&self) -> &ClientId {
        &self.client
    }

    pub fn file(&self) -> &FileId {
        &self.file
    }

    pub fn folder(&self) -> Option<&FolderId> {
        self.folder.as_ref()
    }

    pub fn operation(&self) -> SyncOperation {
        self.operation
    }

    /// Hash of the content the client held at the last confirmation
    pub fn last_known_hash(&self) -> Option<&ContentHash> {
        self.last_known_hash.as_ref()
    }

    pub fn remote_id(&self) -> Option<&RemoteId> {
        self.remote_id.as_ref()
    }

    pub fn remote_name(&self) -> Option<&str> {
        self.remote_name.as_deref()
    }

    pub fn remote_path(&self) -> Option<&str> {
        self.remote_path.as_deref()
    }

    pub fn remote_last_modified(&self) -> Option<DateTime<Utc>> {
        self.remote_last_modified
    }

    pub fn last_sync_date(&self) -> Option<DateTime<Utc>> {
        self.last_sync_date
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Remote identity, when the file has one on this client
    pub fn remote(&self) -> Option<RemoteRef> {
        self.remote_id.as_ref().map(|id| RemoteRef {
            remote_id: id.clone(),
            remote_name: self.remote_name.clone().unwrap_or_default(),
            remote_path: self.remote_path.clone().unwrap_or_default(),
            remote_last_modified: self.remote_last_modified,
        })
    }

    // --- Mutations ---

    /// Apply a local change; returns `false` when the row should not exist
    pub fn apply_change(&mut self, change: ChangeKind) -> bool {
        match SyncOperation::after_change(Some(self.operation), change) {
            Some(next) => {
                self.operation = next;
                self.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Record a confirmed sync: the client now holds `hash` under `remote`
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` for `Deleted` rows, which are
    /// removed rather than confirmed.
    pub fn mark_synced(
        &mut self,
        remote: RemoteRef,
        hash: ContentHash,
        at: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        if !self.operation.can_transition_to(SyncOperation::Unchanged) {
            return Err(DomainError::InvalidState {
                from: self.operation.to_string(),
                to: SyncOperation::Unchanged.to_string(),
            });
        }
        self.operation = SyncOperation::Unchanged;
        self.record_remote(remote, hash, at);
        Ok(())
    }

    /// Store the remote identity and known hash without touching the operation
    pub fn record_remote(&mut self, remote: RemoteRef, hash: ContentHash, at: DateTime<Utc>) {
        self.remote_id = Some(remote.remote_id);
        self.remote_name = Some(remote.remote_name);
        self.remote_path = Some(remote.remote_path);
        self.remote_last_modified = remote.remote_last_modified;
        self.last_known_hash = Some(hash);
        self.last_sync_date = Some(at);
        self.updated_at = at;
    }

    /// Forget the remote identity, e.g. after the remote copy was removed
    pub fn clear_remote(&mut self) {
        self.remote_id = None;
        self.remote_name = None;
        self.remote_path = None;
        self.remote_last_modified = None;
        self.last_known_hash = None;
        self.updated_at = Utc::now();
    }

    pub fn set_operation(&mut self, operation: SyncOperation) {
        self.operation = operation;
        self.updated_at = Utc::now();
    }

    pub fn set_remote_last_modified(&mut self, at: DateTime<Utc>) {
        self.remote_last_modified = Some(at);
        self.updated_at = Utc::now();
    }

    /// Set by store adapters when loading or after a successful write
    pub fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}
