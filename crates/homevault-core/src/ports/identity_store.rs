//! Identity store port (driven/secondary port)
//!
//! Durable storage for the five sync entities: files, folders, clients,
//! sync folder bindings and per-file sync ledger entries.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because storage errors are adapter-specific
//!   (SQLite, in-memory, etc.) and don't need domain-level classification.
//! - Sync ledger writes are compare-and-set on `FileSyncState::version`.
//!   This is what keeps a confirmation from overwriting a mutation that
//!   arrived after the entry was listed.
//! - All write operations take references to domain entities, allowing
//!   the caller to retain ownership.

use crate::domain::{
    Client, ClientId, File, FileId, FileSyncState, Folder, FolderId, OwnerId, RemoteId,
    SyncFolder, SyncStateKey,
};

/// Persistent storage for the sync entities
///
/// ## Implementation Notes
///
/// - Each method is atomic on its own; callers never rely on multi-call
///   transactions.
/// - `put_sync_state` with `expected_version = None` is an insert that fails
///   (returns `false`) if the row exists; with `Some(v)` it is an update that
///   fails if the stored version is not `v`. On success the stored version
///   is bumped by one.
/// - Deleting a file cascades to its sync ledger rows.
#[async_trait::async_trait]
pub trait IIdentityStore: Send + Sync {
    // --- File operations ---

    /// Saves a file (insert or update)
    async fn save_file(&self, file: &File) -> anyhow::Result<()>;

    /// Retrieves a file by its ID, deleted or not
    async fn get_file(&self, id: &FileId) -> anyhow::Result<Option<File>>;

    /// Files in `folder` (root when `None`) named exactly `name`, including
    /// soft-deleted ones
    async fn find_files_by_name(
        &self,
        owner: &OwnerId,
        folder: Option<&FolderId>,
        name: &str,
    ) -> anyhow::Result<Vec<File>>;

    /// Files directly inside `folder` (root when `None`)
    async fn list_files_in_folder(
        &self,
        owner: &OwnerId,
        folder: Option<&FolderId>,
        include_deleted: bool,
    ) -> anyhow::Result<Vec<File>>;

    /// Finds the file mapped to `remote_id` on `client`
    async fn find_file_by_remote_id(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        remote_id: &RemoteId,
    ) -> anyhow::Result<Option<File>>;

    /// Permanently deletes a file and its sync ledger rows
    async fn delete_file(&self, id: &FileId) -> anyhow::Result<()>;

    // --- Folder operations ---

    /// Saves a folder (insert or update)
    ///
    /// Fails if another non-deleted folder of the same owner has the same
    /// parent and name.
    async fn save_folder(&self, folder: &Folder) -> anyhow::Result<()>;

    /// Retrieves a folder by its ID
    async fn get_folder(&self, id: &FolderId) -> anyhow::Result<Option<Folder>>;

    // --- Client operations ---

    /// Saves a client (insert or update)
    async fn save_client(&self, client: &Client) -> anyhow::Result<()>;

    /// Retrieves a client by its ID
    async fn get_client(&self, id: &ClientId) -> anyhow::Result<Option<Client>>;

    /// All clients of an owner
    async fn list_clients(&self, owner: &OwnerId) -> anyhow::Result<Vec<Client>>;

    /// Active, connected clients with auto-sync enabled, across all owners
    async fn list_auto_sync_clients(&self) -> anyhow::Result<Vec<Client>>;

    // --- SyncFolder operations ---

    /// Saves a sync folder binding (insert or update, keyed by owner and folder)
    async fn save_sync_folder(&self, sync_folder: &SyncFolder) -> anyhow::Result<()>;

    /// Retrieves the binding for a local folder
    async fn get_sync_folder(
        &self,
        owner: &OwnerId,
        folder: &FolderId,
    ) -> anyhow::Result<Option<SyncFolder>>;

    /// Bindings of an owner that contain a configuration for `client`
    async fn list_sync_folders_for_client(
        &self,
        owner: &OwnerId,
        client: &ClientId,
    ) -> anyhow::Result<Vec<SyncFolder>>;

    // --- FileSyncState operations ---

    /// Retrieves one ledger row
    async fn get_sync_state(&self, key: &SyncStateKey) -> anyhow::Result<Option<FileSyncState>>;

    /// Compare-and-set write of a ledger row
    ///
    /// Returns `false` without writing when the version check fails.
    async fn put_sync_state(
        &self,
        state: &FileSyncState,
        expected_version: Option<u64>,
    ) -> anyhow::Result<bool>;

    /// Compare-and-set removal of a ledger row
    ///
    /// Returns `false` without deleting when the row is missing or its
    /// version differs.
    async fn delete_sync_state(
        &self,
        key: &SyncStateKey,
        expected_version: u64,
    ) -> anyhow::Result<bool>;

    /// Ledger rows of one client, optionally restricted to a folder
    async fn list_sync_states(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        folder: Option<&FolderId>,
    ) -> anyhow::Result<Vec<FileSyncState>>;

    /// Ledger rows of one file across all clients
    async fn list_file_sync_states(&self, file: &FileId) -> anyhow::Result<Vec<FileSyncState>>;
}
