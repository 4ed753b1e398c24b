//! Change tracker use case
//!
//! Records, per (owner, client, file), which operation is pending since the
//! last confirmed sync. Pure ledger bookkeeping on top of the identity
//! store; it never talks to a provider.
//!
//! Every write is a compare-and-set on the row version. `mark_pending` is a
//! read-compute-CAS loop; `confirm` is a single CAS against the version the
//! engine listed, so a mutation that lands in between is never downgraded.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::domain::{
    ChangeKind, ClientId, ContentHash, File, FileId, FileSyncState, FolderId, OwnerId, RemoteRef,
    SyncOperation, SyncStateKey,
};
use crate::ports::IIdentityStore;

/// Attempts of a read-compute-CAS loop before giving up
const MAX_CAS_ATTEMPTS: usize = 8;

/// What the engine confirms after a successful remote operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// The client now holds `hash` under `remote`
    Synced { remote: RemoteRef, hash: ContentHash },
    /// The remote copy is gone; the row is removed
    Removed,
}

/// Result of a confirmation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The listed row was confirmed as-is
    Confirmed,
    /// A newer mutation arrived; only the remote identity was recorded and
    /// the pending operation was kept
    Superseded,
    /// The row no longer exists
    Missing,
}

/// Pending-operation ledger
#[derive(Clone)]
pub struct ChangeTracker {
    store: Arc<dyn IIdentityStore>,
}

impl ChangeTracker {
    pub fn new(store: Arc<dyn IIdentityStore>) -> Self {
        Self { store }
    }

    /// Apply a local change to one ledger row (idempotent upsert)
    ///
    /// Returns the resulting operation, or `None` when the change leaves no
    /// row behind (deleting a file this client never tracked).
    pub async fn mark_pending(
        &self,
        key: SyncStateKey,
        folder: Option<FolderId>,
        change: ChangeKind,
    ) -> Result<Option<SyncOperation>> {
        for attempt in 0..MAX_CAS_ATTEMPTS {
            let current = self
                .store
                .get_sync_state(&key)
                .await
                .context("Failed to read sync state")?;

            match current {
                None => match SyncOperation::after_change(None, change) {
                    None => return Ok(None),
                    Some(op) => {
                        let state = FileSyncState::new(key, folder, op);
                        if self.store.put_sync_state(&state, None).await? {
                            return Ok(Some(op));
                        }
                    }
                },
                Some(mut state) => {
                    let expected = state.version();
                    let before = state.operation();
                    state.apply_change(change);
                    let after = state.operation();
                    if before == after {
                        return Ok(Some(after));
                    }
                    if self.store.put_sync_state(&state, Some(expected)).await? {
                        debug!(%key, from = %before, to = %after, "Sync state updated");
                        return Ok(Some(after));
                    }
                }
            }

            debug!(%key, attempt, "Sync state changed concurrently, retrying");
        }

        bail!("Could not update sync state {key} after {MAX_CAS_ATTEMPTS} attempts")
    }

    /// Rows of one client that still need work
    pub async fn list_pending(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        folder: Option<&FolderId>,
    ) -> Result<Vec<FileSyncState>> {
        let states = self.list_states(owner, client, folder).await?;
        Ok(states
            .into_iter()
            .filter(|s| s.operation().is_pending())
            .collect())
    }

    /// Every row of one client, pending or not
    pub async fn list_states(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        folder: Option<&FolderId>,
    ) -> Result<Vec<FileSyncState>> {
        self.store
            .list_sync_states(owner, client, folder)
            .await
            .context("Failed to list sync states")
    }

    /// Confirm a remote operation against the row as it was listed
    ///
    /// If the row changed since `listed` was read, the fresh pending
    /// operation is kept: a `Synced` confirmation still records the new
    /// remote identity (so the next pass updates instead of re-uploading),
    /// and a `Removed` confirmation clears it.
    pub async fn confirm(
        &self,
        listed: &FileSyncState,
        confirmation: Confirmation,
    ) -> Result<ConfirmOutcome> {
        let key = listed.key();
        let expected = listed.version();
        let now = Utc::now();

        let applied = match &confirmation {
            Confirmation::Synced { remote, hash } => {
                let mut next = listed.clone();
                next.mark_synced(remote.clone(), hash.clone(), now)?;
                self.store.put_sync_state(&next, Some(expected)).await?
            }
            Confirmation::Removed => self.store.delete_sync_state(&key, expected).await?,
        };
        if applied {
            return Ok(ConfirmOutcome::Confirmed);
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(mut fresh) = self.store.get_sync_state(&key).await? else {
                return Ok(ConfirmOutcome::Missing);
            };
            let version = fresh.version();
            match &confirmation {
                Confirmation::Synced { remote, hash } => {
                    fresh.record_remote(remote.clone(), hash.clone(), now)
                }
                Confirmation::Removed => fresh.clear_remote(),
            }
            if self.store.put_sync_state(&fresh, Some(version)).await? {
                debug!(%key, op = %fresh.operation(), "Confirmation superseded by newer change");
                return Ok(ConfirmOutcome::Superseded);
            }
        }

        bail!("Could not confirm sync state {key} after {MAX_CAS_ATTEMPTS} attempts")
    }

    /// Start tracking a file that was just pulled from `remote`
    ///
    /// Returns `false` if a row already existed.
    pub async fn track_synced(
        &self,
        key: SyncStateKey,
        folder: Option<FolderId>,
        remote: RemoteRef,
        hash: ContentHash,
    ) -> Result<bool> {
        let mut state = FileSyncState::new(key, folder, SyncOperation::Unchanged);
        state.record_remote(remote, hash, Utc::now());
        self.store
            .put_sync_state(&state, None)
            .await
            .context("Failed to insert sync state")
    }

    /// Fan a local change out to every active client of the file's folder
    ///
    /// `except` skips the client the change came from. Returns how many
    /// rows were touched.
    pub async fn record_file_change(
        &self,
        file: &File,
        change: ChangeKind,
        except: Option<&ClientId>,
    ) -> Result<usize> {
        let Some(folder) = file.folder() else {
            return Ok(0);
        };
        let Some(sync_folder) = self
            .store
            .get_sync_folder(file.owner(), folder)
            .await
            .context("Failed to load sync folder")?
        else {
            return Ok(0);
        };

        let mut touched = 0;
        for config in sync_folder.active_clients() {
            if Some(&config.client) == except {
                continue;
            }
            let key = SyncStateKey {
                owner: *file.owner(),
                client: config.client,
                file: *file.id(),
            };
            if self.mark_pending(key, Some(*folder), change).await?.is_some() {
                touched += 1;
            }
        }
        Ok(touched)
    }

    /// Add rows for active files in `folder` that `client` does not track yet
    ///
    /// Covers files that existed before the client was attached to the
    /// folder. Returns how many rows were created.
    pub async fn seed_folder(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        folder: &FolderId,
    ) -> Result<usize> {
        let files = self
            .store
            .list_files_in_folder(owner, Some(folder), false)
            .await
            .context("Failed to list folder files")?;
        let tracked: std::collections::HashSet<FileId> = self
            .list_states(owner, client, Some(folder))
            .await?
            .into_iter()
            .map(|s| *s.file())
            .collect();

        let mut seeded = 0;
        for file in files.iter().filter(|f| !tracked.contains(f.id())) {
            let key = SyncStateKey {
                owner: *owner,
                client: *client,
                file: *file.id(),
            };
            if self
                .mark_pending(key, Some(*folder), ChangeKind::Created)
                .await?
                .is_some()
            {
                seeded += 1;
            }
        }
        Ok(seeded)
    }

    /// Remove every row of a file that is being purged
    pub async fn forget_file(&self, file: &FileId) -> Result<()> {
        let states = self
            .store
            .list_file_sync_states(file)
            .await
            .context("Failed to list sync states of file")?;
        for state in states {
            if !self
                .store
                .delete_sync_state(&state.key(), state.version())
                .await?
            {
                warn!(key = %state.key(), "Sync state changed while purging; store cascade will remove it");
            }
        }
        Ok(())
    }
}
