//! Reconciliation engine
//!
//! The [`ReconciliationEngine`] brings one (owner, client, folder) triple in
//! line with the client's remote folder.
//!
//! ## Pass Flow
//!
//! 1. **Inputs**: ledger rows of the client for the folder, remote listing
//! 2. **Push**: upload/update/delete pending local changes
//! 3. **Remote deletions**: tracked files that vanished remotely are trashed
//! 4. **Pull**: unknown remote files become new local files
//! 5. **Freshness**: in-sync files are compared by timestamp and hash
//!
//! Every remote operation is confirmed in the ledger on its own right after
//! it succeeds. A per-file failure is collected in [`SyncResult::errors`]
//! and leaves the row pending; a fatal (auth) failure aborts the pass.
//!
//! ## Retry Logic
//!
//! Transient provider errors (network, rate limiting, 5xx) are retried with
//! exponential backoff from `sync.retry_base_delay_ms`, at most
//! `sync.max_retries` times.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use homevault_conflict::{unique_name, Freshness, FreshnessDetector, FreshnessInput};
use homevault_core::config::SyncConfig;
use homevault_core::domain::{
    guess_mime_type, ChangeKind, ClientId, ClientMapping, ContentHash, File, FileId,
    FileSyncState, FolderId, OwnerId, RemoteId, RemoteRef, SyncFolderClient, SyncOperation,
    SyncStateKey,
};
use homevault_core::ports::{
    IBlobStore, IIdentityStore, IProviderAdapter, ProviderError, RemoteFileDescriptor,
};
use homevault_core::usecases::{ChangeTracker, ConfirmOutcome, Confirmation, FileLocks};

use crate::credentials::CredentialGuard;
use crate::registry::ProviderRegistry;
use crate::{classify_error, ErrorClass, SyncError};

// ============================================================================
// SyncResult
// ============================================================================

/// Why a single file could not be reconciled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Neither side is newer but the content differs; nothing was changed
    HashMismatchSameDate,
    /// A provider or store operation failed
    Operation { op: &'static str, message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HashMismatchSameDate => f.write_str("hash-mismatch-same-date"),
            Self::Operation { op, message } => write!(f, "{op} failed: {message}"),
        }
    }
}

/// A per-file failure collected during a pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    /// File name (local name, or remote name for pulls)
    pub file: String,
    pub file_id: Option<FileId>,
    pub reason: FailureReason,
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub uploaded: u32,
    pub downloaded: u32,
    pub deleted_local: u32,
    pub deleted_remote: u32,
    /// Files left untouched because both sides differ with no newer side
    pub conflicts: u32,
    pub errors: Vec<SyncFailure>,
    /// Wall-clock duration of the pass in milliseconds
    pub duration_ms: u64,
}

impl SyncResult {
    /// Number of files changed on either side
    pub fn changes(&self) -> u32 {
        self.uploaded + self.downloaded + self.deleted_local + self.deleted_remote
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Folds another pass into this one
    pub fn merge(&mut self, other: SyncResult) {
        self.uploaded += other.uploaded;
        self.downloaded += other.downloaded;
        self.deleted_local += other.deleted_local;
        self.deleted_remote += other.deleted_remote;
        self.conflicts += other.conflicts;
        self.errors.extend(other.errors);
        self.duration_ms += other.duration_ms;
    }

    fn fail(&mut self, file: &str, file_id: Option<FileId>, op: &'static str, err: &anyhow::Error) {
        warn!(file, ?file_id, op, error = %format!("{err:#}"), "File reconciliation failed");
        self.errors.push(SyncFailure {
            file: file.to_string(),
            file_id,
            reason: FailureReason::Operation {
                op,
                message: format!("{err:#}"),
            },
        });
    }
}

// ============================================================================
// Retry logic
// ============================================================================

/// Backoff settings for provider calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Executes an async operation with exponential backoff retry
///
/// Only transient errors are retried; everything else is returned at once.
async fn with_retry<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt, "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                if attempt < policy.max_retries && classify_error(&err) == ErrorClass::Transient {
                    let delay = policy.delay_for(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                } else {
                    return Err(err);
                }
            }
        }
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(ProviderError::find(err), Some(ProviderError::NotFound(_)))
}

fn remote_ref(desc: &RemoteFileDescriptor) -> RemoteRef {
    RemoteRef {
        remote_id: desc.id.clone(),
        remote_name: desc.name.clone(),
        remote_path: desc.path.clone(),
        remote_last_modified: Some(desc.modified_time),
    }
}

// ============================================================================
// ReconciliationEngine
// ============================================================================

/// What a pass needs about its target, resolved from the preconditions
struct PassContext {
    owner: OwnerId,
    client: ClientId,
    folder: FolderId,
    config: SyncFolderClient,
    remote_folder: RemoteId,
    provider: Arc<dyn IProviderAdapter>,
}

impl PassContext {
    fn key(&self, file: FileId) -> SyncStateKey {
        SyncStateKey {
            owner: self.owner,
            client: self.client,
            file,
        }
    }
}

/// Outcome of one phase-2 entry
enum PushOutcome {
    Uploaded,
    RemoteDeleted,
    Confirmed,
    Deferred,
}

/// Reconciles local files with connected clients
pub struct ReconciliationEngine {
    store: Arc<dyn IIdentityStore>,
    blobs: Arc<dyn IBlobStore>,
    tracker: ChangeTracker,
    registry: Arc<ProviderRegistry>,
    credentials: Arc<CredentialGuard>,
    locks: Arc<FileLocks>,
    retry: RetryPolicy,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn IIdentityStore>,
        blobs: Arc<dyn IBlobStore>,
        registry: Arc<ProviderRegistry>,
        config: &SyncConfig,
    ) -> Self {
        let credentials = Arc::new(CredentialGuard::new(
            Arc::clone(&store),
            config.token_refresh_margin(),
        ));
        Self {
            tracker: ChangeTracker::new(Arc::clone(&store)),
            store,
            blobs,
            registry,
            credentials,
            locks: Arc::new(FileLocks::new()),
            retry: RetryPolicy::from_config(config),
        }
    }

    /// Shares a lock table with the local file lifecycle
    #[must_use]
    pub fn with_file_locks(mut self, locks: Arc<FileLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Overrides the retry policy taken from the configuration
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn credentials(&self) -> &Arc<CredentialGuard> {
        &self.credentials
    }

    pub fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    pub fn file_locks(&self) -> &Arc<FileLocks> {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn IIdentityStore> {
        &self.store
    }

    /// Runs one reconciliation pass for (owner, client, folder)
    ///
    /// # Errors
    /// Precondition failures ([`SyncError::Validation`],
    /// [`SyncError::ClientNotFound`], [`SyncError::NoActiveConnection`],
    /// [`SyncError::RemoteFolderMissing`]) change nothing. A fatal provider
    /// error aborts the pass; entries confirmed before it stay confirmed.
    #[instrument(skip(self), fields(owner = %owner, client_id = %client, folder_id = %folder))]
    pub async fn reconcile(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        folder: &FolderId,
    ) -> Result<SyncResult, SyncError> {
        let start = Instant::now();
        let ctx = self.prepare(owner, client, folder).await?;

        info!(
            provider = ctx.provider.name(),
            direction = %ctx.config.direction,
            "Starting reconciliation pass"
        );

        let mut result = SyncResult::default();
        let outcome = self.run_phases(&ctx, &mut result).await;
        result.duration_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                self.touch_config(&ctx).await;
                info!(
                    uploaded = result.uploaded,
                    downloaded = result.downloaded,
                    deleted_local = result.deleted_local,
                    deleted_remote = result.deleted_remote,
                    conflicts = result.conflicts,
                    errors = result.errors.len(),
                    duration_ms = result.duration_ms,
                    "Reconciliation pass complete"
                );
                Ok(result)
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "Reconciliation pass aborted");
                Err(SyncError::Other(err))
            }
        }
    }

    /// Checks preconditions and resolves the remote folder
    async fn prepare(
        &self,
        owner: &OwnerId,
        client_id: &ClientId,
        folder: &FolderId,
    ) -> Result<PassContext, SyncError> {
        let client = self
            .store
            .get_client(client_id)
            .await
            .context("Failed to load client")?
            .ok_or(SyncError::ClientNotFound(*client_id))?;
        if client.owner() != owner {
            return Err(SyncError::Validation(format!(
                "client {client_id} belongs to another owner"
            )));
        }
        if !client.is_active() {
            return Err(SyncError::Validation(format!("client {client_id} is inactive")));
        }

        let sync_folder = self
            .store
            .get_sync_folder(owner, folder)
            .await
            .context("Failed to load sync folder")?
            .ok_or_else(|| SyncError::Validation(format!("folder {folder} is not synced")))?;
        if !sync_folder.is_active() {
            return Err(SyncError::Validation(format!(
                "sync of folder {folder} is paused"
            )));
        }
        let config = sync_folder
            .client_config(client_id)
            .filter(|c| c.is_active)
            .cloned()
            .ok_or_else(|| {
                SyncError::Validation(format!(
                    "client {client_id} has no active configuration for folder {folder}"
                ))
            })?;

        let provider = self
            .registry
            .get(client_id)
            .ok_or(SyncError::NoActiveConnection(*client_id))?;
        self.credentials
            .ensure_fresh(client_id, provider.as_ref())
            .await?;

        let remote_folder = match &config.remote_folder_id {
            Some(id) => {
                let found = with_retry(&self.retry, "get_folder", || provider.get_folder(id))
                    .await
                    .context("Failed to look up remote folder")?;
                if found.is_none() {
                    return Err(SyncError::RemoteFolderMissing(id.to_string()));
                }
                id.clone()
            }
            None => self.create_remote_folder(owner, client_id, folder, &config, &provider).await?,
        };

        Ok(PassContext {
            owner: *owner,
            client: *client_id,
            folder: *folder,
            config,
            remote_folder,
            provider,
        })
    }

    async fn create_remote_folder(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        folder: &FolderId,
        config: &SyncFolderClient,
        provider: &Arc<dyn IProviderAdapter>,
    ) -> Result<RemoteId, SyncError> {
        let created = with_retry(&self.retry, "create_folder", || {
            provider.create_folder(None, &config.remote_folder_name)
        })
        .await
        .context("Failed to create remote folder")?;

        // Re-read so concurrent edits to other clients' configs survive
        let mut sync_folder = self
            .store
            .get_sync_folder(owner, folder)
            .await
            .context("Failed to reload sync folder")?
            .ok_or_else(|| SyncError::Validation(format!("folder {folder} is not synced")))?;
        if let Some(cfg) = sync_folder.client_config_mut(client) {
            cfg.remote_folder_id = Some(created.id.clone());
            cfg.remote_folder_path = created.path.clone();
        }
        self.store
            .save_sync_folder(&sync_folder)
            .await
            .context("Failed to store remote folder id")?;

        info!(remote_folder = %created.id, path = %created.path, "Remote folder created");
        Ok(created.id)
    }

    /// Records the pass time on the client's folder configuration
    async fn touch_config(&self, ctx: &PassContext) {
        let update = async {
            if let Some(mut sync_folder) = self.store.get_sync_folder(&ctx.owner, &ctx.folder).await? {
                if let Some(cfg) = sync_folder.client_config_mut(&ctx.client) {
                    cfg.last_sync_date = Some(Utc::now());
                }
                self.store.save_sync_folder(&sync_folder).await?;
            }
            anyhow::Ok(())
        };
        if let Err(e) = update.await {
            warn!(error = %e, "Failed to record folder sync time");
        }
    }

    async fn run_phases(&self, ctx: &PassContext, result: &mut SyncResult) -> Result<()> {
        // Phase 1: inputs
        if ctx.config.direction.pushes() {
            let seeded = self
                .tracker
                .seed_folder(&ctx.owner, &ctx.client, &ctx.folder)
                .await?;
            if seeded > 0 {
                debug!(seeded, "Started tracking files added before the client");
            }
        }
        let states = self
            .tracker
            .list_states(&ctx.owner, &ctx.client, Some(&ctx.folder))
            .await?;
        let listing = with_retry(&self.retry, "list_remote_files", || {
            ctx.provider.list_remote_files(&ctx.remote_folder)
        })
        .await
        .context("Failed to list remote files")?;
        let remote: HashMap<&RemoteId, &RemoteFileDescriptor> = listing
            .iter()
            .filter(|d| !d.is_folder)
            .map(|d| (&d.id, d))
            .collect();

        debug!(rows = states.len(), remote = remote.len(), "Pass inputs loaded");

        let mut handled: HashSet<FileId> = HashSet::new();

        // Phase 2: push
        if ctx.config.direction.pushes() {
            for state in &states {
                let vanished = state
                    .remote_id()
                    .is_some_and(|id| !remote.contains_key(id));
                if !state.operation().is_pending() && !vanished {
                    continue;
                }
                match self.push_entry(ctx, state, vanished).await {
                    Ok(PushOutcome::Uploaded) => {
                        result.uploaded += 1;
                        handled.insert(*state.file());
                    }
                    Ok(PushOutcome::RemoteDeleted) => {
                        result.deleted_remote += 1;
                        handled.insert(*state.file());
                    }
                    Ok(PushOutcome::Confirmed) => {
                        handled.insert(*state.file());
                    }
                    Ok(PushOutcome::Deferred) => {}
                    Err(err) => {
                        if classify_error(&err) == ErrorClass::Fatal {
                            return Err(err);
                        }
                        let name = self.display_name(state).await;
                        result.fail(&name, Some(*state.file()), "push", &err);
                        handled.insert(*state.file());
                    }
                }
            }
        }

        // Phase 3: remote deletions
        for state in &states {
            if handled.contains(state.file()) {
                continue;
            }
            let Some(remote_id) = state.remote_id() else {
                continue;
            };
            if remote.contains_key(remote_id) {
                continue;
            }
            handled.insert(*state.file());
            match self.apply_remote_deletion(ctx, state).await {
                Ok(true) => result.deleted_local += 1,
                Ok(false) => {}
                Err(err) => {
                    if classify_error(&err) == ErrorClass::Fatal {
                        return Err(err);
                    }
                    let name = self.display_name(state).await;
                    result.fail(&name, Some(*state.file()), "remote deletion", &err);
                }
            }
        }

        // Phase 4: pull
        let known: HashSet<&RemoteId> = states.iter().filter_map(|s| s.remote_id()).collect();
        if ctx.config.direction.pulls() {
            let mut taken = self.active_names(ctx).await?;
            for desc in listing.iter().filter(|d| !d.is_folder) {
                if known.contains(&desc.id) {
                    continue;
                }
                if !ctx.config.filters.allows(&desc.name, desc.size) {
                    debug!(name = %desc.name, size = desc.size, "Skipped by folder filters");
                    continue;
                }
                match self.pull_new(ctx, desc, &mut taken).await {
                    Ok(true) => result.downloaded += 1,
                    Ok(false) => {}
                    Err(err) => {
                        if classify_error(&err) == ErrorClass::Fatal {
                            return Err(err);
                        }
                        result.fail(&desc.name, None, "download", &err);
                    }
                }
            }
        }

        // Phase 5: freshness
        for state in &states {
            if handled.contains(state.file()) || state.operation() != SyncOperation::Unchanged {
                continue;
            }
            let Some(desc) = state.remote_id().and_then(|id| remote.get(id)) else {
                continue;
            };
            match self.refresh_entry(ctx, state, desc, result).await {
                Ok(()) => {}
                Err(err) => {
                    if classify_error(&err) == ErrorClass::Fatal {
                        return Err(err);
                    }
                    let name = self.display_name(state).await;
                    result.fail(&name, Some(*state.file()), "refresh", &err);
                }
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Phase 2
    // ------------------------------------------------------------------------

    async fn push_entry(
        &self,
        ctx: &PassContext,
        state: &FileSyncState,
        vanished: bool,
    ) -> Result<PushOutcome> {
        match state.operation() {
            SyncOperation::Deleted => self.push_deletion(ctx, state).await,
            SyncOperation::Added | SyncOperation::Modified => {
                let Some(file) = self.load_live_file(state).await? else {
                    return Ok(PushOutcome::Deferred);
                };
                // A vanished remote copy is re-created rather than updated
                let target = if vanished { None } else { state.remote_id() };
                self.push_content(ctx, state, &file, target).await
            }
            SyncOperation::Unchanged => {
                let Some(file) = self.load_live_file(state).await? else {
                    return Ok(PushOutcome::Deferred);
                };
                let drifted = state.last_known_hash() != Some(file.hash());
                if drifted || !ctx.config.direction.pulls() {
                    info!(file_id = %file.id(), drifted, "Remote copy vanished, uploading again");
                    self.push_content(ctx, state, &file, None).await
                } else {
                    Ok(PushOutcome::Deferred)
                }
            }
        }
    }

    async fn push_content(
        &self,
        ctx: &PassContext,
        state: &FileSyncState,
        file: &File,
        target: Option<&RemoteId>,
    ) -> Result<PushOutcome> {
        let content = self
            .blobs
            .read(file.storage_path())
            .await
            .with_context(|| format!("Failed to read content of {}", file.name()))?;
        let hash = ContentHash::of(&content);

        let desc = match target {
            Some(remote_id) => {
                debug!(file_id = %file.id(), %remote_id, "Updating remote file");
                with_retry(&self.retry, "update_file", || {
                    ctx.provider.update_file(remote_id, &content)
                })
                .await
                .context("Failed to update remote file")?
            }
            None => {
                debug!(file_id = %file.id(), name = %file.name(), "Uploading file");
                with_retry(&self.retry, "upload_file", || {
                    ctx.provider
                        .upload_file(&ctx.remote_folder, &content, file.name())
                })
                .await
                .context("Failed to upload file")?
            }
        };

        let outcome = self
            .tracker
            .confirm(
                state,
                Confirmation::Synced {
                    remote: remote_ref(&desc),
                    hash,
                },
            )
            .await?;
        if outcome == ConfirmOutcome::Missing {
            warn!(file_id = %file.id(), "Ledger row disappeared during upload");
        }
        // The ledger already holds the remote id; a missing mapping is
        // restored when the file is next compared with its remote copy.
        if let Err(e) = self.record_mapping(file.id(), ctx.client, &desc).await {
            warn!(file_id = %file.id(), error = %format!("{e:#}"), "Could not record client mapping");
        }
        Ok(PushOutcome::Uploaded)
    }

    async fn push_deletion(&self, ctx: &PassContext, state: &FileSyncState) -> Result<PushOutcome> {
        let mut deleted_remote = false;
        if let Some(remote_id) = state.remote_id() {
            match with_retry(&self.retry, "delete_file", || {
                ctx.provider.delete_file(remote_id)
            })
            .await
            {
                Ok(()) => deleted_remote = true,
                Err(err) if is_not_found(&err) => {
                    debug!(%remote_id, "Remote copy already gone");
                }
                Err(err) => return Err(err.context("Failed to delete remote file")),
            }
        }

        let outcome = self.tracker.confirm(state, Confirmation::Removed).await?;
        if outcome == ConfirmOutcome::Confirmed {
            self.clear_mapping(state.file(), &ctx.client).await?;
        }
        Ok(if deleted_remote {
            PushOutcome::RemoteDeleted
        } else {
            PushOutcome::Confirmed
        })
    }

    // ------------------------------------------------------------------------
    // Phase 3
    // ------------------------------------------------------------------------

    /// Trashes the local file of a row whose remote copy is gone
    ///
    /// Returns whether a local file was moved to the trash.
    async fn apply_remote_deletion(&self, ctx: &PassContext, state: &FileSyncState) -> Result<bool> {
        let _lock = self.locks.lock(state.file()).await;
        if !self.row_unchanged(ctx, state).await? {
            debug!(file_id = %state.file(), "Local change arrived before remote deletion applied");
            return Ok(false);
        }

        let file = self
            .store
            .get_file(state.file())
            .await
            .context("Failed to load file")?;

        let Some(mut file) = file else {
            self.tracker.confirm(state, Confirmation::Removed).await?;
            return Ok(false);
        };

        let trash = state.operation() != SyncOperation::Deleted && !file.is_deleted();
        if trash {
            file.soft_delete(Utc::now())?;
        }
        file.clear_mapping(&ctx.client);
        self.store
            .save_file(&file)
            .await
            .context("Failed to save trashed file")?;

        match self.tracker.confirm(state, Confirmation::Removed).await? {
            ConfirmOutcome::Confirmed | ConfirmOutcome::Missing => {}
            ConfirmOutcome::Superseded => {
                debug!(file_id = %file.id(), "Local change arrived during remote deletion");
            }
        }

        if trash {
            self.tracker
                .record_file_change(&file, ChangeKind::Deleted, Some(&ctx.client))
                .await?;
            info!(file_id = %file.id(), name = %file.name(), "Remote deletion applied locally");
        }
        Ok(trash)
    }

    // ------------------------------------------------------------------------
    // Phase 4
    // ------------------------------------------------------------------------

    async fn active_names(&self, ctx: &PassContext) -> Result<HashSet<String>> {
        Ok(self
            .store
            .list_files_in_folder(&ctx.owner, Some(&ctx.folder), false)
            .await
            .context("Failed to list local files")?
            .into_iter()
            .map(|f| f.name().to_string())
            .collect())
    }

    /// Creates a local file for an unknown remote file
    ///
    /// Returns `false` when the remote id already belongs to a local file.
    async fn pull_new(
        &self,
        ctx: &PassContext,
        desc: &RemoteFileDescriptor,
        taken: &mut HashSet<String>,
    ) -> Result<bool> {
        if let Some(existing) = self
            .store
            .find_file_by_remote_id(&ctx.owner, &ctx.client, &desc.id)
            .await
            .context("Failed to look up remote id")?
        {
            debug!(file_id = %existing.id(), remote_id = %desc.id, "Remote file already mapped");
            return Ok(false);
        }

        let content = with_retry(&self.retry, "download_file", || {
            ctx.provider.download_file(&desc.id)
        })
        .await
        .context("Failed to download remote file")?;
        let hash = ContentHash::of(&content);

        let name = unique_name(&desc.name, |n| taken.contains(n));
        let mime = desc
            .mime_type
            .clone()
            .unwrap_or_else(|| guess_mime_type(&desc.name).to_string());

        let mut file = File::new(
            ctx.owner,
            Some(ctx.folder),
            &name,
            &mime,
            content.len() as u64,
            hash.clone(),
        )?;
        file.set_last_modified(desc.modified_time);
        file.upsert_mapping(ClientMapping {
            client: ctx.client,
            remote_id: desc.id.clone(),
            remote_name: desc.name.clone(),
            remote_path: desc.path.clone(),
            last_sync_date: Utc::now(),
        });

        self.blobs
            .write(file.storage_path(), &content)
            .await
            .context("Failed to store downloaded content")?;
        self.store
            .save_file(&file)
            .await
            .context("Failed to save pulled file")?;
        self.tracker
            .track_synced(ctx.key(*file.id()), Some(ctx.folder), remote_ref(desc), hash)
            .await?;
        self.tracker
            .record_file_change(&file, ChangeKind::Created, Some(&ctx.client))
            .await?;

        taken.insert(name.clone());
        info!(file_id = %file.id(), %name, remote_id = %desc.id, "Pulled new file");
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Phase 5
    // ------------------------------------------------------------------------

    async fn refresh_entry(
        &self,
        ctx: &PassContext,
        state: &FileSyncState,
        desc: &RemoteFileDescriptor,
        result: &mut SyncResult,
    ) -> Result<()> {
        let Some(file) = self.load_live_file(state).await? else {
            return Ok(());
        };
        if file.mapping_for(&ctx.client).map(|m| &m.remote_id) != Some(&desc.id) {
            debug!(file_id = %file.id(), remote_id = %desc.id, "Restoring client mapping");
            self.record_mapping(file.id(), ctx.client, desc).await?;
        }

        let freshness = FreshnessDetector::evaluate(&FreshnessInput {
            local_modified: file.last_modified(),
            local_hash: file.hash(),
            last_known_hash: state.last_known_hash(),
            remote_modified: desc.modified_time,
            remote_hash: desc.hash.as_ref(),
            stored_remote_modified: state.remote_last_modified(),
        });

        match freshness {
            Freshness::UpToDate => Ok(()),
            Freshness::PushLocal => {
                debug!(file_id = %file.id(), "Local copy newer, queued for push");
                self.tracker
                    .mark_pending(ctx.key(*file.id()), Some(ctx.folder), ChangeKind::Modified)
                    .await?;
                Ok(())
            }
            Freshness::Conflict => {
                warn!(file_id = %file.id(), name = %file.name(), "Content differs with equal timestamps");
                result.conflicts += 1;
                result.errors.push(SyncFailure {
                    file: file.name().to_string(),
                    file_id: Some(*file.id()),
                    reason: FailureReason::HashMismatchSameDate,
                });
                Ok(())
            }
            Freshness::PullRemote => {
                if !ctx.config.direction.pulls() {
                    return Ok(());
                }
                if self.pull_update(ctx, state, desc, file.id()).await? {
                    result.downloaded += 1;
                }
                Ok(())
            }
        }
    }

    /// Downloads a newer remote version of a tracked file
    ///
    /// The download is applied under the file's lock and only if the ledger
    /// row is unchanged since listing; the file is re-read inside the lock.
    /// Returns whether local content changed.
    async fn pull_update(
        &self,
        ctx: &PassContext,
        state: &FileSyncState,
        desc: &RemoteFileDescriptor,
        file_id: &FileId,
    ) -> Result<bool> {
        let content = with_retry(&self.retry, "download_file", || {
            ctx.provider.download_file(&desc.id)
        })
        .await
        .context("Failed to download remote file")?;
        let hash = ContentHash::of(&content);
        let key = ctx.key(*file_id);

        let _lock = self.locks.lock(file_id).await;
        // A local edit since listing wins over the download
        if !self.row_unchanged(ctx, state).await? {
            debug!(%key, "Row changed before download could apply, skipped");
            return Ok(false);
        }
        let Some(mut file) = self.load_live_file(state).await? else {
            debug!(%key, "File removed locally before download could apply");
            return Ok(false);
        };

        let mut next = state.clone();
        next.record_remote(remote_ref(desc), hash.clone(), Utc::now());

        if &hash == file.hash() {
            if !self.store.put_sync_state(&next, Some(state.version())).await? {
                debug!(%key, "Row changed during metadata refresh, skipped");
            }
            return Ok(false);
        }

        self.blobs
            .write(file.storage_path(), &content)
            .await
            .context("Failed to store downloaded content")?;
        file.replace_content(content.len() as u64, hash, desc.modified_time);
        if let Some(mime) = &desc.mime_type {
            file.set_mime_type(mime.as_str());
        }
        file.upsert_mapping(ClientMapping {
            client: ctx.client,
            remote_id: desc.id.clone(),
            remote_name: desc.name.clone(),
            remote_path: desc.path.clone(),
            last_sync_date: Utc::now(),
        });
        self.store
            .save_file(&file)
            .await
            .context("Failed to save updated file")?;

        if !self.store.put_sync_state(&next, Some(state.version())).await? {
            debug!(%key, "Row changed while applying download");
        }
        self.tracker
            .record_file_change(&file, ChangeKind::Modified, Some(&ctx.client))
            .await?;

        info!(file_id = %file.id(), "Local copy replaced by newer remote version");
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    /// Loads the row's file unless it is gone or in the trash
    async fn load_live_file(&self, state: &FileSyncState) -> Result<Option<File>> {
        let file = self
            .store
            .get_file(state.file())
            .await
            .context("Failed to load file")?;
        Ok(file.filter(|f| !f.is_deleted()))
    }

    /// Whether the ledger row still has the version seen at listing
    async fn row_unchanged(&self, ctx: &PassContext, state: &FileSyncState) -> Result<bool> {
        let current = self.store.get_sync_state(&ctx.key(*state.file())).await?;
        Ok(current.map(|s| s.version()) == Some(state.version()))
    }

    async fn record_mapping(
        &self,
        file_id: &FileId,
        client: ClientId,
        desc: &RemoteFileDescriptor,
    ) -> Result<()> {
        let _lock = self.locks.lock(file_id).await;
        let Some(mut file) = self.store.get_file(file_id).await? else {
            return Ok(());
        };
        file.upsert_mapping(ClientMapping {
            client,
            remote_id: desc.id.clone(),
            remote_name: desc.name.clone(),
            remote_path: desc.path.clone(),
            last_sync_date: Utc::now(),
        });
        self.store
            .save_file(&file)
            .await
            .context("Failed to record client mapping")
    }

    async fn clear_mapping(&self, file_id: &FileId, client: &ClientId) -> Result<()> {
        let _lock = self.locks.lock(file_id).await;
        let Some(mut file) = self.store.get_file(file_id).await? else {
            return Ok(());
        };
        if file.clear_mapping(client) {
            self.store
                .save_file(&file)
                .await
                .context("Failed to clear client mapping")?;
        }
        Ok(())
    }

    async fn display_name(&self, state: &FileSyncState) -> String {
        match self.store.get_file(state.file()).await {
            Ok(Some(file)) => file.name().to_string(),
            _ => state
                .remote_name()
                .map(str::to_string)
                .unwrap_or_else(|| state.file().to_string()),
        }
    }
}
