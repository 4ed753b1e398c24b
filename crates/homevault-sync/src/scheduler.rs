//! Auto-sync scheduler - recurring reconciliation per client
//!
//! The [`AutoSyncScheduler`] owns one timer task per scheduled client. Each
//! tick reconciles every active sync folder bound to the client through the
//! [`ReconciliationEngine`].
//!
//! ## Flow
//!
//! ```text
//! start(client) ──→ timer task ──tick──→ reconcile(folder) × N
//!                       │                      │
//!                  CancellationToken      fatal error ──→ stop + disconnect
//! ```
//!
//! Ticks of one client never overlap: a tick that finds the previous one
//! still running is skipped. `shutdown()` prevents new ticks from doing work
//! and waits for running ones; a running pass is never aborted, because the
//! timer loop only selects on cancellation between ticks.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use homevault_core::config::SyncConfig;
use homevault_core::domain::ClientId;
use homevault_core::ports::{IIdentityStore, IProviderAdapter, IProviderFactory};

use crate::engine::{ReconciliationEngine, SyncResult};
use crate::SyncError;

// ============================================================================
// Public reports
// ============================================================================

/// Why a tick did no work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The previous tick of this client is still running
    InProgress,
    ShuttingDown,
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Every active folder was reconciled
    Completed { folders: usize, result: SyncResult },
    /// Nothing ran
    Skipped(SkipReason),
    /// A non-fatal failure; the next tick tries again
    Retrying(String),
    /// The client can no longer auto-sync; its timer was stopped
    Stopped(String),
    /// A fatal error disconnected the client; its timer was stopped
    Disconnected(String),
}

/// A scheduled client whose record no longer supports auto-sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthIssue {
    pub client: ClientId,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub total_scheduled: usize,
    pub healthy_count: usize,
    pub issues: Vec<HealthIssue>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.issues.is_empty()
    }
}

// ============================================================================
// Internal state
// ============================================================================

struct ScheduledClient {
    cancel: CancellationToken,
    /// Distinguishes a replaced timer from its successor
    generation: u64,
    interval: Duration,
}

#[derive(Default)]
struct ClientRunState {
    in_progress: AtomicBool,
    /// Milliseconds since the epoch, 0 when never synced
    last_sync_ms: AtomicI64,
}

/// Resets the in-progress flag whatever way the tick ends
struct InProgressGuard(Arc<ClientRunState>);

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        self.0.in_progress.store(false, Ordering::Release);
    }
}

fn error_message(err: &SyncError) -> String {
    match err {
        SyncError::Other(inner) => format!("{inner:#}"),
        other => other.to_string(),
    }
}

struct SchedulerInner {
    store: Arc<dyn IIdentityStore>,
    engine: Arc<ReconciliationEngine>,
    factory: Option<Arc<dyn IProviderFactory>>,
    default_interval: Duration,
    entries: DashMap<ClientId, ScheduledClient>,
    run_states: DashMap<ClientId, Arc<ClientRunState>>,
    shutting_down: AtomicBool,
    tracker: TaskTracker,
    generation: AtomicU64,
}

// ============================================================================
// AutoSyncScheduler
// ============================================================================

/// Recurring single-flight reconciliation per client
///
/// Cloning yields another handle to the same scheduler.
#[derive(Clone)]
pub struct AutoSyncScheduler {
    inner: Arc<SchedulerInner>,
}

impl AutoSyncScheduler {
    /// `factory` connects clients that have no registered provider at start
    pub fn new(
        store: Arc<dyn IIdentityStore>,
        engine: Arc<ReconciliationEngine>,
        factory: Option<Arc<dyn IProviderFactory>>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                engine,
                factory,
                default_interval: config.default_interval(),
                entries: DashMap::new(),
                run_states: DashMap::new(),
                shutting_down: AtomicBool::new(false),
                tracker: TaskTracker::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts (or restarts) the timer of a client
    ///
    /// # Errors
    /// - [`SyncError::ShuttingDown`] after [`shutdown`](Self::shutdown)
    /// - [`SyncError::Validation`] if the client is inactive, disconnected
    ///   or has auto-sync disabled
    /// - [`SyncError::NoActiveConnection`] if no provider can be obtained
    /// - a fatal credential error, after marking the client disconnected
    #[instrument(skip(self), fields(client_id = %client_id))]
    pub async fn start(&self, client_id: &ClientId) -> Result<(), SyncError> {
        let inner = &self.inner;
        if inner.shutting_down.load(Ordering::Acquire) {
            return Err(SyncError::ShuttingDown);
        }

        let client = inner
            .store
            .get_client(client_id)
            .await
            .context("Failed to load client")?
            .ok_or(SyncError::ClientNotFound(*client_id))?;
        if let Some(reason) = client.auto_sync_blocker() {
            return Err(SyncError::Validation(format!(
                "cannot schedule client {client_id}: {reason}"
            )));
        }

        let provider = match inner.engine.registry().get(client_id) {
            Some(provider) => provider,
            None => {
                let factory = inner
                    .factory
                    .as_ref()
                    .ok_or(SyncError::NoActiveConnection(*client_id))?;
                let provider: Arc<dyn IProviderAdapter> = factory
                    .connect(&client)
                    .await
                    .context("Failed to connect provider")?;
                inner.engine.registry().register(*client_id, Arc::clone(&provider));
                provider
            }
        };

        if let Err(err) = inner
            .engine
            .credentials()
            .ensure_fresh(client_id, provider.as_ref())
            .await
        {
            if err.is_fatal() {
                inner.disconnect(client_id, &err).await;
            }
            return Err(err);
        }

        let interval = client.sync_interval(inner.default_interval);
        let generation = inner.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let previous = inner.entries.insert(
            *client_id,
            ScheduledClient {
                cancel: cancel.clone(),
                generation,
                interval,
            },
        );
        if let Some(previous) = previous {
            debug!(old_interval_secs = previous.interval.as_secs(), "Replacing existing timer");
            previous.cancel.cancel();
        }

        let task_inner = Arc::clone(inner);
        let id = *client_id;
        inner
            .tracker
            .spawn(async move { task_inner.run_timer(id, interval, cancel, generation).await });

        info!(interval_secs = interval.as_secs(), "Auto-sync scheduled");
        Ok(())
    }

    /// Runs one tick right away, subject to the single-flight rule
    pub async fn sync_now(&self, client_id: &ClientId) -> TickOutcome {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return TickOutcome::Skipped(SkipReason::ShuttingDown);
        }
        let inner = Arc::clone(&self.inner);
        let id = *client_id;
        self.inner
            .tracker
            .track_future(async move { inner.tick(&id).await })
            .await
    }

    /// Cancels the timer of a client; returns whether one was scheduled
    ///
    /// A tick already running finishes.
    pub fn stop(&self, client_id: &ClientId) -> bool {
        let stopped = self.inner.stop_timer(client_id);
        if stopped {
            info!(client_id = %client_id, "Auto-sync stopped");
        }
        stopped
    }

    /// Cancels every timer and waits for running ticks to finish
    ///
    /// Safe to call more than once and while ticks are in flight.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutting_down.store(true, Ordering::Release);

        let tokens: Vec<CancellationToken> =
            inner.entries.iter().map(|e| e.cancel.clone()).collect();
        inner.entries.clear();
        let cancelled = tokens.len();
        for token in tokens {
            token.cancel();
        }

        info!(cancelled, running = inner.tracker.len(), "Shutting down auto-sync");
        inner.tracker.close();
        inner.tracker.wait().await;
        info!("Auto-sync shut down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::Acquire)
    }

    /// Checks that every scheduled client can still auto-sync
    pub async fn health_check(&self) -> HealthReport {
        let inner = &self.inner;
        let scheduled = self.scheduled_clients();
        let mut report = HealthReport {
            total_scheduled: scheduled.len(),
            ..Default::default()
        };

        for client_id in scheduled {
            let reason = match inner.store.get_client(&client_id).await {
                Ok(Some(client)) => client
                    .auto_sync_blocker()
                    .map(str::to_string)
                    .or_else(|| {
                        (!inner.engine.registry().contains(&client_id))
                            .then(|| "no provider registered".to_string())
                    }),
                Ok(None) => Some("client record no longer exists".to_string()),
                Err(e) => Some(format!("failed to load client record: {e:#}")),
            };
            match reason {
                Some(reason) => report.issues.push(HealthIssue {
                    client: client_id,
                    reason,
                }),
                None => report.healthy_count += 1,
            }
        }

        if !report.is_healthy() {
            warn!(issues = report.issues.len(), "Auto-sync health check found issues");
        }
        report
    }

    pub fn is_scheduled(&self, client_id: &ClientId) -> bool {
        self.inner.entries.contains_key(client_id)
    }

    pub fn scheduled_clients(&self) -> Vec<ClientId> {
        self.inner.entries.iter().map(|e| *e.key()).collect()
    }

    /// Whether a tick of the client is running right now
    pub fn is_running(&self, client_id: &ClientId) -> bool {
        self.inner
            .run_states
            .get(client_id)
            .is_some_and(|s| s.in_progress.load(Ordering::Acquire))
    }

    /// Completion time of the last fully successful tick
    pub fn last_sync(&self, client_id: &ClientId) -> Option<DateTime<Utc>> {
        let ms = self
            .inner
            .run_states
            .get(client_id)
            .map(|s| s.last_sync_ms.load(Ordering::Acquire))?;
        if ms == 0 {
            None
        } else {
            DateTime::from_timestamp_millis(ms)
        }
    }
}

impl SchedulerInner {
    fn run_state(&self, client_id: &ClientId) -> Arc<ClientRunState> {
        self.run_states
            .entry(*client_id)
            .or_default()
            .clone()
    }

    fn stop_timer(&self, client_id: &ClientId) -> bool {
        match self.entries.remove(client_id) {
            Some((_, entry)) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_timer(
        self: Arc<Self>,
        client_id: ClientId,
        interval: Duration,
        cancel: CancellationToken,
        generation: u64,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(client_id = %client_id, "Timer cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    match self.tick(&client_id).await {
                        TickOutcome::Stopped(_) | TickOutcome::Disconnected(_) => break,
                        _ => {}
                    }
                }
            }
        }

        self.entries
            .remove_if(&client_id, |_, entry| entry.generation == generation);
    }

    #[instrument(skip(self), fields(client_id = %client_id))]
    async fn tick(&self, client_id: &ClientId) -> TickOutcome {
        if self.shutting_down.load(Ordering::Acquire) {
            return TickOutcome::Skipped(SkipReason::ShuttingDown);
        }

        let state = self.run_state(client_id);
        if state
            .in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Previous tick still running, skipping");
            return TickOutcome::Skipped(SkipReason::InProgress);
        }
        let _guard = InProgressGuard(Arc::clone(&state));

        let client = match self.store.get_client(client_id).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                self.stop_timer(client_id);
                return TickOutcome::Stopped("client record no longer exists".to_string());
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to load client, retrying next tick");
                return TickOutcome::Retrying(format!("{e:#}"));
            }
        };
        if let Some(reason) = client.auto_sync_blocker() {
            info!(reason, "Client can no longer auto-sync, stopping timer");
            self.stop_timer(client_id);
            return TickOutcome::Stopped(reason.to_string());
        }

        let sync_folders = match self
            .store
            .list_sync_folders_for_client(client.owner(), client_id)
            .await
        {
            Ok(folders) => folders,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to list sync folders");
                return TickOutcome::Retrying(format!("{e:#}"));
            }
        };

        let mut total = SyncResult::default();
        let mut folders = 0;
        let mut failures = Vec::new();
        for sync_folder in sync_folders.iter().filter(|f| {
            f.is_active() && f.client_config(client_id).is_some_and(|c| c.is_active)
        }) {
            match self
                .engine
                .reconcile(client.owner(), client_id, sync_folder.folder())
                .await
            {
                Ok(result) => {
                    folders += 1;
                    total.merge(result);
                }
                Err(err) if err.is_fatal() => {
                    let message = error_message(&err);
                    error!(folder_id = %sync_folder.folder(), error = %message, "Fatal sync error, disconnecting client");
                    self.disconnect(client_id, &err).await;
                    return TickOutcome::Disconnected(message);
                }
                Err(err) => {
                    let message = error_message(&err);
                    warn!(folder_id = %sync_folder.folder(), error = %message, "Folder sync failed, retrying next tick");
                    failures.push(message);
                }
            }
        }

        if !failures.is_empty() {
            return TickOutcome::Retrying(failures.join("; "));
        }

        let now = Utc::now();
        state
            .last_sync_ms
            .store(now.timestamp_millis(), Ordering::Release);
        if let Err(e) = self.record_sync(client_id, now).await {
            warn!(error = %format!("{e:#}"), "Failed to record last sync");
        }

        info!(
            folders,
            uploaded = total.uploaded,
            downloaded = total.downloaded,
            errors = total.errors.len(),
            "Auto-sync tick complete"
        );
        TickOutcome::Completed {
            folders,
            result: total,
        }
    }

    async fn record_sync(&self, client_id: &ClientId, at: DateTime<Utc>) -> anyhow::Result<()> {
        // Reload so a concurrent disconnect is not overwritten
        let Some(mut client) = self.store.get_client(client_id).await? else {
            return Ok(());
        };
        client.record_sync(at);
        self.store.save_client(&client).await
    }

    /// Stops the timer, drops the provider and records the error on the client
    async fn disconnect(&self, client_id: &ClientId, err: &SyncError) {
        self.stop_timer(client_id);
        self.engine.registry().remove(client_id);
        self.engine.credentials().forget(client_id);

        let update = async {
            if let Some(mut client) = self.store.get_client(client_id).await? {
                client.mark_disconnected(error_message(err));
                self.store.save_client(&client).await?;
            }
            anyhow::Ok(())
        };
        if let Err(e) = update.await {
            error!(client_id = %client_id, error = %format!("{e:#}"), "Failed to mark client disconnected");
        }
    }
}
