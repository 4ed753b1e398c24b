//! Per-client credential refresh
//!
//! Two passes for the same client may both find the token about to expire.
//! The check and the refresh run under one per-client lock so only the first
//! refreshes; the second sees the fresh token and does nothing.

use std::sync::Arc;

use anyhow::Context;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use homevault_core::domain::ClientId;
use homevault_core::ports::{IIdentityStore, IProviderAdapter};

use crate::SyncError;

/// Serializes check-expiry-then-refresh per client
pub struct CredentialGuard {
    store: Arc<dyn IIdentityStore>,
    locks: DashMap<ClientId, Arc<Mutex<()>>>,
    margin: chrono::Duration,
}

impl CredentialGuard {
    /// `margin` is how long before expiry a token is already treated as expired
    pub fn new(store: Arc<dyn IIdentityStore>, margin: std::time::Duration) -> Self {
        let margin = chrono::Duration::from_std(margin).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            store,
            locks: DashMap::new(),
            margin,
        }
    }

    fn lock_for(&self, client: &ClientId) -> Arc<Mutex<()>> {
        self.locks
            .entry(*client)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Refreshes the provider's tokens if they expire within the margin
    ///
    /// New tokens are persisted on the client record. Returns whether a
    /// refresh happened.
    ///
    /// # Errors
    /// A failed refresh is returned as-is; an auth rejection classifies as
    /// fatal.
    #[instrument(skip(self, provider), fields(client_id = %client, provider = provider.name()))]
    pub async fn ensure_fresh(
        &self,
        client: &ClientId,
        provider: &dyn IProviderAdapter,
    ) -> Result<bool, SyncError> {
        let lock = self.lock_for(client);
        let _guard = lock.lock().await;

        if !provider.is_expired(self.margin) {
            debug!("Token is valid, no refresh needed");
            return Ok(false);
        }

        info!("Token expired or expiring soon, refreshing");
        let tokens = provider.refresh().await.map_err(|e| {
            warn!(error = %e, "Token refresh failed");
            SyncError::Other(e.context("Failed to refresh provider token"))
        })?;

        let mut record = self
            .store
            .get_client(client)
            .await
            .context("Failed to load client for token update")?
            .ok_or(SyncError::ClientNotFound(*client))?;
        record.set_tokens(tokens);
        self.store
            .save_client(&record)
            .await
            .context("Failed to persist refreshed tokens")?;

        info!("Token refreshed");
        Ok(true)
    }

    /// Drops the lock entry of a client that is no longer scheduled
    pub fn forget(&self, client: &ClientId) {
        self.locks.remove(client);
    }
}
