//! Provider adapter port (driven/secondary port)
//!
//! The capability interface every external storage provider implements.
//! The reconciliation engine only ever holds `Arc<dyn IProviderAdapter>`;
//! it never knows which provider is behind it.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are
//!   adapter-specific. Adapters should wrap failures in [`ProviderError`] so
//!   callers can classify them by downcasting.
//! - Uses `#[async_trait]` for async trait methods.
//! - `RemoteFileDescriptor` is a port-level DTO, not a domain entity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Client, ContentHash, RemoteId, Tokens};

// ============================================================================
// DTOs
// ============================================================================

/// One entry of a remote folder listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileDescriptor {
    pub id: RemoteId,
    pub name: String,
    pub path: String,
    pub size: u64,
    pub modified_time: DateTime<Utc>,
    /// Content hash when the provider can report one cheaply
    pub hash: Option<ContentHash>,
    pub mime_type: Option<String>,
    pub is_folder: bool,
}

/// A remote folder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    pub id: RemoteId,
    pub name: String,
    pub path: String,
}

// ============================================================================
// ProviderError
// ============================================================================

/// Typed provider failure, carried inside `anyhow::Error`
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The remote object does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials were rejected or could not be refreshed
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Credentials are valid but lack permission
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The provider asked us to slow down
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Connection-level failure (timeout, reset, DNS)
    #[error("network error: {0}")]
    Network(String),

    /// Provider-side failure with an HTTP-like status
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    /// The request itself was invalid; retrying will not help
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Auth and permission failures that require re-authorization
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::Forbidden(_))
    }

    /// Failures that may succeed if retried later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Finds a `ProviderError` anywhere in an error chain
    pub fn find(error: &anyhow::Error) -> Option<&ProviderError> {
        error.chain().find_map(|e| e.downcast_ref::<ProviderError>())
    }
}

// ============================================================================
// IProviderAdapter trait
// ============================================================================

/// Port trait for one connected external storage client
///
/// ## Implementation Notes
///
/// - One instance exists per connected client. Implementations hold their
///   own credentials; [`is_expired`](Self::is_expired) and
///   [`refresh`](Self::refresh) expose the token lifecycle so callers can
///   serialize refreshes and persist the new tokens.
/// - `upload_file` creates a new remote object; it never overwrites an
///   existing one with the same name.
#[async_trait::async_trait]
pub trait IProviderAdapter: Send + Sync {
    /// Short provider name for logs
    fn name(&self) -> &str;

    /// Lists the files directly inside a remote folder
    async fn list_remote_files(&self, folder: &RemoteId)
        -> anyhow::Result<Vec<RemoteFileDescriptor>>;

    /// Uploads new content into `folder` under `name`
    async fn upload_file(
        &self,
        folder: &RemoteId,
        content: &[u8],
        name: &str,
    ) -> anyhow::Result<RemoteFileDescriptor>;

    /// Replaces the content of an existing remote file
    async fn update_file(
        &self,
        remote_id: &RemoteId,
        content: &[u8],
    ) -> anyhow::Result<RemoteFileDescriptor>;

    /// Downloads a file's content by its remote ID
    async fn download_file(&self, remote_id: &RemoteId) -> anyhow::Result<Vec<u8>>;

    /// Deletes a remote file; missing objects yield `ProviderError::NotFound`
    async fn delete_file(&self, remote_id: &RemoteId) -> anyhow::Result<()>;

    /// Looks up a remote folder, `None` when it does not exist
    async fn get_folder(&self, folder: &RemoteId) -> anyhow::Result<Option<RemoteFolder>>;

    /// Creates a folder under `parent` (the provider root when `None`)
    async fn create_folder(
        &self,
        parent: Option<&RemoteId>,
        name: &str,
    ) -> anyhow::Result<RemoteFolder>;

    /// Whether the held access token expires within `margin`
    fn is_expired(&self, margin: chrono::Duration) -> bool;

    /// Obtains and installs fresh tokens, returning them for persistence
    async fn refresh(&self) -> anyhow::Result<Tokens>;
}

/// Builds provider handles for clients
///
/// The scheduler uses this to obtain a handle when a client is started
/// without one already registered.
#[async_trait::async_trait]
pub trait IProviderFactory: Send + Sync {
    /// Connect to the provider backing `client`
    async fn connect(&self, client: &Client) -> anyhow::Result<Arc<dyn IProviderAdapter>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ProviderError::Unauthorized("x".into()).is_fatal());
        assert!(ProviderError::Forbidden("x".into()).is_fatal());
        assert!(!ProviderError::Network("x".into()).is_fatal());

        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::RateLimited { retry_after_secs: 5 }.is_transient());
        assert!(ProviderError::Server {
            status: 503,
            message: "busy".into()
        }
        .is_transient());
        assert!(!ProviderError::Server {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!ProviderError::NotFound("x".into()).is_transient());
    }

    #[test]
    fn test_find_through_context() {
        let err = anyhow::Error::new(ProviderError::NotFound("r1".into()))
            .context("Failed to delete remote file");
        assert_eq!(
            ProviderError::find(&err),
            Some(&ProviderError::NotFound("r1".into()))
        );

        let plain = anyhow::anyhow!("disk full");
        assert!(ProviderError::find(&plain).is_none());
    }

    #[test]
    fn test_display_prefixes() {
        assert_eq!(
            ProviderError::Unauthorized("token revoked".into()).to_string(),
            "unauthorized: token revoked"
        );
        assert_eq!(
            ProviderError::Forbidden("read-only share".into()).to_string(),
            "forbidden: read-only share"
        );
    }
}
