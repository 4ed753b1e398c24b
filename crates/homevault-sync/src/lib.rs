//! HomeVault Sync - Multi-client reconciliation
//!
//! Provides:
//! - A per-(owner, client, folder) reconciliation pass that pushes local
//!   changes, detects remote deletions, pulls new remote files and compares
//!   freshness of the rest
//! - A registry of connected provider handles
//! - Per-client serialized credential refresh
//! - A recurring, single-flight auto-sync scheduler
//! - A provider for mounted directories (external drives)
//!
//! ## Modules
//!
//! - [`engine`] - Reconciliation engine, retry logic and pass results
//! - [`scheduler`] - Auto-sync timers per client
//! - [`credentials`] - Check-then-refresh guard for provider tokens
//! - [`registry`] - Connected provider handles by client
//! - [`directory`] - `IProviderAdapter` over a local directory tree

pub mod credentials;
pub mod directory;
pub mod engine;
pub mod registry;
pub mod scheduler;

pub use credentials::CredentialGuard;
pub use directory::DirectoryProvider;
pub use engine::{FailureReason, ReconciliationEngine, RetryPolicy, SyncFailure, SyncResult};
pub use registry::ProviderRegistry;
pub use scheduler::{AutoSyncScheduler, HealthIssue, HealthReport, SkipReason, TickOutcome};

use homevault_core::domain::ClientId;
use homevault_core::ports::ProviderError;
use thiserror::Error;

/// How a failure should be treated by retries and the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Needs re-authorization; the client is disconnected
    Fatal,
    /// May succeed later; retried with backoff and on the next tick
    Transient,
    /// Will not succeed by retrying
    Permanent,
}

/// Classifies an error from a provider or store call
///
/// Typed errors decide first: a [`ProviderError`] or [`SyncError`] anywhere in
/// the chain, then an `io::Error` by its kind. Untyped errors are matched on
/// the root cause only, since context layers carry file names.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    if let Some(provider) = ProviderError::find(err) {
        return if provider.is_fatal() {
            ErrorClass::Fatal
        } else if provider.is_transient() {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        };
    }
    if let Some(sync) = err.chain().find_map(|e| e.downcast_ref::<SyncError>()) {
        return match sync {
            SyncError::Other(inner) => classify_error(inner),
            other => other.class(),
        };
    }
    if let Some(io) = err.chain().find_map(|e| e.downcast_ref::<std::io::Error>()) {
        return classify_io(io.kind());
    }

    let root = err.root_cause().to_string().to_lowercase();
    if FATAL_PHRASES.iter().any(|p| root.contains(p)) {
        ErrorClass::Fatal
    } else if TRANSIENT_PHRASES.iter().any(|p| root.contains(p)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

const FATAL_PHRASES: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid_grant",
    "no active connection",
];

const TRANSIENT_PHRASES: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection aborted",
    "broken pipe",
    "too many requests",
    "rate limit",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "internal server error",
    "temporarily unavailable",
    "dns error",
];

fn classify_io(kind: std::io::ErrorKind) -> ErrorClass {
    use std::io::ErrorKind;
    match kind {
        ErrorKind::TimedOut
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::Interrupted => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Errors that abort a reconciliation pass or a scheduler operation
#[derive(Debug, Error)]
pub enum SyncError {
    /// No provider handle is registered for the client
    #[error("no active connection for client {0}")]
    NoActiveConnection(ClientId),

    /// The client record does not exist
    #[error("client {0} not found")]
    ClientNotFound(ClientId),

    /// A precondition of the pass does not hold; nothing was changed
    #[error("validation failed: {0}")]
    Validation(String),

    /// The configured remote folder is gone on the provider
    #[error("remote folder {0} no longer exists")]
    RemoteFolderMissing(String),

    /// The scheduler is shutting down
    #[error("scheduler is shutting down")]
    ShuttingDown,

    /// Store or provider failure
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether the client must be disconnected and re-authorized
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::NoActiveConnection(_) => true,
            Self::Other(err) => classify_error(err) == ErrorClass::Fatal,
            _ => false,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Other(err) => classify_error(err),
            other if other.is_fatal() => ErrorClass::Fatal,
            _ => ErrorClass::Permanent,
        }
    }
}

impl From<homevault_core::domain::DomainError> for SyncError {
    fn from(e: homevault_core::domain::DomainError) -> Self {
        Self::Other(e.into())
    }
}
