//! Domain entities and business logic
//!
//! This module contains the core domain types for HomeVault:
//! - Newtypes for type-safe identifiers and validated values
//! - Files with their per-client mappings, and folders
//! - Clients and their connection state
//! - Sync folder bindings and per-file sync ledger entries
//! - Domain-specific error types

pub mod client;
pub mod errors;
pub mod file;
pub mod folder;
pub mod newtypes;
pub mod sync_folder;
pub mod sync_state;

// Re-export commonly used types
pub use client::{Client, ClientType, ConnectionStatus, Tokens};
pub use errors::DomainError;
pub use file::{guess_mime_type, ClientMapping, File, FileCategory};
pub use folder::Folder;
pub use newtypes::*;
pub use sync_folder::{SyncDirection, SyncFilters, SyncFolder, SyncFolderClient};
pub use sync_state::{ChangeKind, FileSyncState, RemoteRef, SyncOperation, SyncStateKey};
