//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the domain core
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IIdentityStore`] - Persistent storage for files, folders, clients and sync state
//! - [`IProviderAdapter`] - One connected external storage client
//! - [`IProviderFactory`] - Builds provider handles from client records
//! - [`IBlobStore`] - Local byte storage for file content

pub mod blob_store;
pub mod identity_store;
pub mod provider;

pub use blob_store::{BlobStat, IBlobStore};
pub use identity_store::IIdentityStore;
pub use provider::{
    IProviderAdapter, IProviderFactory, ProviderError, RemoteFileDescriptor, RemoteFolder,
};
