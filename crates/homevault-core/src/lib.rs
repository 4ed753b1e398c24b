//! HomeVault Core - Domain logic and business rules
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `File`, `Folder`, `Client`, `SyncFolder`, `FileSyncState`
//! - **Use cases** - `ChangeTracker`, `FileLifecycle`
//! - **Port definitions** - Traits for adapters: `IIdentityStore`, `IProviderAdapter`, `IBlobStore`
//! - **State machine** - Pending sync operations per file and client
//!
//! # Architecture
//!
//! This crate follows the hexagonal (ports & adapters) architecture pattern.
//! The domain module contains pure business logic with no external dependencies.
//! Ports define trait interfaces that adapter crates implement.
//! Use cases orchestrate domain entities through port interfaces.

pub mod config;
pub mod domain;
pub mod ports;
pub mod usecases;
