//! Use cases (interactors) for HomeVault
//!
//! This module contains the application use cases that orchestrate
//! domain entities and port interfaces. Use cases are thin coordinators
//! that delegate business rules to domain methods and I/O to ports.
//!
//! ## Use Cases
//!
//! - [`ChangeTracker`] - Pending-operation ledger per (owner, client, file)
//! - [`FileLifecycle`] - Local file mutations feeding the change tracker
//! - [`FileLocks`] - Per-file locks shared by local mutations and sync

pub mod change_tracker;
pub mod file_lifecycle;
pub mod file_locks;

pub use change_tracker::{ChangeTracker, ConfirmOutcome, Confirmation};
pub use file_lifecycle::FileLifecycle;
pub use file_locks::{FileLockGuard, FileLocks};
