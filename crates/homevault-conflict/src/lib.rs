//! HomeVault Conflict - Naming and content conflicts
//!
//! Provides:
//! - Deterministic unique names within a folder (`name (n).ext`)
//! - Duplicate detection and the overwrite/rename/cancel policy at
//!   file-creation time
//! - Millisecond freshness comparison between a local file and its
//!   remote copy

pub mod detector;
pub mod duplicate;
pub mod error;
pub mod namer;

pub use detector::{Freshness, FreshnessDetector, FreshnessInput};
pub use duplicate::{CreateRequest, DuplicateAction, DuplicateResolver};
pub use error::ResolveError;
pub use namer::{split_name, unique_name};
