//! Error types for duplicate resolution

use homevault_core::domain::File;
use thiserror::Error;

/// Errors returned by [`crate::DuplicateResolver::resolve_create`]
#[derive(Debug, Error)]
pub enum ResolveError {
    /// An active file with the same name already exists in the folder
    #[error("DUPLICATE_FILE: '{}' already exists, suggested name '{suggested_name}'", existing_file.name())]
    Duplicate {
        existing_file: Box<File>,
        suggested_name: String,
    },

    /// The caller chose to cancel the creation
    #[error("file creation cancelled")]
    Cancelled,

    /// Invalid name or folder reference; nothing was written
    #[error("validation failed: {0}")]
    Validation(String),

    /// Store or blob failure
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl ResolveError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Duplicate { .. } => "DUPLICATE_FILE",
            Self::Cancelled => "CANCELLED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}
