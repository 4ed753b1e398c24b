//! File domain entity
//!
//! A `File` is one stored object: its content lives in blob storage under
//! `storage_path`, while this record carries metadata, the soft-delete
//! flag and one [`ClientMapping`] per client the file has been synced to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::DomainError;
use super::newtypes::{validate_name, ClientId, ContentHash, FileId, FolderId, OwnerId, RemoteId};

// ============================================================================
// FileCategory
// ============================================================================

/// Coarse content category derived from the MIME type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Image,
    Document,
    Audio,
    Video,
    Other,
}

/// MIME prefixes and exact types classified as documents
const DOCUMENT_MIME_PREFIXES: &[&str] = &[
    "text/",
    "application/pdf",
    "application/msword",
    "application/rtf",
    "application/vnd.ms-",
    "application/vnd.openxmlformats-officedocument.",
    "application/vnd.oasis.opendocument.",
    "application/epub+zip",
];

impl FileCategory {
    /// Derive the category from a MIME type such as `image/png`
    pub fn from_mime(mime_type: &str) -> Self {
        let mime = mime_type.trim().to_ascii_lowercase();
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else if mime.starts_with("video/") {
            Self::Video
        } else if DOCUMENT_MIME_PREFIXES.iter().any(|p| mime.starts_with(p)) {
            Self::Document
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Document => "document",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FileCategory {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "document" => Ok(Self::Document),
            "audio" => Ok(Self::Audio),
            "video" => Ok(Self::Video),
            "other" => Ok(Self::Other),
            _ => Err(DomainError::UnknownVariant {
                kind: "file category",
                value: s.to_string(),
            }),
        }
    }
}

/// Best-effort MIME type for a file name, used when a provider reports none
pub fn guess_mime_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "svg" => "image/svg+xml",
        "mp3" => "audio/mpeg",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "odt" => "application/vnd.oasis.opendocument.text",
        "json" => "application/json",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

// ============================================================================
// ClientMapping
// ============================================================================

/// Correspondence between a local File and its remote identity on one client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMapping {
    pub client: ClientId,
    pub remote_id: RemoteId,
    pub remote_name: String,
    pub remote_path: String,
    pub last_sync_date: DateTime<Utc>,
}

// ============================================================================
// File
// ============================================================================

/// A stored file and its per-client sync mappings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    id: FileId,
    owner: OwnerId,
    storage_path: String,
    name: String,
    mime_type: String,
    category: FileCategory,
    size: u64,
    hash: ContentHash,
    last_modified: DateTime<Utc>,
    folder: Option<FolderId>,
    is_deleted: bool,
    deleted_at: Option<DateTime<Utc>>,
    mappings: Vec<ClientMapping>,
    created_at: DateTime<Utc>,
}

impl File {
    /// Create a new, purely local file record
    ///
    /// The storage path is derived from owner and id so blobs never collide.
    ///
    /// # Errors
    /// Returns `DomainError::InvalidName` if `name` is not a valid file name
    pub fn new(
        owner: OwnerId,
        folder: Option<FolderId>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        hash: ContentHash,
    ) -> Result<Self, DomainError> {
        let name = name.into();
        validate_name(&name)?;
        let mime_type = mime_type.into();
        let id = FileId::new();
        let now = Utc::now();
        Ok(Self {
            id,
            owner,
            storage_path: format!("{owner}/{id}"),
            category: FileCategory::from_mime(&mime_type),
            name,
            mime_type,
            size,
            hash,
            last_modified: now,
            folder,
            is_deleted: false,
            deleted_at: None,
            mappings: Vec::new(),
            created_at: now,
        })
    }

    // --- getters ---

    pub fn id(&self) -> &FileId {
        &self.id
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    /// Blob storage key holding the content
    pub fn storage_path(&self) -> &str {
        &self.storage_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn category(&self) -> FileCategory {
        self.category
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn folder(&self) -> Option<&FolderId> {
        self.folder.as_ref()
    }

    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn mappings(&self) -> &[ClientMapping] {
        &self.mappings
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// True when the file has never been synced to any client
    pub fn is_local_only(&self) -> bool {
        self.mappings.is_empty() && !self.is_deleted
    }

    pub fn mapping_for(&self, client: &ClientId) -> Option<&ClientMapping> {
        self.mappings.iter().find(|m| &m.client == client)
    }

    // --- mutations ---

    /// Rename the file, refreshing its modification time
    ///
    /// # Errors
    /// Returns `DomainError::InvalidName` if `name` is not a valid file name
    pub fn rename(&mut self, name: impl Into<String>, at: DateTime<Utc>) -> Result<(), DomainError> {
        let name = name.into();
        validate_name(&name)?;
        self.name = name;
        self.last_modified = at;
        Ok(())
    }

    /// Replace content metadata after new bytes were written to blob storage
    pub fn replace_content(&mut self, size: u64, hash: ContentHash, at: DateTime<Utc>) {
        self.size = size;
        self.hash = hash;
        self.last_modified = at;
    }

    /// Update the MIME type, re-deriving the category
    pub fn set_mime_type(&mut self, mime_type: impl Into<String>) {
        self.mime_type = mime_type.into();
        self.category = FileCategory::from_mime(&self.mime_type);
    }

    pub fn set_last_modified(&mut self, at: DateTime<Utc>) {
        self.last_modified = at;
    }

    /// Move the file to the trash
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if the file is already deleted
    pub fn soft_delete(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if self.is_deleted {
            return Err(DomainError::InvalidState {
                from: "deleted".to_string(),
                to: "deleted".to_string(),
            });
        }
        self.is_deleted = true;
        self.deleted_at = Some(at);
        Ok(())
    }

    /// Bring the file back from the trash
    ///
    /// # Errors
    /// Returns `DomainError::InvalidState` if the file is not deleted
    pub fn restore(&mut self, at: DateTime<Utc>) -> Result<(), DomainError> {
        if !self.is_deleted {
            return Err(DomainError::InvalidState {
                from: "active".to_string(),
                to: "active".to_string(),
            });
        }
        self.is_deleted = false;
        self.deleted_at = None;
        self.last_modified = at;
        Ok(())
    }

    /// Insert or replace the mapping for `mapping.client`
    ///
    /// A file has at most one remote identity per client, and no two
    /// clients' entries are touched by this call.
    pub fn upsert_mapping(&mut self, mapping: ClientMapping) {
        match self.mappings.iter_mut().find(|m| m.client == mapping.client) {
            Some(existing) => *existing = mapping,
            None => self.mappings.push(mapping),
        }
    }

    /// Remove the mapping for `client`, returning whether one existed
    pub fn clear_mapping(&mut self, client: &ClientId) -> bool {
        let before = self.mappings.len();
        self.mappings.retain(|m| &m.client != client);
        self.mappings.len() != before
    }
}
