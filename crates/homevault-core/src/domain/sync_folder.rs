//! SyncFolder domain entity
//!
//! Binds one local Folder to the per-client configurations that make it
//! eligible for synchronization. A SyncFolder is unique per (owner, folder)
//! and holds at most one configuration per client.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ClientId, FolderId, OwnerId, RemoteId};

/// Which way content flows between the local folder and a client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    #[default]
    Bidirectional,
    /// Local changes are pushed, remote changes are never pulled
    ToClient,
    /// Remote changes are pulled, local changes are never pushed
    FromClient,
}

impl SyncDirection {
    /// Whether local changes are uploaded to the client
    pub fn pushes(&self) -> bool {
        !matches!(self, Self::FromClient)
    }

    /// Whether remote changes are downloaded from the client
    pub fn pulls(&self) -> bool {
        !matches!(self, Self::ToClient)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bidirectional => "bidirectional",
            Self::ToClient => "to-client",
            Self::FromClient => "from-client",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SyncDirection {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bidirectional" => Ok(Self::Bidirectional),
            "to-client" => Ok(Self::ToClient),
            "from-client" => Ok(Self::FromClient),
            _ => Err(DomainError::UnknownVariant {
                kind: "sync direction",
                value: s.to_string(),
            }),
        }
    }
}

/// Pull-side filters of a sync configuration
///
/// Extensions are compared case-insensitively, with or without the leading
/// dot (`".tmp"` and `"tmp"` are equivalent).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFilters {
    /// When non-empty, only these extensions are pulled
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    #[serde(default)]
    pub excluded_extensions: Vec<String>,
    /// Files larger than this many bytes are skipped
    #[serde(default)]
    pub max_file_size: Option<u64>,
}

fn normalize_ext(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Extension of `name` without the dot; dotfiles like `.bashrc` have none
fn extension_of(name: &str) -> String {
    match name.rfind('.') {
        Some(0) | None => String::new(),
        Some(idx) => name[idx + 1..].to_ascii_lowercase(),
    }
}

impl SyncFilters {
    /// Whether a remote file with this name and size should be pulled
    pub fn allows(&self, name: &str, size: u64) -> bool {
        if let Some(max) = self.max_file_size {
            if size > max {
                return false;
            }
        }

        let ext = extension_of(name);
        if self
            .excluded_extensions
            .iter()
            .any(|e| normalize_ext(e) == ext)
        {
            return false;
        }
        if !self.allowed_extensions.is_empty()
            && !self
                .allowed_extensions
                .iter()
                .any(|e| normalize_ext(e) == ext)
        {
            return false;
        }
        true
    }
}

/// One client's configuration within a SyncFolder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFolderClient {
    pub client: ClientId,
    /// `None` until the remote folder has been created
    pub remote_folder_id: Option<RemoteId>,
    pub remote_folder_name: String,
    pub remote_folder_path: String,
    pub direction: SyncDirection,
    pub filters: SyncFilters,
    pub is_active: bool,
    pub last_sync_date: Option<DateTime<Utc>>,
}

impl SyncFolderClient {
    /// Bidirectional, unfiltered configuration for `client`
    pub fn new(client: ClientId, remote_folder_name: impl Into<String>) -> Self {
        let remote_folder_name = remote_folder_name.into();
        Self {
            client,
            remote_folder_id: None,
            remote_folder_path: format!("/{remote_folder_name}"),
            remote_folder_name,
            direction: SyncDirection::Bidirectional,
            filters: SyncFilters::default(),
            is_active: true,
            last_sync_date: None,
        }
    }

    #[must_use]
    pub fn with_remote_folder(mut self, id: RemoteId, path: impl Into<String>) -> Self {
        self.remote_folder_id = Some(id);
        self.remote_folder_path = path.into();
        self
    }

    #[must_use]
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn with_filters(mut self, filters: SyncFilters) -> Self {
        self.filters = filters;
        self
    }
}

/// Binding of a local folder to its client configurations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFolder {
    owner: OwnerId,
    folder: FolderId,
    clients: Vec<SyncFolderClient>,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl SyncFolder {
    pub fn new(owner: OwnerId, folder: FolderId) -> Self {
        Self {
            owner,
            folder,
            clients: Vec::new(),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn folder(&self) -> &FolderId {
        &self.folder
    }

    pub fn clients(&self) -> &[SyncFolderClient] {
        &self.clients
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }

    pub fn client_config(&self, client: &ClientId) -> Option<&SyncFolderClient> {
        self.clients.iter().find(|c| &c.client == client)
    }

    pub fn client_config_mut(&mut self, client: &ClientId) -> Option<&mut SyncFolderClient> {
        self.clients.iter_mut().find(|c| &c.client == client)
    }

    /// Active configurations, or none at all when the binding is disabled
    pub fn active_clients(&self) -> impl Iterator<Item = &SyncFolderClient> {
        let enabled = self.is_active;
        self.clients.iter().filter(move |c| enabled && c.is_active)
    }

    /// Add a configuration, replacing any existing one for the same client
    pub fn upsert_client(&mut self, config: SyncFolderClient) {
        match self.client_config_mut(&config.client) {
            Some(existing) => *existing = config,
            None => self.clients.push(config),
        }
    }

    /// Remove the configuration of `client`, returning whether one existed
    pub fn remove_client(&mut self, client: &ClientId) -> bool {
        let before = self.clients.len();
        self.clients.retain(|c| &c.client != client);
        self.clients.len() != before
    }
}
