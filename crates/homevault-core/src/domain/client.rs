//! Client domain entity
//!
//! A `Client` is a registered endpoint able to hold copies of the owner's
//! files: a desktop or mobile app, a web session, a third-party drive
//! integration, or an external drive. Besides its identity it carries the
//! connection state that the auto-sync scheduler reads and updates.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::DomainError;
use super::newtypes::{ClientId, OwnerId};

/// Kind of endpoint a client represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientType {
    Desktop,
    Mobile,
    Web,
    ServerIntegration,
    ExternalDrive,
}

impl ClientType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Web => "web",
            Self::ServerIntegration => "server-integration",
            Self::ExternalDrive => "external-drive",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ClientType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "desktop" => Ok(Self::Desktop),
            "mobile" => Ok(Self::Mobile),
            "web" => Ok(Self::Web),
            "server-integration" => Ok(Self::ServerIntegration),
            "external-drive" => Ok(Self::ExternalDrive),
            _ => Err(DomainError::UnknownVariant {
                kind: "client type",
                value: s.to_string(),
            }),
        }
    }
}

/// Whether the client currently has a usable provider connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    #[default]
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connected" => Ok(Self::Connected),
            "disconnected" => Ok(Self::Disconnected),
            _ => Err(DomainError::UnknownVariant {
                kind: "connection status",
                value: s.to_string(),
            }),
        }
    }
}

/// Provider credentials held for a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    /// Bearer token for authenticating provider requests
    pub access_token: String,
    /// Token for obtaining a new access token without user interaction
    pub refresh_token: Option<String>,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Returns true if the access token has expired
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Returns true if the access token will expire within the given duration
    pub fn expires_within(&self, duration: chrono::Duration) -> bool {
        Utc::now() + duration >= self.expires_at
    }
}

/// A registered endpoint of one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    id: ClientId,
    owner: OwnerId,
    client_type: ClientType,
    display_name: String,
    is_active: bool,
    last_seen: Option<DateTime<Utc>>,
    connection_status: ConnectionStatus,
    last_error: Option<String>,
    auto_sync_enabled: bool,
    /// Seconds between auto-sync ticks; `None` uses the configured default
    sync_interval_secs: Option<u64>,
    last_sync: Option<DateTime<Utc>>,
    tokens: Option<Tokens>,
    /// Provider-specific location, e.g. the mount path of an external drive
    endpoint: Option<String>,
    created_at: DateTime<Utc>,
}

impl Client {
    /// Register a new, active but not yet connected client
    pub fn new(owner: OwnerId, client_type: ClientType, display_name: impl Into<String>) -> Self {
        Self {
            id: ClientId::new(),
            owner,
            client_type,
            display_name: display_name.into(),
            is_active: true,
            last_seen: None,
            connection_status: ConnectionStatus::Disconnected,
            last_error: None,
            auto_sync_enabled: false,
            sync_interval_secs: None,
            last_sync: None,
            tokens: None,
            endpoint: None,
            created_at: Utc::now(),
        }
    }

    /// Builder-style endpoint setter
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    // --- Getters ---

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn client_type(&self) -> ClientType {
        self.client_type
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection_status
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn auto_sync_enabled(&self) -> bool {
        self.auto_sync_enabled
    }

    pub fn sync_interval_secs(&self) -> Option<u64> {
        self.sync_interval_secs
    }

    /// Effective tick interval, falling back to `default`
    pub fn sync_interval(&self, default: Duration) -> Duration {
        self.sync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        self.last_sync
    }

    pub fn tokens(&self) -> Option<&Tokens> {
        self.tokens.as_ref()
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Why this client cannot run auto-sync right now, if anything
    pub fn auto_sync_blocker(&self) -> Option<&'static str> {
        if !self.is_active {
            Some("client is inactive")
        } else if !self.is_connected() {
            Some("client is disconnected")
        } else if !self.auto_sync_enabled {
            Some("auto-sync is disabled")
        } else {
            None
        }
    }

    // --- State transitions ---

    /// Mark the client connected, clearing any previous error
    pub fn mark_connected(&mut self) {
        self.connection_status = ConnectionStatus::Connected;
        self.last_error = None;
    }

    /// Mark the client disconnected with the reason recorded
    ///
    /// Auto-sync is switched off; re-authorization happens out of band.
    pub fn mark_disconnected(&mut self, reason: impl Into<String>) {
        self.connection_status = ConnectionStatus::Disconnected;
        self.last_error = Some(reason.into());
        self.auto_sync_enabled = false;
    }

    pub fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }

    pub fn enable_auto_sync(&mut self, interval_secs: Option<u64>) {
        self.auto_sync_enabled = true;
        self.sync_interval_secs = interval_secs;
    }

    pub fn disable_auto_sync(&mut self) {
        self.auto_sync_enabled = false;
    }

    pub fn set_tokens(&mut self, tokens: Tokens) {
        self.tokens = Some(tokens);
    }

    pub fn record_sync(&mut self, at: DateTime<Utc>) {
        self.last_sync = Some(at);
        self.last_seen = Some(at);
    }

    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_seen = Some(at);
    }

    pub fn set_last_error(&mut self, error: Option<String>) {
        self.last_error = error;
    }
}
