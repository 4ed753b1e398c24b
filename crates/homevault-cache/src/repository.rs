//! SQLite implementation of IIdentityStore
//!
//! This module provides the concrete SQLite-based implementation of the
//! identity store port defined in homevault-core. It handles all domain
//! type serialization/deserialization and SQL query construction.
//!
//! ## Type Mapping
//!
//! | Domain Type                   | SQL Type | Strategy                                |
//! |-------------------------------|----------|-----------------------------------------|
//! | OwnerId, FileId, FolderId, ClientId | TEXT | UUID string via `.to_string()`        |
//! | RemoteId, ContentHash         | TEXT     | String via `.as_str()`                  |
//! | DateTime<Utc>                 | TEXT     | RFC 3339 via `to_rfc3339()`             |
//! | FileCategory, ClientType, ... | TEXT     | `as_str()` names                        |
//! | Vec<ClientMapping>            | TEXT     | serde_json array                        |
//! | Vec<SyncFolderClient>         | TEXT     | serde_json array                        |
//! | Tokens                        | TEXT     | serde_json object                       |
//!
//! Rows are turned back into entities by building the serde representation
//! and deserializing it, since entities keep their fields private.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use homevault_core::domain::{
    Client, ClientId, File, FileId, FileSyncState, Folder, FolderId, OwnerId, RemoteId,
    SyncFolder, SyncStateKey,
};
use homevault_core::ports::IIdentityStore;

use crate::CacheError;

/// SQLite-based implementation of the identity store port
///
/// All operations are performed through a connection pool for concurrency.
/// Ledger compare-and-set relies on single-statement atomicity: the version
/// check lives in the `WHERE` clause of the write itself.
pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    /// Creates a new store instance with the given connection pool
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(ts)
}

/// Rebuild an entity from its serde representation
fn from_json<T: DeserializeOwned>(kind: &str, value: serde_json::Value) -> Result<T, CacheError> {
    serde_json::from_value(value)
        .map_err(|e| CacheError::SerializationError(format!("Invalid {kind} row: {e}")))
}

/// Parse a JSON text column
fn json_column(kind: &str, text: &str) -> Result<serde_json::Value, CacheError> {
    serde_json::from_str(text)
        .map_err(|e| CacheError::SerializationError(format!("Invalid {kind} JSON: {e}")))
}

fn to_json_text<T: serde::Serialize + ?Sized>(kind: &str, value: &T) -> Result<String, CacheError> {
    serde_json::to_string(value)
        .map_err(|e| CacheError::SerializationError(format!("Failed to serialize {kind}: {e}")))
}

fn file_from_row(row: &SqliteRow) -> Result<File, CacheError> {
    let mappings_text: String = row.get("mappings");
    let size: i64 = row.get("size");
    let json = serde_json::json!({
        "id": row.get::<String, _>("id"),
        "owner": row.get::<String, _>("owner_id"),
        "storage_path": row.get::<String, _>("storage_path"),
        "name": row.get::<String, _>("name"),
        "mime_type": row.get::<String, _>("mime_type"),
        "category": row.get::<String, _>("category"),
        "size": size as u64,
        "hash": row.get::<String, _>("hash"),
        "last_modified": row.get::<String, _>("last_modified"),
        "folder": row.get::<Option<String>, _>("folder_id"),
        "is_deleted": row.get::<bool, _>("is_deleted"),
        "deleted_at": row.get::<Option<String>, _>("deleted_at"),
        "mappings": json_column("mappings", &mappings_text)?,
        "created_at": row.get::<String, _>("created_at"),
    });
    from_json("file", json)
}

fn folder_from_row(row: &SqliteRow) -> Result<Folder, CacheError> {
    let json = serde_json::json!({
        "id": row.get::<String, _>("id"),
        "owner": row.get::<String, _>("owner_id"),
        "name": row.get::<String, _>("name"),
        "parent": row.get::<Option<String>, _>("parent_id"),
        "share_token": row.get::<Option<String>, _>("share_token"),
        "is_deleted": row.get::<bool, _>("is_deleted"),
        "created_at": row.get::<String, _>("created_at"),
    });
    from_json("folder", json)
}

fn client_from_row(row: &SqliteRow) -> Result<Client, CacheError> {
    let tokens = match row.get::<Option<String>, _>("tokens") {
        Some(text) => json_column("tokens", &text)?,
        None => serde_json::Value::Null,
    };
    let interval: Option<i64> = row.get("sync_interval_secs");
    let json = serde_json::json!({
        "id": row.get::<String, _>("id"),
        "owner": row.get::<String, _>("owner_id"),
        "client_type": row.get::<String, _>("client_type"),
        "display_name": row.get::<String, _>("display_name"),
        "is_active": row.get::<bool, _>("is_active"),
        "last_seen": row.get::<Option<String>, _>("last_seen"),
        "connection_status": row.get::<String, _>("connection_status"),
        "last_error": row.get::<Option<String>, _>("last_error"),
        "auto_sync_enabled": row.get::<bool, _>("auto_sync_enabled"),
        "sync_interval_secs": interval.map(|s| s as u64),
        "last_sync": row.get::<Option<String>, _>("last_sync"),
        "tokens": tokens,
        "endpoint": row.get::<Option<String>, _>("endpoint"),
        "created_at": row.get::<String, _>("created_at"),
    });
    from_json("client", json)
}

fn sync_folder_from_row(row: &SqliteRow) -> Result<SyncFolder, CacheError> {
    let clients_text: String = row.get("clients");
    let json = serde_json::json!({
        "owner": row.get::<String, _>("owner_id"),
        "folder": row.get::<String, _>("folder_id"),
        "clients": json_column("sync folder clients", &clients_text)?,
        "is_active": row.get::<bool, _>("is_active"),
        "created_at": row.get::<String, _>("created_at"),
    });
    from_json("sync folder", json)
}

fn sync_state_from_row(row: &SqliteRow) -> Result<FileSyncState, CacheError> {
    let version: i64 = row.get("version");
    let json = serde_json::json!({
        "owner": row.get::<String, _>("owner_id"),
        "client": row.get::<String, _>("client_id"),
        "file": row.get::<String, _>("file_id"),
        "folder": row.get::<Option<String>, _>("folder_id"),
        "operation": row.get::<String, _>("operation"),
        "last_known_hash": row.get::<Option<String>, _>("last_known_hash"),
        "remote_id": row.get::<Option<String>, _>("remote_id"),
        "remote_name": row.get::<Option<String>, _>("remote_name"),
        "remote_path": row.get::<Option<String>, _>("remote_path"),
        "remote_last_modified": row.get::<Option<String>, _>("remote_last_modified"),
        "last_sync_date": row.get::<Option<String>, _>("last_sync_date"),
        "version": version as u64,
        "updated_at": row.get::<String, _>("updated_at"),
    });
    from_json("sync state", json)
}

fn collect<T>(
    rows: Vec<SqliteRow>,
    convert: fn(&SqliteRow) -> Result<T, CacheError>,
) -> anyhow::Result<Vec<T>> {
    rows.iter()
        .map(|r| convert(r).map_err(anyhow::Error::from))
        .collect()
}

// ============================================================================
// IIdentityStore implementation
// ============================================================================

#[async_trait::async_trait]
impl IIdentityStore for SqliteIdentityStore {
    // --- File operations ---

    async fn save_file(&self, file: &File) -> anyhow::Result<()> {
        let id = file.id().to_string();
        let mappings = to_json_text("mappings", file.mappings())?;

        sqlx::query(
            "INSERT INTO files \
             (id, owner_id, storage_path, name, mime_type, category, size, hash, \
              last_modified, folder_id, is_deleted, deleted_at, mappings, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
              storage_path = excluded.storage_path, name = excluded.name, \
              mime_type = excluded.mime_type, category = excluded.category, \
              size = excluded.size, hash = excluded.hash, \
              last_modified = excluded.last_modified, folder_id = excluded.folder_id, \
              is_deleted = excluded.is_deleted, deleted_at = excluded.deleted_at, \
              mappings = excluded.mappings",
        )
        .bind(&id)
        .bind(file.owner().to_string())
        .bind(file.storage_path())
        .bind(file.name())
        .bind(file.mime_type())
        .bind(file.category().as_str())
        .bind(file.size() as i64)
        .bind(file.hash().as_str())
        .bind(ts(file.last_modified()))
        .bind(file.folder().map(|f| f.to_string()))
        .bind(file.is_deleted())
        .bind(opt_ts(file.deleted_at()))
        .bind(&mappings)
        .bind(ts(file.created_at()))
        .execute(&self.pool)
        .await?;

        tracing::trace!(file_id = %id, "Saved file");
        Ok(())
    }

    async fn get_file(&self, id: &FileId) -> anyhow::Result<Option<File>> {
        let row = sqlx::query("SELECT * FROM files WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(file_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn find_files_by_name(
        &self,
        owner: &OwnerId,
        folder: Option<&FolderId>,
        name: &str,
    ) -> anyhow::Result<Vec<File>> {
        let rows = sqlx::query(
            "SELECT * FROM files WHERE owner_id = ? AND folder_id IS ? AND name = ? \
             ORDER BY created_at ASC",
        )
        .bind(owner.to_string())
        .bind(folder.map(|f| f.to_string()))
        .bind(name)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, file_from_row)
    }

    async fn list_files_in_folder(
        &self,
        owner: &OwnerId,
        folder: Option<&FolderId>,
        include_deleted: bool,
    ) -> anyhow::Result<Vec<File>> {
        let rows = sqlx::query(
            "SELECT * FROM files WHERE owner_id = ? AND folder_id IS ? \
             AND (? OR is_deleted = 0) ORDER BY name ASC",
        )
        .bind(owner.to_string())
        .bind(folder.map(|f| f.to_string()))
        .bind(include_deleted)
        .fetch_all(&self.pool)
        .await?;

        collect(rows, file_from_row)
    }

    async fn find_file_by_remote_id(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        remote_id: &RemoteId,
    ) -> anyhow::Result<Option<File>> {
        let row = sqlx::query(
            "SELECT * FROM files WHERE owner_id = ? AND EXISTS ( \
               SELECT 1 FROM json_each(files.mappings) \
               WHERE json_extract(value, '$.client') = ? \
                 AND json_extract(value, '$.remote_id') = ?) \
             LIMIT 1",
        )
        .bind(owner.to_string())
        .bind(client.to_string())
        .bind(remote_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(file_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn delete_file(&self, id: &FileId) -> anyhow::Result<()> {
        let id_str = id.to_string();
        sqlx::query("DELETE FROM file_sync_states WHERE file_id = ?")
            .bind(&id_str)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(&id_str)
            .execute(&self.pool)
            .await?;

        tracing::debug!(file_id = %id_str, "Deleted file");
        Ok(())
    }

    // --- Folder operations ---

    async fn save_folder(&self, folder: &Folder) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO folders (id, owner_id, name, parent_id, share_token, is_deleted, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
              name = excluded.name, parent_id = excluded.parent_id, \
              share_token = excluded.share_token, is_deleted = excluded.is_deleted",
        )
        .bind(folder.id().to_string())
        .bind(folder.owner().to_string())
        .bind(folder.name())
        .bind(folder.parent().map(|p| p.to_string()))
        .bind(folder.share_token())
        .bind(folder.is_deleted())
        .bind(ts(folder.created_at()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_folder(&self, id: &FolderId) -> anyhow::Result<Option<Folder>> {
        let row = sqlx::query("SELECT * FROM folders WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(folder_from_row(r)?)),
            None => Ok(None),
        }
    }

    // --- Client operations ---

    async fn save_client(&self, client: &Client) -> anyhow::Result<()> {
        let tokens = match client.tokens() {
            Some(t) => Some(to_json_text("tokens", t)?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO clients \
             (id, owner_id, client_type, display_name, is_active, last_seen, \
              connection_status, last_error, auto_sync_enabled, sync_interval_secs, \
              last_sync, tokens, endpoint, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET \
              client_type = excluded.client_type, display_name = excluded.display_name, \
              is_active = excluded.is_active, last_seen = excluded.last_seen, \
              connection_status = excluded.connection_status, last_error = excluded.last_error, \
              auto_sync_enabled = excluded.auto_sync_enabled, \
              sync_interval_secs = excluded.sync_interval_secs, last_sync = excluded.last_sync, \
              tokens = excluded.tokens, endpoint = excluded.endpoint",
        )
        .bind(client.id().to_string())
        .bind(client.owner().to_string())
        .bind(client.client_type().as_str())
        .bind(client.display_name())
        .bind(client.is_active())
        .bind(opt_ts(client.last_seen()))
        .bind(client.connection_status().as_str())
        .bind(client.last_error())
        .bind(client.auto_sync_enabled())
        .bind(client.sync_interval_secs().map(|s| s as i64))
        .bind(opt_ts(client.last_sync()))
        .bind(&tokens)
        .bind(client.endpoint())
        .bind(ts(client.created_at()))
        .execute(&self.pool)
        .await?;

        tracing::trace!(client_id = %client.id(), "Saved client");
        Ok(())
    }

    async fn get_client(&self, id: &ClientId) -> anyhow::Result<Option<Client>> {
        let row = sqlx::query("SELECT * FROM clients WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(client_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_clients(&self, owner: &OwnerId) -> anyhow::Result<Vec<Client>> {
        let rows = sqlx::query("SELECT * FROM clients WHERE owner_id = ? ORDER BY created_at ASC")
            .bind(owner.to_string())
            .fetch_all(&self.pool)
            .await?;

        collect(rows, client_from_row)
    }

    async fn list_auto_sync_clients(&self) -> anyhow::Result<Vec<Client>> {
        let rows = sqlx::query(
            "SELECT * FROM clients WHERE is_active = 1 AND auto_sync_enabled = 1 \
             AND connection_status = 'connected' ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        collect(rows, client_from_row)
    }

    // --- SyncFolder operations ---

    async fn save_sync_folder(&self, sync_folder: &SyncFolder) -> anyhow::Result<()> {
        let clients = to_json_text("sync folder clients", sync_folder.clients())?;

        sqlx::query(
            "INSERT INTO sync_folders (owner_id, folder_id, is_active, clients, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(owner_id, folder_id) DO UPDATE SET \
              is_active = excluded.is_active, clients = excluded.clients",
        )
        .bind(sync_folder.owner().to_string())
        .bind(sync_folder.folder().to_string())
        .bind(sync_folder.is_active())
        .bind(&clients)
        .bind(ts(sync_folder.created_at()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_sync_folder(
        &self,
        owner: &OwnerId,
        folder: &FolderId,
    ) -> anyhow::Result<Option<SyncFolder>> {
        let row = sqlx::query("SELECT * FROM sync_folders WHERE owner_id = ? AND folder_id = ?")
            .bind(owner.to_string())
            .bind(folder.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(sync_folder_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn list_sync_folders_for_client(
        &self,
        owner: &OwnerId,
        client: &ClientId,
    ) -> anyhow::Result<Vec<SyncFolder>> {
        let rows = sqlx::query(
            "SELECT * FROM sync_folders WHERE owner_id = ? AND EXISTS ( \
               SELECT 1 FROM json_each(sync_folders.clients) \
               WHERE json_extract(value, '$.client') = ?) \
             ORDER BY created_at ASC",
        )
        .bind(owner.to_string())
        .bind(client.to_string())
        .fetch_all(&self.pool)
        .await?;

        collect(rows, sync_folder_from_row)
    }

    // --- FileSyncState operations ---

    async fn get_sync_state(&self, key: &SyncStateKey) -> anyhow::Result<Option<FileSyncState>> {
        let row = sqlx::query(
            "SELECT * FROM file_sync_states WHERE owner_id = ? AND client_id = ? AND file_id = ?",
        )
        .bind(key.owner.to_string())
        .bind(key.client.to_string())
        .bind(key.file.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(ref r) => Ok(Some(sync_state_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn put_sync_state(
        &self,
        state: &FileSyncState,
        expected_version: Option<u64>,
    ) -> anyhow::Result<bool> {
        let result = match expected_version {
            None => {
                sqlx::query(
                    "INSERT INTO file_sync_states \
                     (owner_id, client_id, file_id, folder_id, operation, last_known_hash, \
                      remote_id, remote_name, remote_path, remote_last_modified, \
                      last_sync_date, version, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?) \
                     ON CONFLICT(owner_id, client_id, file_id) DO NOTHING",
                )
                .bind(state.owner().to_string())
                .bind(state.client().to_string())
                .bind(state.file().to_string())
                .bind(state.folder().map(|f| f.to_string()))
                .bind(state.operation().as_str())
                .bind(state.last_known_hash().map(|h| h.as_str()))
                .bind(state.remote_id().map(|r| r.as_str()))
                .bind(state.remote_name())
                .bind(state.remote_path())
                .bind(opt_ts(state.remote_last_modified()))
                .bind(opt_ts(state.last_sync_date()))
                .bind(ts(state.updated_at()))
                .execute(&self.pool)
                .await?
            }
            Some(version) => {
                sqlx::query(
                    "UPDATE file_sync_states SET \
                      folder_id = ?, operation = ?, last_known_hash = ?, remote_id = ?, \
                      remote_name = ?, remote_path = ?, remote_last_modified = ?, \
                      last_sync_date = ?, updated_at = ?, version = version + 1 \
                     WHERE owner_id = ? AND client_id = ? AND file_id = ? AND version = ?",
                )
                .bind(state.folder().map(|f| f.to_string()))
                .bind(state.operation().as_str())
                .bind(state.last_known_hash().map(|h| h.as_str()))
                .bind(state.remote_id().map(|r| r.as_str()))
                .bind(state.remote_name())
                .bind(state.remote_path())
                .bind(opt_ts(state.remote_last_modified()))
                .bind(opt_ts(state.last_sync_date()))
                .bind(ts(state.updated_at()))
                .bind(state.owner().to_string())
                .bind(state.client().to_string())
                .bind(state.file().to_string())
                .bind(version as i64)
                .execute(&self.pool)
                .await?
            }
        };

        let written = result.rows_affected() == 1;
        if !written {
            tracing::trace!(key = %state.key(), ?expected_version, "Sync state CAS rejected");
        }
        Ok(written)
    }

    async fn delete_sync_state(
        &self,
        key: &SyncStateKey,
        expected_version: u64,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "DELETE FROM file_sync_states \
             WHERE owner_id = ? AND client_id = ? AND file_id = ? AND version = ?",
        )
        .bind(key.owner.to_string())
        .bind(key.client.to_string())
        .bind(key.file.to_string())
        .bind(expected_version as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_sync_states(
        &self,
        owner: &OwnerId,
        client: &ClientId,
        folder: Option<&FolderId>,
    ) -> anyhow::Result<Vec<FileSyncState>> {
        let rows = match folder {
            Some(folder) => {
                sqlx::query(
                    "SELECT * FROM file_sync_states \
                     WHERE owner_id = ? AND client_id = ? AND folder_id = ? \
                     ORDER BY updated_at ASC",
                )
                .bind(owner.to_string())
                .bind(client.to_string())
                .bind(folder.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT * FROM file_sync_states WHERE owner_id = ? AND client_id = ? \
                     ORDER BY updated_at ASC",
                )
                .bind(owner.to_string())
                .bind(client.to_string())
                .fetch_all(&self.pool)
                .await?
            }
        };

        collect(rows, sync_state_from_row)
    }

    async fn list_file_sync_states(&self, file: &FileId) -> anyhow::Result<Vec<FileSyncState>> {
        let rows = sqlx::query("SELECT * FROM file_sync_states WHERE file_id = ?")
            .bind(file.to_string())
            .fetch_all(&self.pool)
            .await?;

        collect(rows, sync_state_from_row)
    }
}
