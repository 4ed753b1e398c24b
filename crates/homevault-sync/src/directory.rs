//! Provider adapter over a local directory tree
//!
//! Backs clients of type `external_drive`: the drive's mount point is the
//! provider root, remote IDs are `/`-separated paths relative to it.
//!
//! - **Atomic writes**: content goes to a hidden temp file, then is renamed
//! - **No overwrite on upload**: a taken name gets a ` (n)` suffix
//! - **No credentials**: tokens never expire and cannot be refreshed

use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use homevault_conflict::unique_name;
use homevault_core::domain::{guess_mime_type, ContentHash, RemoteId, Tokens};
use homevault_core::ports::{
    IProviderAdapter, ProviderError, RemoteFileDescriptor, RemoteFolder,
};

const TMP_SUFFIX: &str = ".homevault-tmp";

/// [`IProviderAdapter`] for a mounted directory
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
}

fn io_error(err: std::io::Error, what: &str) -> anyhow::Error {
    let typed = match err.kind() {
        ErrorKind::NotFound => ProviderError::NotFound(what.to_string()),
        ErrorKind::PermissionDenied => ProviderError::Forbidden(format!("{what}: {err}")),
        _ => return anyhow::Error::new(err).context(format!("I/O error on {what}")),
    };
    anyhow::Error::new(typed)
}

fn join_id(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TMP_SUFFIX)
}

impl DirectoryProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps a remote ID to a path under the root
    ///
    /// Only plain relative components are accepted.
    fn resolve(&self, id: &str) -> anyhow::Result<PathBuf> {
        let rel = Path::new(id);
        if rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(ProviderError::InvalidRequest(format!("invalid remote path: {id}")).into());
        }
        Ok(self.root.join(rel))
    }

    fn descriptor(
        &self,
        id: String,
        name: String,
        content: Option<&[u8]>,
        meta: &std::fs::Metadata,
    ) -> anyhow::Result<RemoteFileDescriptor> {
        let modified_time: DateTime<Utc> = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        let is_folder = meta.is_dir();
        Ok(RemoteFileDescriptor {
            id: RemoteId::new(id.clone())?,
            path: format!("/{id}"),
            size: if is_folder { 0 } else { meta.len() },
            modified_time,
            hash: content.map(ContentHash::of),
            mime_type: (!is_folder).then(|| guess_mime_type(&name).to_string()),
            is_folder,
            name,
        })
    }

    async fn write_atomic(&self, target: &Path, content: &[u8]) -> anyhow::Result<()> {
        let name = target
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ProviderError::InvalidRequest(format!("invalid target {target:?}")))?;
        let tmp = target.with_file_name(format!(".{name}{TMP_SUFFIX}"));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_error(e, name))?;
        if let Err(e) = tokio::fs::rename(&tmp, target).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(e, name));
        }
        Ok(())
    }

    async fn describe_file(&self, id: &str) -> anyhow::Result<RemoteFileDescriptor> {
        let path = self.resolve(id)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(e, id))?;
        let content = tokio::fs::read(&path).await.map_err(|e| io_error(e, id))?;
        let name = id.rsplit('/').next().unwrap_or(id).to_string();
        self.descriptor(id.to_string(), name, Some(&content), &meta)
    }
}

#[async_trait::async_trait]
impl IProviderAdapter for DirectoryProvider {
    fn name(&self) -> &str {
        "directory"
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    async fn list_remote_files(
        &self,
        folder: &RemoteId,
    ) -> anyhow::Result<Vec<RemoteFileDescriptor>> {
        let dir = self.resolve(folder.as_str())?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(e, folder.as_str()))?;

        let mut listing = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(e, folder.as_str()))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                debug!(path = ?entry.path(), "Skipping non UTF-8 entry");
                continue;
            };
            if is_temp_name(&name) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Removed between read_dir and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_error(e, &name)),
            };
            let content = if meta.is_file() {
                match tokio::fs::read(entry.path()).await {
                    Ok(bytes) => Some(bytes),
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(io_error(e, &name)),
                }
            } else {
                None
            };
            let id = join_id(folder.as_str(), &name);
            listing.push(self.descriptor(id, name, content.as_deref(), &meta)?);
        }

        listing.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(count = listing.len(), "Listed directory");
        Ok(listing)
    }

    #[instrument(skip(self, content), fields(size = content.len()))]
    async fn upload_file(
        &self,
        folder: &RemoteId,
        content: &[u8],
        name: &str,
    ) -> anyhow::Result<RemoteFileDescriptor> {
        let dir = self.resolve(folder.as_str())?;
        if !tokio::fs::metadata(&dir)
            .await
            .map_err(|e| io_error(e, folder.as_str()))?
            .is_dir()
        {
            return Err(ProviderError::NotFound(folder.to_string()).into());
        }
        // Validates the name as a single component
        self.resolve(name)?;
        if name.contains('/') {
            return Err(ProviderError::InvalidRequest(format!("invalid file name: {name}")).into());
        }

        let mut taken = std::collections::HashSet::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error(e, folder.as_str()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error(e, folder.as_str()))?
        {
            if let Ok(existing) = entry.file_name().into_string() {
                taken.insert(existing);
            }
        }

        let final_name = unique_name(name, |n| taken.contains(n));
        let id = join_id(folder.as_str(), &final_name);
        self.write_atomic(&dir.join(&final_name), content).await?;
        debug!(%id, "Uploaded file");
        self.describe_file(&id).await
    }

    #[instrument(skip(self, content), fields(size = content.len()))]
    async fn update_file(
        &self,
        remote_id: &RemoteId,
        content: &[u8],
    ) -> anyhow::Result<RemoteFileDescriptor> {
        let path = self.resolve(remote_id.as_str())?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|e| io_error(e, remote_id.as_str()))?;
        if meta.is_dir() {
            return Err(ProviderError::InvalidRequest(format!("{remote_id} is a folder")).into());
        }
        self.write_atomic(&path, content).await?;
        self.describe_file(remote_id.as_str()).await
    }

    async fn download_file(&self, remote_id: &RemoteId) -> anyhow::Result<Vec<u8>> {
        let path = self.resolve(remote_id.as_str())?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| io_error(e, remote_id.as_str()))
    }

    async fn delete_file(&self, remote_id: &RemoteId) -> anyhow::Result<()> {
        let path = self.resolve(remote_id.as_str())?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| io_error(e, remote_id.as_str()))?;
        debug!(%remote_id, "Deleted file");
        Ok(())
    }

    async fn get_folder(&self, folder: &RemoteId) -> anyhow::Result<Option<RemoteFolder>> {
        let path = self.resolve(folder.as_str())?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => Ok(Some(RemoteFolder {
                id: folder.clone(),
                name: folder
                    .as_str()
                    .rsplit('/')
                    .next()
                    .unwrap_or(folder.as_str())
                    .to_string(),
                path: format!("/{folder}"),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(e, folder.as_str())),
        }
    }

    async fn create_folder(
        &self,
        parent: Option<&RemoteId>,
        name: &str,
    ) -> anyhow::Result<RemoteFolder> {
        let id = join_id(parent.map(RemoteId::as_str).unwrap_or(""), name);
        let path = self.resolve(&id)?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| io_error(e, &id))?;
        debug!(%id, "Created folder");
        Ok(RemoteFolder {
            id: RemoteId::new(id.clone())?,
            name: name.to_string(),
            path: format!("/{id}"),
        })
    }

    fn is_expired(&self, _margin: chrono::Duration) -> bool {
        false
    }

    async fn refresh(&self) -> anyhow::Result<Tokens> {
        Err(ProviderError::InvalidRequest("directory provider has no credentials".into()).into())
    }
}
