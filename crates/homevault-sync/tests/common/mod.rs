//! Shared fixtures: an in-memory provider and a wired-up engine
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use homevault_cache::{DatabasePool, MemoryBlobStore, SqliteIdentityStore};
use homevault_conflict::unique_name;
use homevault_core::config::SyncConfig;
use homevault_core::domain::{
    Client, ClientType, ContentHash, File, FileId, FileSyncState, Folder, OwnerId, RemoteId,
    SyncFolder, SyncFolderClient, SyncStateKey, Tokens,
};
use homevault_core::ports::{
    BlobStat, IBlobStore, IIdentityStore, IProviderAdapter, ProviderError, RemoteFileDescriptor,
    RemoteFolder,
};
use homevault_core::usecases::FileLifecycle;
use homevault_sync::{ProviderRegistry, ReconciliationEngine, RetryPolicy, SyncResult};

// ============================================================================
// FakeProvider
// ============================================================================

#[derive(Debug, Clone)]
struct FakeObject {
    folder: String,
    name: String,
    content: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-memory provider with failure injection and call counters
#[derive(Default)]
pub struct FakeProvider {
    objects: Mutex<BTreeMap<String, FakeObject>>,
    folders: Mutex<HashSet<String>>,
    next_id: AtomicUsize,
    failures: Mutex<HashMap<&'static str, ProviderError>>,
    calls: Mutex<HashMap<&'static str, usize>>,
    list_delay: Mutex<Option<Duration>>,
    lists_running: AtomicUsize,
    max_lists_running: AtomicUsize,
    lists_finished: AtomicUsize,
    expired: AtomicBool,
    refreshes: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, op: &'static str) -> anyhow::Result<()> {
        *self.calls.lock().unwrap().entry(op).or_default() += 1;
        match self.failures.lock().unwrap().get(op) {
            Some(err) => Err(err.clone().into()),
            None => Ok(()),
        }
    }

    fn descriptor(id: &str, obj: &FakeObject) -> RemoteFileDescriptor {
        RemoteFileDescriptor {
            id: RemoteId::new(id).unwrap(),
            name: obj.name.clone(),
            path: format!("/{}/{}", obj.folder, obj.name),
            size: obj.content.len() as u64,
            modified_time: obj.modified,
            hash: Some(ContentHash::of(&obj.content)),
            mime_type: None,
            is_folder: false,
        }
    }

    fn insert(&self, folder: &str, name: &str, content: &[u8], modified: DateTime<Utc>) -> RemoteId {
        let mut objects = self.objects.lock().unwrap();
        let taken: HashSet<String> = objects
            .values()
            .filter(|o| o.folder == folder)
            .map(|o| o.name.clone())
            .collect();
        let name = unique_name(name, |n| taken.contains(n));
        let id = format!("obj-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        objects.insert(
            id.clone(),
            FakeObject {
                folder: folder.to_string(),
                name,
                content: content.to_vec(),
                modified,
            },
        );
        RemoteId::new(id).unwrap()
    }

    // --- test controls ---

    pub fn add_folder(&self, name: &str) -> RemoteId {
        self.folders.lock().unwrap().insert(name.to_string());
        RemoteId::new(name).unwrap()
    }

    /// Simulates another device adding a file
    pub fn put(&self, folder: &RemoteId, name: &str, content: &[u8]) -> RemoteId {
        self.insert(folder.as_str(), name, content, Utc::now())
    }

    /// Simulates another device editing a file at `modified`
    pub fn edit(&self, id: &RemoteId, content: &[u8], modified: DateTime<Utc>) {
        let mut objects = self.objects.lock().unwrap();
        let obj = objects.get_mut(id.as_str()).unwrap();
        obj.content = content.to_vec();
        obj.modified = modified;
    }

    /// Changes content without moving the timestamp
    pub fn edit_in_place(&self, id: &RemoteId, content: &[u8]) {
        let mut objects = self.objects.lock().unwrap();
        objects.get_mut(id.as_str()).unwrap().content = content.to_vec();
    }

    pub fn remove(&self, id: &RemoteId) {
        self.objects.lock().unwrap().remove(id.as_str());
    }

    pub fn remove_folder(&self, name: &str) {
        self.folders.lock().unwrap().remove(name);
    }

    pub fn content(&self, id: &RemoteId) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(id.as_str())
            .map(|o| o.content.clone())
    }

    pub fn modified(&self, id: &RemoteId) -> Option<DateTime<Utc>> {
        self.objects.lock().unwrap().get(id.as_str()).map(|o| o.modified)
    }

    /// Sorted names of the objects in a folder
    pub fn names(&self, folder: &RemoteId) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .values()
            .filter(|o| o.folder == folder.as_str())
            .map(|o| o.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Makes every call of `op` fail with `err` until cleared
    pub fn fail(&self, op: &'static str, err: ProviderError) {
        self.failures.lock().unwrap().insert(op, err);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    pub fn calls(&self, op: &'static str) -> usize {
        self.calls.lock().unwrap().get(op).copied().unwrap_or(0)
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    pub fn max_concurrent_lists(&self) -> usize {
        self.max_lists_running.load(Ordering::SeqCst)
    }

    pub fn lists_finished(&self) -> usize {
        self.lists_finished.load(Ordering::SeqCst)
    }

    pub fn set_expired(&self, expired: bool) {
        self.expired.store(expired, Ordering::SeqCst);
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl IProviderAdapter for FakeProvider {
    fn name(&self) -> &str {
        "fake"
    }

    async fn list_remote_files(
        &self,
        folder: &RemoteId,
    ) -> anyhow::Result<Vec<RemoteFileDescriptor>> {
        self.record("list")?;
        let running = self.lists_running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_lists_running.fetch_max(running, Ordering::SeqCst);

        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let listing = if self.folders.lock().unwrap().contains(folder.as_str()) {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, o)| o.folder == folder.as_str())
                .map(|(id, o)| Self::descriptor(id, o))
                .collect())
        } else {
            Err(ProviderError::NotFound(folder.to_string()).into())
        };

        self.lists_running.fetch_sub(1, Ordering::SeqCst);
        self.lists_finished.fetch_add(1, Ordering::SeqCst);
        listing
    }

    async fn upload_file(
        &self,
        folder: &RemoteId,
        content: &[u8],
        name: &str,
    ) -> anyhow::Result<RemoteFileDescriptor> {
        self.record("upload")?;
        let id = self.insert(folder.as_str(), name, content, Utc::now());
        let objects = self.objects.lock().unwrap();
        Ok(Self::descriptor(id.as_str(), &objects[id.as_str()]))
    }

    async fn update_file(
        &self,
        remote_id: &RemoteId,
        content: &[u8],
    ) -> anyhow::Result<RemoteFileDescriptor> {
        self.record("update")?;
        let mut objects = self.objects.lock().unwrap();
        let obj = objects
            .get_mut(remote_id.as_str())
            .ok_or_else(|| ProviderError::NotFound(remote_id.to_string()))?;
        obj.content = content.to_vec();
        obj.modified = Utc::now();
        Ok(Self::descriptor(remote_id.as_str(), obj))
    }

    async fn download_file(&self, remote_id: &RemoteId) -> anyhow::Result<Vec<u8>> {
        self.record("download")?;
        self.content(remote_id)
            .ok_or_else(|| ProviderError::NotFound(remote_id.to_string()).into())
    }

    async fn delete_file(&self, remote_id: &RemoteId) -> anyhow::Result<()> {
        self.record("delete")?;
        match self.objects.lock().unwrap().remove(remote_id.as_str()) {
            Some(_) => Ok(()),
            None => Err(ProviderError::NotFound(remote_id.to_string()).into()),
        }
    }

    async fn get_folder(&self, folder: &RemoteId) -> anyhow::Result<Option<RemoteFolder>> {
        self.record("get_folder")?;
        Ok(self
            .folders
            .lock()
            .unwrap()
            .contains(folder.as_str())
            .then(|| RemoteFolder {
                id: folder.clone(),
                name: folder.to_string(),
                path: format!("/{folder}"),
            }))
    }

    async fn create_folder(
        &self,
        parent: Option<&RemoteId>,
        name: &str,
    ) -> anyhow::Result<RemoteFolder> {
        self.record("create_folder")?;
        let id = match parent {
            Some(parent) => format!("{parent}/{name}"),
            None => name.to_string(),
        };
        self.folders.lock().unwrap().insert(id.clone());
        Ok(RemoteFolder {
            id: RemoteId::new(id.clone()).unwrap(),
            name: name.to_string(),
            path: format!("/{id}"),
        })
    }

    fn is_expired(&self, _margin: chrono::Duration) -> bool {
        self.expired.load(Ordering::SeqCst)
    }

    async fn refresh(&self) -> anyhow::Result<Tokens> {
        self.record("refresh")?;
        // Widen the race window for concurrent callers
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.expired.store(false, Ordering::SeqCst);
        Ok(Tokens {
            access_token: format!("access-{}", self.refreshes()),
            refresh_token: Some("refresh".to_string()),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

// ============================================================================
// HookedBlobStore
// ============================================================================

type WriteHook = Box<dyn FnOnce() + Send>;

/// Memory blob store that counts writes and can run a hook before one
pub struct HookedBlobStore {
    inner: MemoryBlobStore,
    writes: AtomicUsize,
    hook: Mutex<Option<(String, WriteHook)>>,
}

impl HookedBlobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryBlobStore::new(),
            writes: AtomicUsize::new(0),
            hook: Mutex::new(None),
        })
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Runs `hook` once, right before the next write to `path`
    ///
    /// The write then yields for a moment so tasks spawned by the hook get
    /// to run while the writer is still mid-operation.
    pub fn before_write(&self, path: &str, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some((path.to_string(), Box::new(hook)));
    }

    fn take_hook(&self, path: &str) -> Option<WriteHook> {
        let mut slot = self.hook.lock().unwrap();
        if slot.as_ref().is_some_and(|(armed, _)| armed == path) {
            slot.take().map(|(_, hook)| hook)
        } else {
            None
        }
    }
}

#[async_trait::async_trait]
impl IBlobStore for HookedBlobStore {
    async fn read(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> anyhow::Result<()> {
        if let Some(hook) = self.take_hook(path) {
            hook();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> anyhow::Result<()> {
        self.inner.delete(path).await
    }

    async fn stat(&self, path: &str) -> anyhow::Result<Option<BlobStat>> {
        self.inner.stat(path).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub store: Arc<SqliteIdentityStore>,
    pub blobs: Arc<HookedBlobStore>,
    pub provider: Arc<FakeProvider>,
    pub registry: Arc<ProviderRegistry>,
    pub engine: Arc<ReconciliationEngine>,
    pub lifecycle: Arc<FileLifecycle>,
    pub config: SyncConfig,
    pub owner: OwnerId,
    pub client: Client,
    pub folder: Folder,
    pub remote_folder: RemoteId,
}

/// Connected client bound to local folder "Photos" and remote folder "Photos"
pub async fn harness() -> Harness {
    harness_with(|cfg| cfg).await
}

pub async fn harness_with(
    configure: impl FnOnce(SyncFolderClient) -> SyncFolderClient,
) -> Harness {
    let pool = DatabasePool::in_memory().await.unwrap();
    let store = Arc::new(SqliteIdentityStore::new(pool.pool().clone()));
    let blobs = HookedBlobStore::new();
    let provider = FakeProvider::new();
    let registry = Arc::new(ProviderRegistry::new());

    let config = SyncConfig {
        default_interval_secs: 1,
        ..SyncConfig::default()
    };

    let engine = Arc::new(
        ReconciliationEngine::new(store.clone(), blobs.clone(), registry.clone(), &config)
            .with_retry_policy(RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            }),
    );
    let lifecycle = Arc::new(
        FileLifecycle::new(store.clone(), blobs.clone())
            .with_file_locks(engine.file_locks().clone()),
    );

    let owner = OwnerId::new();
    let folder = Folder::new(owner, None, "Photos").unwrap();
    store.save_folder(&folder).await.unwrap();

    let mut client = Client::new(owner, ClientType::Desktop, "Laptop");
    client.mark_connected();
    client.enable_auto_sync(Some(60));
    store.save_client(&client).await.unwrap();
    registry.register(*client.id(), provider.clone());

    let remote_folder = provider.add_folder("Photos");
    let mut sync_folder = SyncFolder::new(owner, *folder.id());
    sync_folder.upsert_client(configure(
        SyncFolderClient::new(*client.id(), "Photos").with_remote_folder(remote_folder.clone(), "/Photos"),
    ));
    store.save_sync_folder(&sync_folder).await.unwrap();

    Harness {
        store,
        blobs,
        provider,
        registry,
        engine,
        lifecycle,
        config,
        owner,
        client,
        folder,
        remote_folder,
    }
}

impl Harness {
    pub fn client_id(&self) -> &homevault_core::domain::ClientId {
        self.client.id()
    }

    /// Runs one reconciliation pass and expects it to succeed
    pub async fn pass(&self) -> SyncResult {
        self.engine
            .reconcile(&self.owner, self.client.id(), self.folder.id())
            .await
            .unwrap()
    }

    pub async fn create(&self, name: &str, content: &[u8]) -> File {
        self.lifecycle
            .create(
                self.owner,
                Some(*self.folder.id()),
                name,
                content,
                homevault_core::domain::guess_mime_type(name),
            )
            .await
            .unwrap()
    }

    pub fn key(&self, file: &FileId) -> SyncStateKey {
        SyncStateKey {
            owner: self.owner,
            client: *self.client.id(),
            file: *file,
        }
    }

    pub async fn row(&self, file: &FileId) -> Option<FileSyncState> {
        self.store.get_sync_state(&self.key(file)).await.unwrap()
    }

    pub async fn file(&self, id: &FileId) -> File {
        self.store.get_file(id).await.unwrap().unwrap()
    }

    pub async fn content(&self, file: &File) -> Vec<u8> {
        self.blobs.read(file.storage_path()).await.unwrap()
    }

    /// Active local files of the folder, sorted by name
    pub async fn local_files(&self) -> Vec<File> {
        let mut files = self
            .store
            .list_files_in_folder(&self.owner, Some(self.folder.id()), false)
            .await
            .unwrap();
        files.sort_by(|a, b| a.name().cmp(b.name()));
        files
    }

    pub async fn local_names(&self) -> Vec<String> {
        self.local_files()
            .await
            .into_iter()
            .map(|f| f.name().to_string())
            .collect()
    }

    /// Remote id recorded for a file on the harness client
    pub async fn remote_id(&self, file: &FileId) -> RemoteId {
        self.row(file).await.unwrap().remote_id().unwrap().clone()
    }
}
