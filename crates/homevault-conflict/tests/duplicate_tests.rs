//! Duplicate resolver against the SQLite store and an in-memory blob store

use std::sync::Arc;
use std::time::Duration;

use homevault_cache::{DatabasePool, MemoryBlobStore, SqliteIdentityStore};
use homevault_conflict::{CreateRequest, DuplicateAction, DuplicateResolver, ResolveError};
use homevault_core::domain::{
    ClientId, ContentHash, Folder, OwnerId, SyncFolder, SyncFolderClient, SyncOperation,
    SyncStateKey,
};
use homevault_core::ports::{IBlobStore, IIdentityStore};
use homevault_core::usecases::{FileLifecycle, FileLocks};

struct Fixture {
    store: Arc<SqliteIdentityStore>,
    blobs: Arc<MemoryBlobStore>,
    resolver: DuplicateResolver,
    owner: OwnerId,
    folder: Folder,
}

async fn setup() -> Fixture {
    let pool = DatabasePool::in_memory().await.unwrap();
    let store = Arc::new(SqliteIdentityStore::new(pool.pool().clone()));
    let blobs = Arc::new(MemoryBlobStore::new());
    let resolver = DuplicateResolver::new(store.clone(), blobs.clone());

    let owner = OwnerId::new();
    let folder = Folder::new(owner, None, "Photos").unwrap();
    store.save_folder(&folder).await.unwrap();

    Fixture {
        store,
        blobs,
        resolver,
        owner,
        folder,
    }
}

impl Fixture {
    fn request(&self, name: &str, content: &[u8]) -> CreateRequest {
        CreateRequest::new(self.owner, Some(*self.folder.id()), name, content.to_vec())
    }

    async fn active_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .store
            .list_files_in_folder(&self.owner, Some(self.folder.id()), false)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name().to_string())
            .collect();
        names.sort();
        names
    }
}

#[tokio::test]
async fn test_create_without_collision() {
    let fx = setup().await;

    let file = fx
        .resolver
        .resolve_create(fx.request("photo.jpg", b"pixels"), None)
        .await
        .unwrap();

    assert_eq!(file.name(), "photo.jpg");
    assert_eq!(file.mime_type(), "image/jpeg");
    assert_eq!(file.hash(), &ContentHash::of(b"pixels"));
    assert_eq!(fx.blobs.read(file.storage_path()).await.unwrap(), b"pixels");
}

#[tokio::test]
async fn test_duplicate_suggests_next_free_name() {
    let fx = setup().await;
    fx.resolver
        .resolve_create(fx.request("photo.jpg", b"one"), None)
        .await
        .unwrap();
    fx.resolver
        .resolve_create(fx.request("photo (1).jpg", b"two"), None)
        .await
        .unwrap();

    let err = fx
        .resolver
        .resolve_create(fx.request("photo.jpg", b"three"), None)
        .await
        .unwrap_err();

    assert_eq!(err.code(), "DUPLICATE_FILE");
    match err {
        ResolveError::Duplicate {
            existing_file,
            suggested_name,
        } => {
            assert_eq!(existing_file.name(), "photo.jpg");
            assert_eq!(suggested_name, "photo (2).jpg");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fx.active_names().await, vec!["photo (1).jpg", "photo.jpg"]);
}

#[tokio::test]
async fn test_cancel_has_no_side_effects() {
    let fx = setup().await;
    let original = fx
        .resolver
        .resolve_create(fx.request("doc.txt", b"keep me"), None)
        .await
        .unwrap();
    let blobs_before = fx.blobs.len();

    let err = fx
        .resolver
        .resolve_create(fx.request("doc.txt", b"drop me"), Some(DuplicateAction::Cancel))
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::Cancelled));
    assert_eq!(fx.blobs.len(), blobs_before);
    let stored = fx.store.get_file(original.id()).await.unwrap().unwrap();
    assert_eq!(stored.hash(), &ContentHash::of(b"keep me"));
}

#[tokio::test]
async fn test_overwrite_keeps_identity_and_marks_modified() {
    let fx = setup().await;
    let client = ClientId::new();
    let mut sync_folder = SyncFolder::new(fx.owner, *fx.folder.id());
    sync_folder.upsert_client(SyncFolderClient::new(client, "Photos"));
    fx.store.save_sync_folder(&sync_folder).await.unwrap();

    let original = fx
        .resolver
        .resolve_create(fx.request("doc.txt", b"v1"), None)
        .await
        .unwrap();

    // Pretend the first version was synced
    let key = SyncStateKey {
        owner: fx.owner,
        client,
        file: *original.id(),
    };
    let mut row = fx.store.get_sync_state(&key).await.unwrap().unwrap();
    let version = row.version();
    row.set_operation(SyncOperation::Unchanged);
    fx.store.put_sync_state(&row, Some(version)).await.unwrap();

    let updated = fx
        .resolver
        .resolve_create(
            fx.request("doc.txt", b"version two"),
            Some(DuplicateAction::Overwrite),
        )
        .await
        .unwrap();

    assert_eq!(updated.id(), original.id());
    assert_eq!(updated.size(), 11);
    assert_eq!(fx.active_names().await, vec!["doc.txt"]);
    let row = fx.store.get_sync_state(&key).await.unwrap().unwrap();
    assert_eq!(row.operation(), SyncOperation::Modified);
}

#[tokio::test]
async fn test_rename_creates_new_file() {
    let fx = setup().await;
    fx.resolver
        .resolve_create(fx.request("clip.mp4", b"a"), None)
        .await
        .unwrap();

    let renamed = fx
        .resolver
        .resolve_create(fx.request("clip.mp4", b"b"), Some(DuplicateAction::Rename))
        .await
        .unwrap();

    assert_eq!(renamed.name(), "clip (1).mp4");
    assert_eq!(fx.active_names().await, vec!["clip (1).mp4", "clip.mp4"]);
}

#[tokio::test]
async fn test_trashed_match_is_restored_and_overwritten() {
    let fx = setup().await;
    let lifecycle = FileLifecycle::new(fx.store.clone(), fx.blobs.clone());

    let older = fx
        .resolver
        .resolve_create(fx.request("notes.md", b"old"), None)
        .await
        .unwrap();
    lifecycle.soft_delete(older.id()).await.unwrap();
    let newer = fx
        .resolver
        .resolve_create(fx.request("notes.md", b"newer"), None)
        .await
        .unwrap();
    // The second create restored the trashed record instead of adding one
    assert_eq!(newer.id(), older.id());
    assert!(!newer.is_deleted());
    assert_eq!(newer.hash(), &ContentHash::of(b"newer"));

    let all = fx
        .store
        .list_files_in_folder(&fx.owner, Some(fx.folder.id()), true)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn test_restore_picks_most_recently_trashed() {
    let fx = setup().await;
    let lifecycle = FileLifecycle::new(fx.store.clone(), fx.blobs.clone());

    let first = lifecycle
        .create(fx.owner, Some(*fx.folder.id()), "a.txt", b"1", "text/plain")
        .await
        .unwrap();
    lifecycle.soft_delete(first.id()).await.unwrap();
    let second = lifecycle
        .create(fx.owner, Some(*fx.folder.id()), "a.txt", b"2", "text/plain")
        .await
        .unwrap();
    lifecycle.soft_delete(second.id()).await.unwrap();

    let restored = fx
        .resolver
        .resolve_create(fx.request("a.txt", b"3"), None)
        .await
        .unwrap();

    assert_eq!(restored.id(), second.id());
    let first_now = fx.store.get_file(first.id()).await.unwrap().unwrap();
    assert!(first_now.is_deleted());
}

#[tokio::test]
async fn test_validation_rejects_before_writing() {
    let fx = setup().await;

    for bad in ["", "a/b", "nul\0byte", ".."] {
        let err = fx
            .resolver
            .resolve_create(fx.request(bad, b"x"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR", "name {bad:?}");
    }

    let foreign = Folder::new(OwnerId::new(), None, "Elsewhere").unwrap();
    fx.store.save_folder(&foreign).await.unwrap();
    let req = CreateRequest::new(fx.owner, Some(*foreign.id()), "x.txt", b"x".to_vec());
    let err = fx.resolver.resolve_create(req, None).await.unwrap_err();
    assert!(matches!(err, ResolveError::Validation(_)));

    assert!(fx.blobs.is_empty());
}

#[tokio::test]
async fn test_overwrite_waits_for_shared_file_lock() {
    let fx = setup().await;
    let locks = Arc::new(FileLocks::new());
    let resolver = DuplicateResolver::new(fx.store.clone(), fx.blobs.clone())
        .with_file_locks(locks.clone());
    let original = resolver
        .resolve_create(fx.request("doc.txt", b"v1"), None)
        .await
        .unwrap();

    let held = locks.lock(original.id()).await;
    let overwrite = resolver.resolve_create(
        fx.request("doc.txt", b"v2"),
        Some(DuplicateAction::Overwrite),
    );
    tokio::pin!(overwrite);
    assert!(tokio::time::timeout(Duration::from_millis(30), &mut overwrite)
        .await
        .is_err());

    drop(held);
    let updated = overwrite.await.unwrap();
    assert_eq!(updated.id(), original.id());
    assert_eq!(fx.blobs.read(updated.storage_path()).await.unwrap(), b"v2");
    assert!(locks.is_empty());
}
