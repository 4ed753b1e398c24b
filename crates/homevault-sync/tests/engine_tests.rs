//! Reconciliation passes against the SQLite store and an in-memory provider

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use common::{harness, harness_with};
use homevault_core::domain::{
    ClientType, ConnectionStatus, ContentHash, SyncDirection, SyncFilters, SyncFolderClient,
    SyncOperation,
};
use homevault_core::ports::{IBlobStore, IIdentityStore, ProviderError};
use homevault_sync::{FailureReason, SyncError};

#[tokio::test]
async fn test_new_local_file_is_uploaded_and_confirmed() {
    let h = harness().await;
    let file = h.create("beach.jpg", b"sand and sea").await;
    assert_eq!(h.row(file.id()).await.unwrap().operation(), SyncOperation::Added);

    let result = h.pass().await;

    assert_eq!(result.uploaded, 1);
    assert!(result.errors.is_empty());
    assert_eq!(h.provider.names(&h.remote_folder), vec!["beach.jpg"]);

    let row = h.row(file.id()).await.unwrap();
    assert_eq!(row.operation(), SyncOperation::Unchanged);
    assert_eq!(row.last_known_hash(), Some(&ContentHash::of(b"sand and sea")));
    let remote_id = row.remote_id().unwrap();
    assert_eq!(h.provider.content(remote_id).unwrap(), b"sand and sea");

    let stored = h.file(file.id()).await;
    let mapping = stored.mapping_for(h.client_id()).unwrap();
    assert_eq!(&mapping.remote_id, remote_id);
    assert_eq!(mapping.remote_path, "/Photos/beach.jpg");
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let h = harness().await;
    h.create("a.txt", b"alpha").await;
    h.create("b.txt", b"beta").await;
    h.provider.put(&h.remote_folder, "c.txt", b"gamma");

    let first = h.pass().await;
    assert_eq!(first.uploaded, 2);
    assert_eq!(first.downloaded, 1);

    let uploads = h.provider.calls("upload");
    let downloads = h.provider.calls("download");
    let second = h.pass().await;

    assert_eq!(second.changes(), 0);
    assert_eq!(second.conflicts, 0);
    assert!(second.errors.is_empty());
    assert_eq!(h.provider.calls("upload"), uploads);
    assert_eq!(h.provider.calls("download"), downloads);
    assert_eq!(h.local_names().await, vec!["a.txt", "b.txt", "c.txt"]);
    assert_eq!(h.provider.names(&h.remote_folder), vec!["a.txt", "b.txt", "c.txt"]);
}

#[tokio::test]
async fn test_round_trip_between_devices() {
    let h = harness().await;

    // Local create reaches the remote
    let notes = h.create("notes.md", b"v1").await;
    h.pass().await;
    let remote_id = h.remote_id(notes.id()).await;

    // Local edit updates the same remote object
    h.lifecycle.update_content(notes.id(), b"v2 local").await.unwrap();
    assert_eq!(h.row(notes.id()).await.unwrap().operation(), SyncOperation::Modified);
    let result = h.pass().await;
    assert_eq!(result.uploaded, 1);
    assert_eq!(h.provider.content(&remote_id).unwrap(), b"v2 local");
    assert_eq!(h.provider.object_count(), 1);

    // Remote edit comes back
    h.provider
        .edit(&remote_id, b"v3 remote", Utc::now() + ChronoDuration::seconds(5));
    let result = h.pass().await;
    assert_eq!(result.downloaded, 1);
    let local = h.file(notes.id()).await;
    assert_eq!(h.content(&local).await, b"v3 remote");
    assert_eq!(local.hash(), &ContentHash::of(b"v3 remote"));
    assert_eq!(h.row(notes.id()).await.unwrap().operation(), SyncOperation::Unchanged);

    // A file added remotely is pulled
    h.provider.put(&h.remote_folder, "cover.png", b"png bytes");
    let result = h.pass().await;
    assert_eq!(result.downloaded, 1);
    let files = h.local_files().await;
    let cover = files.iter().find(|f| f.name() == "cover.png").unwrap();
    assert_eq!(cover.mime_type(), "image/png");
    assert_eq!(h.content(cover).await, b"png bytes");
    assert_eq!(h.row(cover.id()).await.unwrap().operation(), SyncOperation::Unchanged);

    // Remote deletion trashes the local copy
    h.provider.remove(&remote_id);
    let result = h.pass().await;
    assert_eq!(result.deleted_local, 1);
    let trashed = h.file(notes.id()).await;
    assert!(trashed.is_deleted());
    assert!(trashed.mapping_for(h.client_id()).is_none());
    assert!(h.row(notes.id()).await.is_none());

    // Local deletion removes the remote copy
    let cover_remote = h.remote_id(cover.id()).await;
    h.lifecycle.soft_delete(cover.id()).await.unwrap();
    let result = h.pass().await;
    assert_eq!(result.deleted_remote, 1);
    assert!(h.provider.content(&cover_remote).is_none());
    assert!(h.row(cover.id()).await.is_none());

    // Nothing left to do
    let result = h.pass().await;
    assert_eq!(result.changes(), 0);
    assert!(h.local_names().await.is_empty());
    assert_eq!(h.provider.object_count(), 0);
}

#[tokio::test]
async fn test_equal_timestamps_with_different_content_is_left_alone() {
    let h = harness().await;
    let file = h.create("report.pdf", b"local text").await;
    h.pass().await;
    let remote_id = h.remote_id(file.id()).await;

    h.provider.edit_in_place(&remote_id, b"remote text");
    let result = h.pass().await;

    assert_eq!(result.conflicts, 1);
    assert_eq!(result.changes(), 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].reason, FailureReason::HashMismatchSameDate);
    assert_eq!(result.errors[0].file, "report.pdf");

    // Neither side was overwritten
    let local = h.file(file.id()).await;
    assert_eq!(h.content(&local).await, b"local text");
    assert_eq!(h.provider.content(&remote_id).unwrap(), b"remote text");
}

#[tokio::test]
async fn test_filters_skip_remote_files_silently() {
    let h = harness_with(|cfg| {
        cfg.with_filters(SyncFilters {
            excluded_extensions: vec![".tmp".to_string()],
            max_file_size: Some(10),
            ..Default::default()
        })
    })
    .await;
    h.provider.put(&h.remote_folder, "draft.tmp", b"x");
    h.provider.put(&h.remote_folder, "huge.txt", b"more than ten bytes");
    h.provider.put(&h.remote_folder, "ok.txt", b"fine");

    let result = h.pass().await;

    assert_eq!(result.downloaded, 1);
    assert!(result.errors.is_empty());
    assert_eq!(h.local_names().await, vec!["ok.txt"]);
}

#[tokio::test]
async fn test_failed_upload_stays_pending_until_next_pass() {
    let h = harness().await;
    let file = h.create("clip.mp4", b"frames").await;
    h.provider.fail("upload", ProviderError::Network("connection reset".into()));

    let result = h.pass().await;

    assert_eq!(result.uploaded, 0);
    assert_eq!(result.errors.len(), 1);
    assert!(matches!(
        result.errors[0].reason,
        FailureReason::Operation { op: "push", .. }
    ));
    // First try plus two retries
    assert_eq!(h.provider.calls("upload"), 3);
    assert_eq!(h.row(file.id()).await.unwrap().operation(), SyncOperation::Added);

    h.provider.clear_failures();
    let result = h.pass().await;
    assert_eq!(result.uploaded, 1);
    assert_eq!(h.row(file.id()).await.unwrap().operation(), SyncOperation::Unchanged);
}

#[tokio::test]
async fn test_permanent_error_is_not_retried() {
    let h = harness().await;
    h.create("a.txt", b"a").await;
    h.provider
        .fail("upload", ProviderError::InvalidRequest("name rejected".into()));

    let result = h.pass().await;

    assert_eq!(result.errors.len(), 1);
    assert_eq!(h.provider.calls("upload"), 1);
}

#[tokio::test]
async fn test_auth_failure_aborts_the_pass() {
    let h = harness().await;
    let file = h.create("a.txt", b"a").await;
    h.provider
        .fail("list", ProviderError::Unauthorized("token revoked".into()));

    let err = h
        .engine
        .reconcile(&h.owner, h.client_id(), h.folder.id())
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(h.provider.calls("list"), 1);
    assert_eq!(h.provider.calls("upload"), 0);
    assert_eq!(h.row(file.id()).await.unwrap().operation(), SyncOperation::Added);
}

#[tokio::test]
async fn test_auth_failure_mid_pass_keeps_earlier_confirmations() {
    let h = harness().await;
    let first = h.create("a.txt", b"a").await;
    h.pass().await;
    // Rows are pushed oldest change first
    h.lifecycle.update_content(first.id(), b"a2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = h.create("b.txt", b"b").await;
    h.provider
        .fail("upload", ProviderError::Forbidden("read-only share".into()));

    let err = h
        .engine
        .reconcile(&h.owner, h.client_id(), h.folder.id())
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    // The update went through before the upload failed
    let first_row = h.row(first.id()).await.unwrap();
    assert_eq!(first_row.operation(), SyncOperation::Unchanged);
    assert_eq!(first_row.last_known_hash(), Some(&ContentHash::of(b"a2")));
    assert_eq!(h.row(second.id()).await.unwrap().operation(), SyncOperation::Added);
}

#[tokio::test]
async fn test_unchanged_file_with_vanished_remote_is_reuploaded_after_local_drift() {
    let h = harness().await;
    let file = h.create("keep.txt", b"first").await;
    h.pass().await;
    let remote_id = h.remote_id(file.id()).await;

    // Content changed without the tracker hearing about it, then the remote
    // copy disappeared
    let mut stored = h.file(file.id()).await;
    stored.replace_content(6, ContentHash::of(b"second"), Utc::now());
    h.store.save_file(&stored).await.unwrap();
    h.blobs
        .write(stored.storage_path(), b"second")
        .await
        .unwrap();
    h.provider.remove(&remote_id);

    let result = h.pass().await;

    assert_eq!(result.uploaded, 1);
    assert_eq!(result.deleted_local, 0);
    assert!(!h.file(file.id()).await.is_deleted());
    assert_eq!(h.provider.names(&h.remote_folder), vec!["keep.txt"]);
}

#[tokio::test]
async fn test_to_client_never_pulls_and_restores_vanished_remote() {
    let h = harness_with(|cfg| cfg.with_direction(SyncDirection::ToClient)).await;
    let file = h.create("master.txt", b"source of truth").await;
    h.pass().await;
    h.provider.put(&h.remote_folder, "stray.txt", b"remote only");
    h.provider.remove(&h.remote_id(file.id()).await);

    let result = h.pass().await;

    assert_eq!(result.downloaded, 0);
    assert_eq!(result.uploaded, 1);
    assert_eq!(h.local_names().await, vec!["master.txt"]);
    assert_eq!(h.provider.names(&h.remote_folder), vec!["master.txt", "stray.txt"]);
}

#[tokio::test]
async fn test_from_client_pulls_without_pushing() {
    let h = harness_with(|cfg| cfg.with_direction(SyncDirection::FromClient)).await;
    h.create("photo.jpg", b"local").await;
    h.provider.put(&h.remote_folder, "photo.jpg", b"remote");

    let result = h.pass().await;

    assert_eq!(result.uploaded, 0);
    assert_eq!(result.downloaded, 1);
    assert_eq!(h.provider.calls("upload"), 0);
    // The pulled copy does not replace the local one
    assert_eq!(h.local_names().await, vec!["photo (1).jpg", "photo.jpg"]);
}

#[tokio::test]
async fn test_pulled_file_is_fanned_out_to_other_clients() {
    let h = harness().await;
    let mut tablet = homevault_core::domain::Client::new(h.owner, ClientType::Mobile, "Tablet");
    tablet.mark_connected();
    h.store.save_client(&tablet).await.unwrap();
    let mut sync_folder = h
        .store
        .get_sync_folder(&h.owner, h.folder.id())
        .await
        .unwrap()
        .unwrap();
    sync_folder.upsert_client(SyncFolderClient::new(*tablet.id(), "Photos"));
    h.store.save_sync_folder(&sync_folder).await.unwrap();

    h.provider.put(&h.remote_folder, "shared.jpg", b"from laptop");
    h.pass().await;

    let pulled = h.local_files().await.remove(0);
    let tablet_rows = h
        .store
        .list_file_sync_states(pulled.id())
        .await
        .unwrap()
        .into_iter()
        .filter(|s| s.client() == tablet.id())
        .collect::<Vec<_>>();
    assert_eq!(tablet_rows.len(), 1);
    assert_eq!(tablet_rows[0].operation(), SyncOperation::Added);
}

#[tokio::test]
async fn test_missing_remote_folder_id_creates_folder() {
    let h = harness().await;
    let mut sync_folder = h
        .store
        .get_sync_folder(&h.owner, h.folder.id())
        .await
        .unwrap()
        .unwrap();
    sync_folder.upsert_client(SyncFolderClient::new(*h.client_id(), "Camera Roll"));
    h.store.save_sync_folder(&sync_folder).await.unwrap();
    h.create("a.jpg", b"a").await;

    let result = h.pass().await;

    assert_eq!(result.uploaded, 1);
    assert_eq!(h.provider.calls("create_folder"), 1);
    let stored = h
        .store
        .get_sync_folder(&h.owner, h.folder.id())
        .await
        .unwrap()
        .unwrap();
    let cfg = stored.client_config(h.client_id()).unwrap();
    let remote_folder = cfg.remote_folder_id.clone().unwrap();
    assert_eq!(remote_folder.as_str(), "Camera Roll");
    assert_eq!(cfg.remote_folder_path, "/Camera Roll");
    assert!(cfg.last_sync_date.is_some());
    assert_eq!(h.provider.names(&remote_folder), vec!["a.jpg"]);
}

#[tokio::test]
async fn test_deleted_remote_folder_fails_without_local_changes() {
    let h = harness().await;
    let file = h.create("a.txt", b"a").await;
    h.pass().await;
    h.provider.remove_folder("Photos");

    let err = h
        .engine
        .reconcile(&h.owner, h.client_id(), h.folder.id())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::RemoteFolderMissing(_)));
    assert!(!err.is_fatal());
    assert!(!h.file(file.id()).await.is_deleted());
    assert_eq!(h.row(file.id()).await.unwrap().operation(), SyncOperation::Unchanged);
}

#[tokio::test]
async fn test_preconditions() {
    let h = harness().await;

    // No provider registered
    h.registry.remove(h.client_id());
    let err = h
        .engine
        .reconcile(&h.owner, h.client_id(), h.folder.id())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NoActiveConnection(_)));
    assert!(err.is_fatal());
    h.registry.register(*h.client_id(), h.provider.clone());

    // Another owner
    let stranger = homevault_core::domain::OwnerId::new();
    let err = h
        .engine
        .reconcile(&stranger, h.client_id(), h.folder.id())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    // Inactive client
    let mut client = h.store.get_client(h.client_id()).await.unwrap().unwrap();
    client.set_active(false);
    h.store.save_client(&client).await.unwrap();
    let err = h
        .engine
        .reconcile(&h.owner, h.client_id(), h.folder.id())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Validation(_)));

    // Unknown client
    let err = h
        .engine
        .reconcile(&h.owner, &homevault_core::domain::ClientId::new(), h.folder.id())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::ClientNotFound(_)));

    assert_eq!(h.provider.calls("list"), 0);
}

#[tokio::test]
async fn test_paused_sync_folder_is_rejected() {
    let h = harness().await;
    let mut sync_folder = h
        .store
        .get_sync_folder(&h.owner, h.folder.id())
        .await
        .unwrap()
        .unwrap();
    sync_folder.set_active(false);
    h.store.save_sync_folder(&sync_folder).await.unwrap();

    let err = h
        .engine
        .reconcile(&h.owner, h.client_id(), h.folder.id())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::Validation(_)));
}

#[tokio::test]
async fn test_expired_token_is_refreshed_before_the_pass() {
    let h = harness().await;
    h.provider.set_expired(true);

    h.pass().await;

    assert_eq!(h.provider.refreshes(), 1);
    let client = h.store.get_client(h.client_id()).await.unwrap().unwrap();
    assert_eq!(client.tokens().unwrap().access_token, "access-1");
}

#[tokio::test]
async fn test_concurrent_passes_refresh_once() {
    let h = harness().await;
    h.provider.set_expired(true);

    let (a, b) = tokio::join!(
        h.engine
            .credentials()
            .ensure_fresh(h.client_id(), h.provider.as_ref()),
        h.engine
            .credentials()
            .ensure_fresh(h.client_id(), h.provider.as_ref()),
    );

    assert_eq!(
        [a.unwrap(), b.unwrap()].iter().filter(|refreshed| **refreshed).count(),
        1
    );
    assert_eq!(h.provider.refreshes(), 1);
}

#[tokio::test]
async fn test_rejected_refresh_is_fatal() {
    let h = harness().await;
    h.provider.set_expired(true);
    h.provider
        .fail("refresh", ProviderError::Unauthorized("invalid_grant".into()));

    let err = h
        .engine
        .reconcile(&h.owner, h.client_id(), h.folder.id())
        .await
        .unwrap_err();

    assert!(err.is_fatal());
    assert_eq!(h.provider.calls("list"), 0);
}

#[tokio::test]
async fn test_local_read_failure_is_a_file_error_not_fatal() {
    let h = harness().await;
    let broken = h.create("invoice_401.pdf", b"pdf").await;
    h.create("receipt.txt", b"ok").await;
    h.blobs.delete(broken.storage_path()).await.unwrap();

    let result = h
        .engine
        .reconcile(&h.owner, h.client_id(), h.folder.id())
        .await
        .unwrap();

    assert_eq!(result.uploaded, 1);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].file, "invoice_401.pdf");
    assert_eq!(h.provider.names(&h.remote_folder), vec!["receipt.txt"]);
    assert_eq!(h.row(broken.id()).await.unwrap().operation(), SyncOperation::Added);

    let client = h.store.get_client(h.client_id()).await.unwrap().unwrap();
    assert_eq!(client.connection_status(), ConnectionStatus::Connected);
    assert!(h.registry.contains(h.client_id()));
}

#[tokio::test]
async fn test_local_edit_during_download_is_kept() {
    let h = harness().await;
    let file = h.create("draft.txt", b"v1").await;
    h.pass().await;
    let remote_id = h.remote_id(file.id()).await;
    h.provider
        .edit(&remote_id, b"REMOTE v2", Utc::now() + ChronoDuration::seconds(60));

    // Edit locally while the engine is about to write the download
    let edit = Arc::new(Mutex::new(None));
    {
        let edit = edit.clone();
        let lifecycle = h.lifecycle.clone();
        let id = *file.id();
        h.blobs.before_write(file.storage_path(), move || {
            let task = tokio::spawn(async move { lifecycle.update_content(&id, b"LOCAL EDIT").await });
            *edit.lock().unwrap() = Some(task);
        });
    }

    h.pass().await;
    let task = edit.lock().unwrap().take().unwrap();
    task.await.unwrap().unwrap();

    let local = h.file(file.id()).await;
    assert_eq!(h.content(&local).await, b"LOCAL EDIT");
    assert_eq!(local.hash(), &ContentHash::of(b"LOCAL EDIT"));
    assert_eq!(h.row(file.id()).await.unwrap().operation(), SyncOperation::Modified);

    let result = h.pass().await;
    assert_eq!(result.uploaded, 1);
    assert_eq!(h.provider.content(&remote_id).unwrap(), b"LOCAL EDIT");
    assert!(h.engine.file_locks().is_empty());
}

#[tokio::test]
async fn test_newer_remote_with_same_content_updates_metadata_only() {
    let h = harness().await;
    let file = h.create("scan.pdf", b"same bytes").await;
    h.pass().await;
    let remote_id = h.remote_id(file.id()).await;
    let before = h.file(file.id()).await;
    let writes = h.blobs.writes();

    let later = Utc::now() + ChronoDuration::seconds(60);
    h.provider.edit(&remote_id, b"same bytes", later);
    let result = h.pass().await;

    assert_eq!(result.downloaded, 0);
    assert!(result.errors.is_empty());
    assert_eq!(h.provider.calls("download"), 1);
    assert_eq!(h.blobs.writes(), writes);
    assert_eq!(h.file(file.id()).await.last_modified(), before.last_modified());

    let row = h.row(file.id()).await.unwrap();
    assert_eq!(row.operation(), SyncOperation::Unchanged);
    assert_eq!(row.remote_last_modified(), Some(later));
}

#[tokio::test]
async fn test_newer_local_content_is_queued_then_pushed() {
    let h = harness().await;
    let file = h.create("todo.md", b"first").await;
    h.pass().await;
    let remote_id = h.remote_id(file.id()).await;

    // Content changed without the tracker hearing about it
    let mut stored = h.file(file.id()).await;
    stored.replace_content(6, ContentHash::of(b"second"), Utc::now() + ChronoDuration::seconds(60));
    h.store.save_file(&stored).await.unwrap();
    h.blobs.write(stored.storage_path(), b"second").await.unwrap();

    let result = h.pass().await;
    assert_eq!(result.uploaded, 0);
    assert_eq!(result.downloaded, 0);
    assert_eq!(h.row(file.id()).await.unwrap().operation(), SyncOperation::Modified);
    assert_eq!(h.provider.content(&remote_id).unwrap(), b"first");

    let result = h.pass().await;
    assert_eq!(result.uploaded, 1);
    assert_eq!(h.provider.content(&remote_id).unwrap(), b"second");
    assert_eq!(h.row(file.id()).await.unwrap().operation(), SyncOperation::Unchanged);
}

#[tokio::test]
async fn test_lost_client_mapping_is_restored() {
    let h = harness().await;
    let file = h.create("map.png", b"tiles").await;
    h.pass().await;
    let remote_id = h.remote_id(file.id()).await;

    let mut stored = h.file(file.id()).await;
    assert!(stored.clear_mapping(h.client_id()));
    h.store.save_file(&stored).await.unwrap();

    let result = h.pass().await;

    assert!(result.errors.is_empty());
    assert_eq!(result.changes(), 0);
    assert_eq!(h.provider.calls("upload"), 1);
    let restored = h.file(file.id()).await;
    assert_eq!(restored.mapping_for(h.client_id()).unwrap().remote_id, remote_id);
}
