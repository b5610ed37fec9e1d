//! Scan lifecycle scenarios driven through the public coordinator API
//! against the in-memory record store.

mod helpers;

use helpers::*;
use scan_sync::models::event::EventKind;
use scan_sync::models::scan::{ScanPatch, ScanRevision, ScanStatus};
use scan_sync::services::coordinator::CoordinatorError;
use scan_sync::services::memory_store::StoreCall;
use scan_sync::services::preprocess::{ImagePreprocessor, PreprocessError};
use scan_sync::services::store::{RecordStore, StoreError};
use tokio_test::{assert_err, assert_ok};

#[tokio::test]
async fn test_partial_results_resolve_to_completed() {
    let (store, coordinator) = spawn_coordinator();
    let mut events = coordinator.events();

    let id = coordinator.submit(&png_bytes(100, 100)).await.unwrap();
    let submitted = expect_event(&mut events, EventKind::Submitted).await;
    assert_eq!(submitted.scan_id, id);
    assert_eq!(submitted.status, ScanStatus::Uploading);

    // Analyzers write their own fields, in their own time
    store.update(id, &ScanPatch::text("X")).await.unwrap();
    let event = expect_event(&mut events, EventKind::Progressed).await;
    assert_eq!(event.status, ScanStatus::Processing);
    assert_eq!(event.text_result.as_deref(), Some("X"));
    assert_eq!(event.classification_result, None);
    assert_eq!(event.face_result, None);

    store.update(id, &ScanPatch::classification("Y")).await.unwrap();
    let event = expect_event(&mut events, EventKind::Progressed).await;
    assert!(!event.status.is_terminal());

    store.update(id, &ScanPatch::face("Z")).await.unwrap();
    let event = expect_event(&mut events, EventKind::Completed).await;
    assert_eq!(event.status, ScanStatus::Completed);
    assert_eq!(event.face_result.as_deref(), Some("Z"));

    wait_until(|| store.record(id).map(|r| r.status) == Some(ScanStatus::Completed)).await;
    // The store echoes the completion write back; nothing more is emitted
    assert_no_event(&mut events).await;

    let completion_writes = store
        .calls()
        .into_iter()
        .filter(|call| {
            matches!(call, StoreCall::Update(scan_id, patch)
                if *scan_id == id && *patch == ScanPatch::status(ScanStatus::Completed))
        })
        .count();
    assert_eq!(completion_writes, 1);

    let snapshot = coordinator.snapshot().unwrap();
    assert_eq!(snapshot.status, ScanStatus::Completed);
    assert_eq!(coordinator.aggregated_text().as_deref(), Some("X\n\nY\n\nZ"));
}

#[tokio::test]
async fn test_abandon_before_results() {
    let (store, coordinator) = spawn_coordinator();
    let mut events = coordinator.events();

    let id = coordinator.submit(&png_bytes(32, 32)).await.unwrap();
    expect_event(&mut events, EventKind::Submitted).await;

    assert_ok!(coordinator.abandon().await);
    let released = expect_event(&mut events, EventKind::Released).await;
    assert_eq!(released.scan_id, id);

    let calls = store.calls();
    assert!(calls.contains(&StoreCall::Delete(id)));
    assert!(calls.contains(&StoreCall::Unsubscribe(id)));
    assert_eq!(store.record_count(), 0);
    assert_eq!(store.subscription_count(), 0);
    assert!(coordinator.snapshot().is_none());

    // A late delivery has nowhere to go
    let late = ScanRevision {
        id,
        status: ScanStatus::Processing,
        text_result: Some("late".to_string()),
        classification_result: None,
        face_result: None,
    };
    assert_eq!(store.redeliver(late), 0);
    assert_no_event(&mut events).await;

    // Idempotent
    assert_ok!(coordinator.abandon().await);
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn test_resubmit_abandons_previous_scan() {
    let (store, coordinator) = spawn_coordinator();
    let mut events = coordinator.events();

    let first = coordinator.submit(&png_bytes(16, 16)).await.unwrap();
    let second = coordinator.submit(&png_bytes(24, 24)).await.unwrap();
    assert_ne!(first, second);

    expect_event(&mut events, EventKind::Submitted).await;
    let released = expect_event(&mut events, EventKind::Released).await;
    assert_eq!(released.scan_id, first);
    let submitted = expect_event(&mut events, EventKind::Submitted).await;
    assert_eq!(submitted.scan_id, second);

    assert_eq!(store.subscription_count(), 1);
    assert_eq!(store.record_count(), 1);
    assert!(store.record(first).is_none());
    assert_eq!(coordinator.snapshot().unwrap().scan_id, second);

    // The old analyzers find nothing to write to
    let err = store.update(first, &ScanPatch::text("stale")).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn test_redelivered_revision_is_idempotent() {
    let (store, coordinator) = spawn_coordinator();
    let mut events = coordinator.events();

    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();
    expect_event(&mut events, EventKind::Submitted).await;

    store.update(id, &ScanPatch::classification("cup")).await.unwrap();
    expect_event(&mut events, EventKind::Progressed).await;
    let before = coordinator.snapshot().unwrap();

    let revision = store.record(id).unwrap().revision();
    assert_eq!(store.redeliver(revision.clone()), 1);
    assert_eq!(store.redeliver(revision), 1);
    assert_no_event(&mut events).await;

    assert_eq!(coordinator.snapshot().unwrap(), before);
}

#[tokio::test]
async fn test_stale_replay_keeps_newer_fields() {
    let (store, coordinator) = spawn_coordinator();
    let mut events = coordinator.events();

    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();
    expect_event(&mut events, EventKind::Submitted).await;
    let stale = store.record(id).unwrap().revision();

    store.update(id, &ScanPatch::text("fresh")).await.unwrap();
    expect_event(&mut events, EventKind::Progressed).await;

    store.redeliver(stale);
    assert_no_event(&mut events).await;

    let snapshot = coordinator.snapshot().unwrap();
    assert_eq!(snapshot.text_result.as_deref(), Some("fresh"));
    assert_eq!(snapshot.status, ScanStatus::Processing);
}

#[tokio::test]
async fn test_analyzer_failure_tears_down_scan() {
    let (store, coordinator) = spawn_coordinator();
    let mut events = coordinator.events();

    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();
    expect_event(&mut events, EventKind::Submitted).await;

    store.update(id, &ScanPatch::text("partial")).await.unwrap();
    expect_event(&mut events, EventKind::Progressed).await;

    store
        .update(id, &ScanPatch::status(ScanStatus::Failed))
        .await
        .unwrap();
    let failed = expect_event(&mut events, EventKind::Failed).await;
    assert_eq!(failed.status, ScanStatus::Failed);
    assert_eq!(failed.text_result.as_deref(), Some("partial"));

    let released = expect_event(&mut events, EventKind::Released).await;
    assert_eq!(released.status, ScanStatus::Failed);

    assert!(coordinator.snapshot().is_none());
    assert_eq!(store.record_count(), 0);
    assert_eq!(store.subscription_count(), 0);
}

#[tokio::test]
async fn test_completed_scan_stays_until_abandoned() {
    let (store, coordinator) = spawn_coordinator();
    let mut events = coordinator.events();

    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();
    expect_event(&mut events, EventKind::Submitted).await;

    let all = ScanPatch {
        text_result: Some("X".to_string()),
        classification_result: Some("Y".to_string()),
        face_result: Some("Z".to_string()),
        ..ScanPatch::default()
    };
    store.update(id, &all).await.unwrap();
    expect_event(&mut events, EventKind::Completed).await;
    wait_until(|| store.record(id).map(|r| r.status) == Some(ScanStatus::Completed)).await;

    // A late failure signal cannot undo completion
    store
        .update(id, &ScanPatch::status(ScanStatus::Failed))
        .await
        .unwrap();
    assert_no_event(&mut events).await;
    assert_eq!(coordinator.snapshot().unwrap().status, ScanStatus::Completed);

    assert_ok!(coordinator.abandon().await);
    expect_event(&mut events, EventKind::Released).await;
    assert!(store.record(id).is_none());
}

#[tokio::test]
async fn test_store_unavailable_on_submit_leaves_no_job() {
    let (store, coordinator) = spawn_coordinator();
    store.set_available(false);

    let err = assert_err!(coordinator.submit(&png_bytes(16, 16)).await);
    assert!(matches!(err, CoordinatorError::Store(StoreError::Unavailable(_))));
    assert!(coordinator.snapshot().is_none());
    assert_eq!(store.record_count(), 0);

    // No automatic retry; the caller retries once the store is back
    store.set_available(true);
    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();
    assert_eq!(store.record_count(), 1);
    assert_eq!(coordinator.snapshot().unwrap().scan_id, id);
}

#[tokio::test]
async fn test_failed_abandon_blocks_resubmit() {
    let (store, coordinator) = spawn_coordinator();
    let first = coordinator.submit(&png_bytes(16, 16)).await.unwrap();

    store.set_available(false);
    let err = assert_err!(coordinator.submit(&png_bytes(16, 16)).await);
    assert!(matches!(err, CoordinatorError::Store(StoreError::Unavailable(_))));

    // The original scan is still the active one
    assert_eq!(coordinator.snapshot().unwrap().scan_id, first);
    assert_eq!(store.subscription_count(), 1);

    store.set_available(true);
    assert_ok!(coordinator.abandon().await);
    assert_eq!(store.record_count(), 0);
}

#[tokio::test]
async fn test_record_already_deleted_is_not_an_error() {
    let (store, coordinator) = spawn_coordinator();
    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();

    store.delete(id).await.unwrap();
    assert_ok!(coordinator.abandon().await);
    assert!(coordinator.snapshot().is_none());
    assert_eq!(store.subscription_count(), 0);
}

#[tokio::test]
async fn test_undecodable_image_creates_nothing() {
    let preprocessor = ImagePreprocessor::new(64, 1600, 80);
    let (store, coordinator) = spawn_coordinator_with(preprocessor);

    let err = assert_err!(coordinator.submit(&[0x13u8; 512]).await);
    assert!(matches!(
        err,
        CoordinatorError::Preprocess(PreprocessError::Decode(_))
    ));
    assert!(store.calls().is_empty());
    assert!(coordinator.snapshot().is_none());
}

#[tokio::test]
async fn test_oversized_image_is_downscaled_before_upload() {
    let preprocessor = ImagePreprocessor::new(1_000, 100, 80);
    let (store, coordinator) = spawn_coordinator_with(preprocessor);

    let id = coordinator.submit(&bmp_bytes(400, 300)).await.unwrap();
    let record = store.record(id).unwrap();

    assert_eq!(
        image::guess_format(&record.image_data).unwrap(),
        image::ImageFormat::Jpeg
    );
    assert_eq!(dimensions(&record.image_data), (100, 75));
}

#[tokio::test]
async fn test_shutdown_releases_scan_and_stops() {
    let (store, coordinator) = spawn_coordinator();
    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();

    assert_ok!(coordinator.shutdown().await);
    assert!(store.record(id).is_none());
    assert_eq!(store.subscription_count(), 0);

    let err = assert_err!(coordinator.submit(&png_bytes(16, 16)).await);
    assert!(matches!(err, CoordinatorError::Stopped));
}

#[tokio::test]
async fn test_dropping_last_handle_releases_scan() {
    let (store, coordinator) = spawn_coordinator();
    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();

    drop(coordinator);
    wait_until(|| store.record(id).is_none()).await;
    assert_eq!(store.subscription_count(), 0);
}

#[tokio::test]
async fn test_stopped_resolves_after_shutdown() {
    let (_store, coordinator) = spawn_coordinator();
    let watcher = coordinator.clone();
    let stopped = tokio::spawn(async move { watcher.stopped().await });

    assert_ok!(coordinator.shutdown().await);
    assert_ok!(tokio::time::timeout(std::time::Duration::from_secs(5), stopped).await);
}

#[tokio::test]
async fn test_shutdown_with_store_offline_can_be_retried() {
    let (store, coordinator) = spawn_coordinator();
    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();

    store.set_available(false);
    let err = assert_err!(coordinator.shutdown().await);
    assert!(matches!(err, CoordinatorError::Store(StoreError::Unavailable(_))));

    // Still running, still holding the scan
    assert_eq!(coordinator.snapshot().unwrap().scan_id, id);
    assert_eq!(store.subscription_count(), 1);

    store.set_available(true);
    assert_ok!(coordinator.shutdown().await);
    assert!(store.record(id).is_none());
    assert_eq!(store.subscription_count(), 0);

    let err = assert_err!(coordinator.abandon().await);
    assert!(matches!(err, CoordinatorError::Stopped));
}

#[tokio::test]
async fn test_dropping_last_handle_with_store_offline_closes_subscription() {
    let (store, coordinator) = spawn_coordinator();
    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();

    store.set_available(false);
    drop(coordinator);

    wait_until(|| store.subscription_count() == 0).await;
    assert!(store.record(id).is_some());
}

#[tokio::test]
async fn test_stop_exits_even_when_record_cannot_be_deleted() {
    let (store, coordinator) = spawn_coordinator();
    let id = coordinator.submit(&png_bytes(16, 16)).await.unwrap();

    store.set_available(false);
    let err = assert_err!(coordinator.stop().await);
    assert!(matches!(err, CoordinatorError::Store(StoreError::Unavailable(_))));

    assert_eq!(store.subscription_count(), 0);
    assert!(store.record(id).is_some());
    assert!(coordinator.snapshot().is_none());
    assert_ok!(tokio::time::timeout(std::time::Duration::from_secs(5), coordinator.stopped()).await);
}
