mod common;

use common::{memory_store, reminder, start_engine, test_clock, T0};
use pulse_core::repo::{NotificationRepository, OfflineTaskRepository, SnapshotRepository};
use pulse_core::{
    EngineError, ExportDocument, ExportEntry, NetworkError, NotificationStatus, SqliteStore,
    SyncTrigger, TaskKind, TaskPayload, TransferError, EXPORT_FORMAT_VERSION,
};
use std::sync::Arc;
use std::time::Duration;

async fn populated() -> common::Harness {
    let h = start_engine(memory_store(), test_clock()).await;
    h.engine
        .schedule_notification(reminder("shown", T0))
        .await
        .unwrap();
    h.engine
        .schedule_notification(reminder("pending", T0 + 60_000))
        .await
        .unwrap();
    h.engine
        .schedule_notification(reminder("cancelled", T0 + 90_000))
        .await
        .unwrap();
    h.engine.cancel_notification("cancelled").await.unwrap();

    h.transport.script([Err(NetworkError::Timeout)]);
    h.engine
        .enqueue_offline_task(
            TaskKind::Journal,
            TaskPayload::Journal {
                entry_id: "j-1".to_string(),
                content: "slept well".to_string(),
                mood: Some("calm".to_string()),
            },
            2,
        )
        .await
        .unwrap();
    h.engine
        .enqueue_offline_task(
            TaskKind::Checkin,
            TaskPayload::Checkin {
                checkin_id: "c-1".to_string(),
                score: Some(7),
                note: None,
            },
            1,
        )
        .await
        .unwrap();
    // The journal entry fails once and keeps its queue item with retry state.
    h.engine.process_sync(SyncTrigger::Manual).await.unwrap();
    h
}

#[tokio::test(start_paused = true)]
async fn export_then_import_reproduces_every_entry() {
    let source = populated().await;
    let exported = source.engine.export().await.unwrap();
    assert_eq!(exported.version, EXPORT_FORMAT_VERSION);
    assert_eq!(exported.timestamp, T0);
    let json = exported.to_json().unwrap();

    let target = start_engine(memory_store(), test_clock()).await;
    let report = target
        .engine
        .import(ExportDocument::from_json(&json).unwrap())
        .await
        .unwrap();
    assert_eq!(report.entries, exported.entries.len());
    assert_eq!(report.reconcile.armed, 1);

    let reexported = target.engine.export().await.unwrap();
    assert_eq!(reexported.entries, exported.entries);
    assert_eq!(
        source.store.snapshot().unwrap(),
        target.store.snapshot().unwrap()
    );
}

#[tokio::test(start_paused = true)]
async fn export_contains_each_record_kind() {
    let h = populated().await;
    let exported = h.engine.export().await.unwrap();

    let count = |pred: fn(&ExportEntry) -> bool| {
        exported.entries.iter().filter(|entry| pred(entry)).count()
    };
    assert_eq!(count(|e| matches!(e, ExportEntry::Notification(_))), 3);
    assert_eq!(count(|e| matches!(e, ExportEntry::OfflineTask(_))), 2);
    // The checkin synced; only the failed journal entry is still queued.
    assert_eq!(count(|e| matches!(e, ExportEntry::SyncQueueItem(_))), 1);
}

#[tokio::test(start_paused = true)]
async fn importing_twice_is_idempotent() {
    let source = populated().await;
    let exported = source.engine.export().await.unwrap();

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let target = start_engine(Arc::clone(&store), test_clock()).await;
    target.engine.import(exported.clone()).await.unwrap();
    target.engine.import(exported).await.unwrap();

    assert_eq!(store.count_notifications().unwrap(), 3);
    assert_eq!(
        store.get_notification("cancelled").unwrap().unwrap().status,
        NotificationStatus::Cancelled
    );
    assert_eq!(target.engine.scheduler().armed_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn stale_backup_never_rolls_back_progress() {
    let mut h = start_engine(memory_store(), test_clock()).await;
    h.engine
        .schedule_notification(reminder("water", T0 + 1_000))
        .await
        .unwrap();
    h.engine
        .schedule_notification(reminder("gone", T0 + 2_000))
        .await
        .unwrap();
    let task = h
        .engine
        .enqueue_offline_task(
            TaskKind::Todo,
            TaskPayload::Todo {
                todo_id: "todo-1".to_string(),
                title: "buy milk".to_string(),
                completed: true,
            },
            1,
        )
        .await
        .unwrap();
    let backup = h.engine.export().await.unwrap();

    assert!(h.next_event().await.outcome.is_shown());
    h.engine.cancel_notification("gone").await.unwrap();
    assert_eq!(h.engine.process_sync(SyncTrigger::Manual).await.unwrap().synced, 1);

    let report = h.engine.import(backup).await.unwrap();

    assert_eq!(report.entries, 0);
    assert_eq!(report.skipped, 4);
    assert!(report.reconcile.dispatched.is_empty());
    assert_eq!(report.reconcile.armed, 0);
    assert!(h.quiet_for(Duration::from_secs(120)).await);
    assert_eq!(h.presenter.shown_count("water"), 1);
    assert_eq!(
        h.store.get_notification("water").unwrap().unwrap().status,
        NotificationStatus::Shown
    );
    assert_eq!(
        h.store.get_notification("gone").unwrap().unwrap().status,
        NotificationStatus::Cancelled
    );
    assert!(h.store.get_task(&task.id).unwrap().unwrap().synced);
    assert_eq!(h.store.count_queue_items().unwrap(), 0);

    let again = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(again.attempted, 0);
    assert_eq!(h.transport.submitted_count(&task.id), 1);
}

#[tokio::test(start_paused = true)]
async fn unsupported_version_is_rejected_without_writing() {
    let target = start_engine(memory_store(), test_clock()).await;
    let document = ExportDocument {
        version: EXPORT_FORMAT_VERSION + 1,
        timestamp: T0,
        entries: Vec::new(),
    };

    let err = target.engine.import(document).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::Transfer(TransferError::UnsupportedVersion(_))
    ));
    assert!(target.store.snapshot().unwrap().is_empty());
}
