mod common;

use common::{memory_store, start_engine, start_engine_with, test_clock, FakeTransport, T0};
use pulse_core::repo::{OfflineTaskRepository, StorageRetryPolicy};
use pulse_core::service::sync::SyncQueueProcessor;
use pulse_core::{
    Clock, CoreConfig, EngineError, NetworkError, PersistentStore, SyncRetryPolicy, SyncSignal,
    SyncTrigger, TaskIndex, TaskKind, TaskPayload, ValidationError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn todo(title: &str) -> TaskPayload {
    TaskPayload::Todo {
        todo_id: format!("todo-{title}"),
        title: title.to_string(),
        completed: false,
    }
}

fn short_backoff() -> CoreConfig {
    CoreConfig {
        sync: SyncRetryPolicy {
            base_backoff_ms: 1_000,
            max_backoff_ms: 1_500,
            max_retries: 3,
            periodic_interval_ms: None,
            ..SyncRetryPolicy::default()
        },
        ..CoreConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn processes_by_priority_then_fifo() {
    let h = start_engine(memory_store(), test_clock()).await;
    let low = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("low"), 1)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let high_first = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("high-1"), 5)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mid = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("mid"), 3)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    let high_second = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("high-2"), 5)
        .await
        .unwrap();

    let report = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();

    assert_eq!(report.synced, 4);
    assert_eq!(
        h.transport.submitted(),
        vec![high_first.id, high_second.id, mid.id, low.id.clone()]
    );
    let low = h.engine.get_task(&low.id).await.unwrap().unwrap();
    assert!(low.synced);
    assert_eq!(low.synced_at, Some(T0 + 30));
    assert_eq!(h.store.count_queue_items().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_submit_each_task_once() {
    let h = start_engine(memory_store(), test_clock()).await;
    h.transport.set_delay(Duration::from_millis(50));
    let mut ids = Vec::new();
    for n in 0..5 {
        let task = h
            .engine
            .enqueue_offline_task(TaskKind::Todo, todo(&format!("t{n}")), 1)
            .await
            .unwrap();
        ids.push(task.id);
    }

    let (first, second) = tokio::join!(
        h.engine.process_sync(SyncTrigger::ConnectivityRestored),
        h.engine.process_sync(SyncTrigger::PeriodicWake),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.synced + second.synced, 5);
    for id in &ids {
        assert_eq!(h.transport.submitted_count(id), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn separate_processors_share_work_through_claims() {
    let store = memory_store();
    let clock = test_clock();
    let transport = Arc::new(FakeTransport::default());
    transport.set_delay(Duration::from_millis(50));
    let processor = || {
        SyncQueueProcessor::new(
            Arc::clone(&store) as Arc<dyn PersistentStore>,
            Arc::clone(&transport) as Arc<dyn pulse_core::SyncTransport>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            SyncRetryPolicy::default(),
            StorageRetryPolicy::default(),
        )
    };
    let (left, right) = (processor(), processor());
    let mut ids = Vec::new();
    for n in 0..4 {
        let task = left
            .enqueue(TaskKind::Todo, todo(&format!("shared-{n}")), 2)
            .await
            .unwrap();
        ids.push(task.id);
    }

    let (a, b) = tokio::join!(
        left.process(SyncTrigger::Manual),
        right.process(SyncTrigger::Manual)
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.synced + b.synced, 4);
    assert!(a.claimed_elsewhere + b.claimed_elsewhere + a.skipped + b.skipped > 0);
    for id in &ids {
        assert_eq!(transport.submitted_count(id), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_then_fail_permanently() {
    let h = start_engine_with(memory_store(), test_clock(), short_backoff()).await;
    h.transport.fail_always(Some(NetworkError::Status(503)));
    let task = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("flaky"), 2)
        .await
        .unwrap();

    let first = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(first.failed, 1);
    let item = h.store.get_queue_item(&task.id).unwrap().unwrap();
    assert_eq!(item.retry_count, 1);
    assert_eq!(item.next_attempt_at, T0 + 1_000);
    assert_eq!(first.next_attempt_at, Some(T0 + 1_000));

    let gated = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(gated.attempted, 0);

    tokio::time::sleep(Duration::from_millis(1_000)).await;
    let second = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(second.failed, 1);
    let item = h.store.get_queue_item(&task.id).unwrap().unwrap();
    assert_eq!(item.next_attempt_at, T0 + 1_000 + 1_500);

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let third = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(third.permanently_failed, 1);

    let stored = h.engine.get_task(&task.id).await.unwrap().unwrap();
    assert!(stored.permanently_failed);
    assert!(!stored.synced);
    assert_eq!(stored.retry_count, 3);
    assert_eq!(stored.last_error.as_deref(), Some("sync endpoint returned status 503"));
    assert!(h.store.get_queue_item(&task.id).unwrap().is_none());
    assert_eq!(h.transport.submitted_count(&task.id), 3);

    tokio::time::sleep(Duration::from_secs(60)).await;
    let idle = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();
    assert_eq!(idle.attempted, 0);
    assert_eq!(
        h.engine
            .list_tasks(TaskIndex::PermanentlyFailed)
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn retry_failed_gives_a_fresh_round() {
    let h = start_engine_with(memory_store(), test_clock(), short_backoff()).await;
    h.transport
        .script(std::iter::repeat(Err(NetworkError::Timeout)).take(3));
    let task = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("again"), 1)
        .await
        .unwrap();
    for _ in 0..3 {
        h.engine.process_sync(SyncTrigger::Manual).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
    }
    assert!(h.engine.get_task(&task.id).await.unwrap().unwrap().permanently_failed);

    assert!(h.engine.retry_task(&task.id).await.unwrap());
    let report = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();

    assert_eq!(report.synced, 1);
    let stored = h.engine.get_task(&task.id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert!(!stored.permanently_failed);
    assert_eq!(stored.retry_count, 3);
    assert!(!h.engine.retry_task(&task.id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn offline_error_stops_the_pass() {
    let h = start_engine(memory_store(), test_clock()).await;
    h.transport.script([Err(NetworkError::Offline)]);
    for n in 0..3 {
        h.engine
            .enqueue_offline_task(TaskKind::Todo, todo(&format!("o{n}")), 1)
            .await
            .unwrap();
    }

    let report = h.engine.process_sync(SyncTrigger::Manual).await.unwrap();

    assert_eq!(report.attempted, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(h.store.count_queue_items().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn invalid_tasks_are_rejected_before_persisting() {
    let h = start_engine(memory_store(), test_clock()).await;

    let zero = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("zero"), 0)
        .await
        .unwrap_err();
    assert!(matches!(
        zero,
        EngineError::Validation(ValidationError::NonPositivePriority(0))
    ));

    let mismatch = h
        .engine
        .enqueue_offline_task(TaskKind::Journal, todo("wrong"), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        mismatch,
        EngineError::Validation(ValidationError::KindMismatch { .. })
    ));
    assert!(h
        .engine
        .list_tasks(TaskIndex::Synced(false))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test(start_paused = true)]
async fn abandon_removes_task_and_queue_entry() {
    let h = start_engine(memory_store(), test_clock()).await;
    let task = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("drop"), 1)
        .await
        .unwrap();

    assert!(h.engine.abandon_task(&task.id).await.unwrap());
    assert!(h.engine.get_task(&task.id).await.unwrap().is_none());
    assert_eq!(h.store.count_queue_items().unwrap(), 0);
    assert!(!h.engine.abandon_task(&task.id).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn task_abandoned_during_failed_submission_is_skipped() {
    let h = start_engine(memory_store(), test_clock()).await;
    h.transport.set_delay(Duration::from_millis(50));
    h.transport.script([Err(NetworkError::Timeout)]);
    let doomed = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("doomed"), 5)
        .await
        .unwrap();
    let kept = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("kept"), 1)
        .await
        .unwrap();

    let (report, abandoned) = tokio::join!(h.engine.process_sync(SyncTrigger::Manual), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.engine.abandon_task(&doomed.id).await
    });
    let report = report.unwrap();

    assert!(abandoned.unwrap());
    assert_eq!(report.attempted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.synced, 1);
    assert!(h.engine.get_task(&doomed.id).await.unwrap().is_none());
    assert!(h.engine.get_task(&kept.id).await.unwrap().unwrap().synced);
    assert_eq!(h.store.count_queue_items().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn worker_reacts_to_connectivity_and_backoff() {
    let h = start_engine_with(memory_store(), test_clock(), short_backoff()).await;
    h.transport.script([Err(NetworkError::Timeout)]);
    let task = h
        .engine
        .enqueue_offline_task(TaskKind::Todo, todo("bg"), 1)
        .await
        .unwrap();

    let (signals, receiver) = mpsc::channel(8);
    h.engine.spawn_sync_worker(receiver);
    signals.send(SyncSignal::Offline).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.transport.submitted().is_empty());

    signals.send(SyncSignal::Online).await.unwrap();
    let mut synced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if h.engine.get_task(&task.id).await.unwrap().unwrap().synced {
            synced = true;
            break;
        }
    }

    assert!(synced);
    assert_eq!(h.transport.submitted_count(&task.id), 2);
    h.engine.shutdown();
}
