//! Offline task queue replay.
//!
//! # Responsibility
//! - Persist offline mutations with their queue entry.
//! - Replay due entries in priority order with bounded exponential backoff.
//! - Drive processing from connectivity and periodic wake signals.
//!
//! # Invariants
//! - Processing order is priority descending, then enqueue time ascending.
//! - A task is submitted only while its queue entry is claimed by this runner;
//!   overlapping runs, here or in another process, cannot submit it twice.
//! - `synced` is set only after the transport reports success.
//! - A task that exhausts its retries is kept and marked permanently failed.

use crate::config::SyncRetryPolicy;
use crate::model::offline_task::{OfflineTask, SyncQueueItem, TaskKind, TaskPayload};
use crate::model::validation::ValidationError;
use crate::platform::{Clock, NetworkError, SyncTransport};
use crate::repo::{
    backoff_delay_ms, retry_storage, PersistentStore, StorageRetryPolicy, StoreError, TaskIndex,
};
use crate::service::{EngineError, EngineResult};
use log::{error, info, warn};
use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Why a processing pass started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    ConnectivityRestored,
    PeriodicWake,
    /// A backed-off entry became due.
    RetryDue,
    Manual,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectivityRestored => "connectivity_restored",
            Self::PeriodicWake => "periodic_wake",
            Self::RetryDue => "retry_due",
            Self::Manual => "manual",
        }
    }
}

/// Host signals consumed by the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSignal {
    Online,
    Offline,
    PeriodicWake,
}

/// Counters for one processing pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub trigger: SyncTrigger,
    pub attempted: usize,
    pub synced: usize,
    /// Failed and rescheduled with backoff.
    pub failed: usize,
    pub permanently_failed: usize,
    /// Entries dropped because the task was already synced or gone.
    pub skipped: usize,
    /// Entries leased by another runner.
    pub claimed_elsewhere: usize,
    /// Earliest backoff gate still queued after the pass.
    pub next_attempt_at: Option<i64>,
}

impl SyncReport {
    fn new(trigger: SyncTrigger) -> Self {
        Self {
            trigger,
            attempted: 0,
            synced: 0,
            failed: 0,
            permanently_failed: 0,
            skipped: 0,
            claimed_elsewhere: 0,
            next_attempt_at: None,
        }
    }
}

struct SyncInner {
    store: Arc<dyn PersistentStore>,
    transport: Arc<dyn SyncTransport>,
    clock: Arc<dyn Clock>,
    policy: SyncRetryPolicy,
    storage_retry: StorageRetryPolicy,
    run_lock: Mutex<()>,
    online: AtomicBool,
}

/// Durable offline task queue. Clones share one run lock.
#[derive(Clone)]
pub struct SyncQueueProcessor {
    inner: Arc<SyncInner>,
}

impl SyncQueueProcessor {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
        policy: SyncRetryPolicy,
        storage_retry: StorageRetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(SyncInner {
                store,
                transport,
                clock,
                policy,
                storage_retry,
                run_lock: Mutex::new(()),
                online: AtomicBool::new(true),
            }),
        }
    }

    /// Persists a task and its queue entry.
    ///
    /// # Errors
    /// - `Validation` when `kind` disagrees with `payload` or `priority <= 0`.
    pub async fn enqueue(
        &self,
        kind: TaskKind,
        payload: TaskPayload,
        priority: i32,
    ) -> EngineResult<OfflineTask> {
        if kind != payload.kind() {
            return Err(ValidationError::KindMismatch {
                declared: kind.as_str().to_string(),
                payload: payload.kind().as_str().to_string(),
            }
            .into());
        }
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let task = OfflineTask::new(payload, priority, now);
        task.validate()?;
        let item = SyncQueueItem::for_task(&task, now);
        retry_storage(&inner.storage_retry, "insert_task", || {
            inner.store.insert_task(&task, &item)
        })
        .await?;
        info!(
            "event=sync_enqueue module=sync status=ok task_id={} kind={} priority={}",
            task.id,
            task.kind.as_str(),
            task.priority
        );
        Ok(task)
    }

    /// Runs one processing pass over due queue entries.
    ///
    /// Passes are serialized; a pass started while another runs waits and
    /// then sees only what is still queued.
    pub async fn process(&self, trigger: SyncTrigger) -> EngineResult<SyncReport> {
        let inner = &self.inner;
        let _run = inner.run_lock.lock().await;
        let mut report = SyncReport::new(trigger);
        let now = inner.clock.now_ms();
        let items = retry_storage(&inner.storage_retry, "list_due_queue_items", || {
            inner
                .store
                .list_due_queue_items(now, inner.policy.batch_size)
        })
        .await?;

        for item in items {
            match inner.process_item(&item, &mut report).await? {
                ItemResult::Continue => {}
                ItemResult::NetworkDown => break,
            }
        }

        report.next_attempt_at = retry_storage(&inner.storage_retry, "earliest_next_attempt", || {
            inner.store.earliest_next_attempt()
        })
        .await?;
        info!(
            "event=sync_process module=sync status=ok trigger={} attempted={} synced={} failed={} permanently_failed={} skipped={} claimed_elsewhere={}",
            trigger.as_str(),
            report.attempted,
            report.synced,
            report.failed,
            report.permanently_failed,
            report.skipped,
            report.claimed_elsewhere
        );
        Ok(report)
    }

    /// Re-queues a permanently failed (or stuck) task with a fresh retry round.
    pub async fn retry_failed(&self, task_id: &str) -> EngineResult<bool> {
        let inner = &self.inner;
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(task_id.to_string()))?;
        let item = SyncQueueItem::for_task(&task, inner.clock.now_ms());
        let requeued = retry_storage(&inner.storage_retry, "requeue_task", || {
            inner.store.requeue_task(task_id, &item)
        })
        .await?;
        info!(
            "event=sync_requeue module=sync status={} task_id={}",
            if requeued { "ok" } else { "ignored" },
            task_id
        );
        Ok(requeued)
    }

    /// Deletes a task and its queue entry.
    pub async fn abandon(&self, task_id: &str) -> EngineResult<bool> {
        let inner = &self.inner;
        let removed = retry_storage(&inner.storage_retry, "delete_task", || {
            inner.store.delete_task(task_id)
        })
        .await?;
        info!(
            "event=sync_abandon module=sync status={} task_id={}",
            if removed { "ok" } else { "not_found" },
            task_id
        );
        Ok(removed)
    }

    pub async fn get_task(&self, task_id: &str) -> EngineResult<Option<OfflineTask>> {
        let inner = &self.inner;
        let task = retry_storage(&inner.storage_retry, "get_task", || {
            inner.store.get_task(task_id)
        })
        .await?;
        Ok(task)
    }

    pub async fn list_tasks(&self, index: TaskIndex) -> EngineResult<Vec<OfflineTask>> {
        let inner = &self.inner;
        let tasks = retry_storage(&inner.storage_retry, "query_tasks", || {
            inner.store.query_tasks(index)
        })
        .await?;
        Ok(tasks)
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// Spawns the background loop reacting to `signals`.
    ///
    /// Triggers a pass on `Online`, on periodic wakes while online, and when
    /// the earliest backoff gate elapses. Ends when `signals` closes.
    pub fn spawn_worker(&self, mut signals: mpsc::Receiver<SyncSignal>) -> JoinHandle<()> {
        let processor = self.clone();
        let period = processor
            .inner
            .policy
            .periodic_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        tokio::spawn(async move {
            let mut ticker = period.map(|period| {
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            let mut retry_at: Option<Instant> = None;
            info!("event=sync_worker module=sync status=start");
            loop {
                let trigger = tokio::select! {
                    signal = signals.recv() => match signal {
                        None => break,
                        Some(SyncSignal::Online) => {
                            processor.inner.online.store(true, Ordering::SeqCst);
                            Some(SyncTrigger::ConnectivityRestored)
                        }
                        Some(SyncSignal::Offline) => {
                            processor.inner.online.store(false, Ordering::SeqCst);
                            retry_at = None;
                            None
                        }
                        Some(SyncSignal::PeriodicWake) => Some(SyncTrigger::PeriodicWake),
                    },
                    _ = next_tick(&mut ticker) => Some(SyncTrigger::PeriodicWake),
                    _ = sleep_until_retry(retry_at) => {
                        retry_at = None;
                        Some(SyncTrigger::RetryDue)
                    }
                };
                let Some(trigger) = trigger else { continue };
                if !processor.is_online() {
                    continue;
                }
                match processor.process(trigger).await {
                    Ok(report) => {
                        retry_at = report
                            .next_attempt_at
                            .and_then(|at| processor.retry_instant(at, report.attempted > 0));
                    }
                    Err(err) => error!(
                        "event=sync_worker module=sync status=error trigger={} error={}",
                        trigger.as_str(),
                        err
                    ),
                }
            }
            info!("event=sync_worker module=sync status=stop");
        })
    }

    /// Maps a backoff gate to a wake instant. A gate that is already open only
    /// re-triggers when the last pass made progress, so leased entries do
    /// not spin the loop.
    fn retry_instant(&self, epoch_ms: i64, progressed: bool) -> Option<Instant> {
        let wait = epoch_ms.saturating_sub(self.inner.clock.now_ms());
        if wait <= 0 && !progressed {
            return None;
        }
        let wait = u64::try_from(wait.max(0)).unwrap_or(0);
        Some(Instant::now() + Duration::from_millis(wait))
    }
}

enum ItemResult {
    Continue,
    /// The transport reported no connectivity; stop the pass.
    NetworkDown,
}

impl SyncInner {
    async fn process_item(
        &self,
        item: &SyncQueueItem,
        report: &mut SyncReport,
    ) -> EngineResult<ItemResult> {
        let task = retry_storage(&self.storage_retry, "get_task", || {
            self.store.get_task(&item.task_id)
        })
        .await?;
        let task = match task {
            Some(task) if task.is_retryable() => task,
            _ => {
                retry_storage(&self.storage_retry, "delete_queue_item", || {
                    self.store.delete_queue_item(&item.id)
                })
                .await?;
                report.skipped += 1;
                return Ok(ItemResult::Continue);
            }
        };

        let now = self.clock.now_ms();
        let lease_until = now.saturating_add(self.policy.claim_lease_ms);
        let claimed = retry_storage(&self.storage_retry, "claim_queue_item", || {
            self.store.claim_queue_item(&item.id, now, lease_until)
        })
        .await?;
        if !claimed {
            report.claimed_elsewhere += 1;
            return Ok(ItemResult::Continue);
        }

        report.attempted += 1;
        let error = match self.transport.submit(&task).await {
            Ok(()) => {
                let at = self.clock.now_ms();
                let flipped = retry_storage(&self.storage_retry, "mark_task_synced", || {
                    self.store.mark_task_synced(&task.id, at)
                })
                .await?;
                if flipped {
                    report.synced += 1;
                    info!(
                        "event=sync_submit module=sync status=synced task_id={}",
                        task.id
                    );
                } else {
                    report.skipped += 1;
                }
                return Ok(ItemResult::Continue);
            }
            Err(error) => error,
        };

        let at = self.clock.now_ms();
        let attempt = item.retry_count.saturating_add(1);
        let delay = backoff_delay_ms(
            self.policy.base_backoff_ms,
            attempt,
            self.policy.max_backoff_ms,
        );
        let next_attempt_at = at.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX));
        let message = error.to_string();
        let recorded = retry_storage(&self.storage_retry, "record_sync_failure", || {
            self.store
                .record_sync_failure(&item.id, &task.id, at, next_attempt_at, &message)
        })
        .await;
        let counts = match recorded {
            Ok(counts) => counts,
            Err(StoreError::NotFound(_)) => {
                // Abandoned (or synced elsewhere) while the submission was in flight.
                report.skipped += 1;
                info!(
                    "event=sync_submit module=sync status=gone task_id={} error={}",
                    task.id, message
                );
                return Ok(match error {
                    NetworkError::Offline => ItemResult::NetworkDown,
                    _ => ItemResult::Continue,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if counts.item_retry_count >= self.policy.max_retries {
            retry_storage(&self.storage_retry, "mark_permanently_failed", || {
                self.store.mark_permanently_failed(&task.id, at)
            })
            .await?;
            report.permanently_failed += 1;
            warn!(
                "event=sync_submit module=sync status=permanently_failed task_id={} retries={} error={}",
                task.id, counts.item_retry_count, message
            );
        } else {
            report.failed += 1;
            warn!(
                "event=sync_submit module=sync status=retry task_id={} attempt={} next_attempt_at={} error={}",
                task.id, counts.item_retry_count, next_attempt_at, message
            );
        }

        if error == NetworkError::Offline {
            return Ok(ItemResult::NetworkDown);
        }
        Ok(ItemResult::Continue)
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn sleep_until_retry(retry_at: Option<Instant>) {
    match retry_at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => pending::<()>().await,
    }
}
