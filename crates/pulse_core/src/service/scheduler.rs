//! Durable timer scheduling for notification records.
//!
//! # Responsibility
//! - Persist records before arming timers for them.
//! - Re-arm every pending record from storage after a restart.
//! - Sleep long delays in chunks no larger than the platform timer limit.
//!
//! # Invariants
//! - At most one armed timer per record id inside one scheduler.
//! - A timer that has started dispatching is no longer abortable; cancel
//!   races are settled in the store, where a cancel beats any presentation
//!   that has not been confirmed yet.
//! - A caller-supplied id never silently reschedules a pending record with
//!   different content; only derived records are replaced in place.
//! - A record whose due time has passed is dispatched immediately, never
//!   dropped.

use crate::config::SchedulerConfig;
use crate::model::notification::{NotificationStatus, ScheduledNotification};
use crate::platform::Clock;
use crate::repo::{
    retry_storage, PendingPolicy, PersistentStore, StatusChange, StorageRetryPolicy,
    TransitionOutcome, UpsertOutcome,
};
use crate::service::dispatcher::{DispatchOutcome, NotificationDispatcher};
use crate::service::{EngineError, EngineResult};
use log::{error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Result of `schedule`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub id: String,
    pub upsert: UpsertOutcome,
    /// Set when the record was already due and dispatched inline.
    pub dispatched: Option<DispatchOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// The record already left `Scheduled`; `Shown` means cancel lost the race.
    AlreadyTerminal(NotificationStatus),
    NotFound,
}

/// Summary of a `reconcile` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Overdue records dispatched during the pass, in due order.
    pub dispatched: Vec<(String, DispatchOutcome)>,
    /// Records armed for a future due time.
    pub armed: usize,
}

struct ArmedTimer {
    generation: u64,
    handle: AbortHandle,
}

struct SchedulerInner {
    store: Arc<dyn PersistentStore>,
    dispatcher: Arc<NotificationDispatcher>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    storage_retry: StorageRetryPolicy,
    timers: Mutex<HashMap<String, ArmedTimer>>,
    present_failures: Mutex<HashMap<String, u32>>,
    next_generation: AtomicU64,
}

/// Arms tokio timers for persisted notification records.
///
/// Cloning is cheap; clones share the same timer table.
#[derive(Clone)]
pub struct TimerScheduler {
    inner: Arc<SchedulerInner>,
}

impl TimerScheduler {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        dispatcher: Arc<NotificationDispatcher>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
        storage_retry: StorageRetryPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                store,
                dispatcher,
                clock,
                config,
                storage_retry,
                timers: Mutex::new(HashMap::new()),
                present_failures: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Persists `record` and arms (or immediately dispatches) it.
    ///
    /// Scheduling the same request twice is a no-op.
    ///
    /// # Errors
    /// - `Validation` before anything is written.
    /// - `Conflict` when the id is already pending with different content.
    /// - `Storage` when the write fails after retries; no timer is armed.
    pub async fn schedule(&self, record: ScheduledNotification) -> EngineResult<ScheduleOutcome> {
        self.schedule_with(record, PendingPolicy::Keep).await
    }

    /// Like `schedule`, but a pending record with the same id is replaced.
    /// Used for records derived from external sources, such as calendar
    /// reminders whose event moved.
    pub(crate) async fn schedule_replacing(
        &self,
        record: ScheduledNotification,
    ) -> EngineResult<ScheduleOutcome> {
        self.schedule_with(record, PendingPolicy::Replace).await
    }

    async fn schedule_with(
        &self,
        record: ScheduledNotification,
        policy: PendingPolicy,
    ) -> EngineResult<ScheduleOutcome> {
        record.validate()?;
        let inner = &self.inner;
        let upsert = retry_storage(&inner.storage_retry, "upsert_scheduled", || {
            inner.store.upsert_scheduled(&record, policy)
        })
        .await?;
        info!(
            "event=notification_schedule module=scheduler status={:?} id={} due_at={}",
            upsert, record.id, record.due_at
        );

        let dispatched = match upsert {
            UpsertOutcome::Conflict => return Err(EngineError::Conflict { id: record.id }),
            UpsertOutcome::Terminal(_) => None,
            UpsertOutcome::Unchanged if inner.is_armed(&record.id) => None,
            UpsertOutcome::Inserted | UpsertOutcome::Replaced | UpsertOutcome::Unchanged => {
                inner.clear_present_failures(&record.id);
                if record.due_at <= inner.clock.now_ms() {
                    inner.disarm(&record.id);
                    inner.dispatch(&record.id).await?
                } else {
                    SchedulerInner::arm_at(inner, &record.id, record.due_at);
                    None
                }
            }
        };
        Ok(ScheduleOutcome {
            id: record.id,
            upsert,
            dispatched,
        })
    }

    /// Re-arms every `Scheduled` record from storage.
    ///
    /// Overdue records are dispatched in due order before this returns.
    /// Safe to call repeatedly: re-arming replaces an existing timer.
    pub async fn reconcile(&self) -> EngineResult<ReconcileReport> {
        let inner = &self.inner;
        let pending = retry_storage(&inner.storage_retry, "list_scheduled_by_due", || {
            inner.store.list_scheduled_by_due()
        })
        .await?;

        let mut report = ReconcileReport::default();
        for record in pending {
            if record.due_at <= inner.clock.now_ms() {
                inner.disarm(&record.id);
                if let Some(outcome) = inner.dispatch(&record.id).await? {
                    report.dispatched.push((record.id, outcome));
                }
            } else {
                SchedulerInner::arm_at(inner, &record.id, record.due_at);
                report.armed += 1;
            }
        }
        info!(
            "event=scheduler_reconcile module=scheduler status=ok dispatched={} armed={}",
            report.dispatched.len(),
            report.armed
        );
        Ok(report)
    }

    /// Cancels a pending record and disarms its timer.
    pub async fn cancel(&self, id: &str) -> EngineResult<CancelOutcome> {
        let inner = &self.inner;
        inner.disarm(id);
        inner.clear_present_failures(id);
        let change = StatusChange::Cancel {
            at: inner.clock.now_ms(),
        };
        let result = retry_storage(&inner.storage_retry, "cancel_notification", || {
            inner.store.transition(id, &change)
        })
        .await?;
        let outcome = match result {
            TransitionOutcome::Applied => CancelOutcome::Cancelled,
            TransitionOutcome::Rejected { current: Some(status) } => {
                CancelOutcome::AlreadyTerminal(status)
            }
            TransitionOutcome::Rejected { current: None } => CancelOutcome::NotFound,
        };
        info!(
            "event=notification_cancel module=scheduler status={:?} id={}",
            outcome, id
        );
        Ok(outcome)
    }

    /// Pending records in due order.
    pub async fn list_pending(&self) -> EngineResult<Vec<ScheduledNotification>> {
        let inner = &self.inner;
        let pending = retry_storage(&inner.storage_retry, "list_scheduled_by_due", || {
            inner.store.list_scheduled_by_due()
        })
        .await?;
        Ok(pending)
    }

    pub fn armed_count(&self) -> usize {
        self.inner.lock_timers().len()
    }

    pub fn is_armed(&self, id: &str) -> bool {
        self.inner.is_armed(id)
    }

    /// Aborts every armed timer. Persisted records are untouched.
    pub fn shutdown(&self) {
        let mut timers = self.inner.lock_timers();
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        info!("event=scheduler_shutdown module=scheduler status=ok");
    }
}

impl SchedulerInner {
    fn lock_timers(&self) -> MutexGuard<'_, HashMap<String, ArmedTimer>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_armed(&self, id: &str) -> bool {
        self.lock_timers().contains_key(id)
    }

    fn disarm(&self, id: &str) {
        if let Some(timer) = self.lock_timers().remove(id) {
            timer.handle.abort();
        }
    }

    fn clear_present_failures(&self, id: &str) {
        self.present_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn bump_present_failures(&self, id: &str) -> u32 {
        let mut failures = self
            .present_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Arms a timer firing at `fire_at`, replacing any timer for `id`.
    fn arm_at(this: &Arc<Self>, id: &str, fire_at: i64) {
        let generation = this.next_generation.fetch_add(1, Ordering::Relaxed);
        let task_inner = Arc::clone(this);
        let task_id = id.to_string();
        // Holding the table lock while spawning keeps the new handle from
        // being observed before it is registered.
        let mut timers = this.lock_timers();
        let handle = tokio::spawn(async move {
            task_inner.sleep_until(fire_at).await;
            task_inner.on_timer_fired(&task_id, generation).await;
        })
        .abort_handle();
        if let Some(previous) = timers.insert(id.to_string(), ArmedTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    async fn sleep_until(&self, fire_at: i64) {
        loop {
            let now = self.clock.now_ms();
            if now >= fire_at {
                return;
            }
            let remaining = u64::try_from(fire_at - now).unwrap_or(u64::MAX);
            let chunk = remaining.min(self.config.max_timer_delay_ms.max(1));
            tokio::time::sleep(Duration::from_millis(chunk)).await;
        }
    }

    async fn on_timer_fired(self: &Arc<Self>, id: &str, generation: u64) {
        {
            let mut timers = self.lock_timers();
            match timers.get(id) {
                Some(timer) if timer.generation == generation => {
                    timers.remove(id);
                }
                _ => return,
            }
        }
        if let Err(err) = self.dispatch(id).await {
            error!(
                "event=timer_fire module=scheduler status=error id={} error={}",
                id, err
            );
        }
    }

    /// Dispatches `id` and applies the retry policy for transient failures.
    async fn dispatch(self: &Arc<Self>, id: &str) -> EngineResult<Option<DispatchOutcome>> {
        let outcome = self.dispatcher.fire(id).await?;
        match &outcome {
            DispatchOutcome::Deferred { error } => {
                let failures = self.bump_present_failures(id);
                if failures < self.config.max_present_attempts {
                    let delay = i64::try_from(self.config.present_retry_delay_ms).unwrap_or(i64::MAX);
                    let retry_at = self.clock.now_ms().saturating_add(delay);
                    warn!(
                        "event=notification_retry module=scheduler status=rearmed id={} attempt={} retry_at={}",
                        id, failures, retry_at
                    );
                    Self::arm_at(self, id, retry_at);
                } else {
                    self.clear_present_failures(id);
                    let change = StatusChange::Fail {
                        at: self.clock.now_ms(),
                        reason: format!("{error} (after {failures} attempts)"),
                    };
                    let failed = retry_storage(&self.storage_retry, "fail_notification", || {
                        self.store.transition(id, &change)
                    })
                    .await?;
                    warn!(
                        "event=notification_retry module=scheduler status=exhausted id={} applied={}",
                        id,
                        failed.is_applied()
                    );
                }
            }
            DispatchOutcome::Busy { claimed_until } => {
                // Another dispatcher is presenting; look again once its lease lapses.
                Self::arm_at(self, id, *claimed_until);
            }
            DispatchOutcome::Blocked { .. } => {}
            DispatchOutcome::Shown { .. }
            | DispatchOutcome::Skipped { .. }
            | DispatchOutcome::Failed { .. } => self.clear_present_failures(id),
        }
        Ok(Some(outcome))
    }
}
