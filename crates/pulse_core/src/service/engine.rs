//! Explicit service object wiring the store, scheduler and sync queue.
//!
//! # Responsibility
//! - Own every service instance; hosts hold one `PulseEngine` instead of
//!   reaching for process-wide singletons.
//! - Run startup reconciliation and teardown.
//!
//! # Invariants
//! - `start` returns only after every persisted `Scheduled` record is either
//!   dispatched (overdue) or armed.
//! - Permission failures from inline dispatch are returned as errors; timer
//!   driven ones are published on the dispatch event channel.

use crate::config::CoreConfig;
use crate::model::calendar::CalendarEvent;
use crate::model::notification::{NotificationAction, NotificationRequest, ScheduledNotification};
use crate::model::offline_task::{OfflineTask, TaskKind, TaskPayload};
use crate::platform::{AppNavigator, Clock, NotificationPresenter, SyncTransport};
use crate::repo::{retry_storage, PersistentStore, TaskIndex};
use crate::service::dispatcher::{
    ActionOutcome, DispatchEvent, DispatchOutcome, NotificationDispatcher,
};
use crate::service::planner::{CalendarNotificationPlanner, PlanReport};
use crate::service::scheduler::{CancelOutcome, ReconcileReport, ScheduleOutcome, TimerScheduler};
use crate::service::sync::{SyncQueueProcessor, SyncReport, SyncSignal, SyncTrigger};
use crate::service::{EngineError, EngineResult};
use crate::transfer::ExportDocument;
use log::info;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Host-provided capabilities.
pub struct EngineDeps {
    pub store: Arc<dyn PersistentStore>,
    pub presenter: Arc<dyn NotificationPresenter>,
    pub navigator: Arc<dyn AppNavigator>,
    pub transport: Arc<dyn SyncTransport>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportReport {
    /// Entries written from the document.
    pub entries: usize,
    /// Entries left as stored because the store had already moved past them.
    pub skipped: usize,
    /// Reconcile pass run over the merged store.
    pub reconcile: ReconcileReport,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub notifications: usize,
    pub tasks: usize,
}

pub struct PulseEngine {
    store: Arc<dyn PersistentStore>,
    clock: Arc<dyn Clock>,
    config: CoreConfig,
    dispatcher: Arc<NotificationDispatcher>,
    scheduler: TimerScheduler,
    planner: CalendarNotificationPlanner,
    sync: SyncQueueProcessor,
    dispatch_events: Mutex<Option<mpsc::UnboundedReceiver<DispatchEvent>>>,
    sync_worker: Mutex<Option<JoinHandle<()>>>,
}

impl PulseEngine {
    /// Wires the services and reconciles persisted timers.
    pub async fn start(
        deps: EngineDeps,
        config: CoreConfig,
    ) -> EngineResult<(Self, ReconcileReport)> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(
            NotificationDispatcher::new(
                Arc::clone(&deps.store),
                deps.presenter,
                deps.navigator,
                Arc::clone(&deps.clock),
                config.storage_retry,
                &config.scheduler,
            )
            .with_events(events_tx),
        );
        let scheduler = TimerScheduler::new(
            Arc::clone(&deps.store),
            Arc::clone(&dispatcher),
            Arc::clone(&deps.clock),
            config.scheduler.clone(),
            config.storage_retry,
        );
        let planner = CalendarNotificationPlanner::new(
            scheduler.clone(),
            Arc::clone(&deps.clock),
            config.scheduler.calendar_grace_ms,
        );
        let sync = SyncQueueProcessor::new(
            Arc::clone(&deps.store),
            deps.transport,
            Arc::clone(&deps.clock),
            config.sync.clone(),
            config.storage_retry,
        );

        let engine = Self {
            store: deps.store,
            clock: deps.clock,
            config,
            dispatcher,
            scheduler,
            planner,
            sync,
            dispatch_events: Mutex::new(Some(events_rx)),
            sync_worker: Mutex::new(None),
        };
        let report = engine.scheduler.reconcile().await?;
        info!(
            "event=engine_start module=engine status=ok dispatched={} armed={}",
            report.dispatched.len(),
            report.armed
        );
        Ok((engine, report))
    }

    /// Takes the receiver of dispatch outcomes. Returns `None` after the first call.
    pub fn take_dispatch_events(&self) -> Option<mpsc::UnboundedReceiver<DispatchEvent>> {
        self.dispatch_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub async fn schedule_notification(
        &self,
        request: NotificationRequest,
    ) -> EngineResult<ScheduleOutcome> {
        let record = ScheduledNotification::from_request(request, self.clock.now_ms());
        self.schedule_record(record).await
    }

    async fn schedule_record(&self, record: ScheduledNotification) -> EngineResult<ScheduleOutcome> {
        let outcome = self.scheduler.schedule(record).await?;
        match &outcome.dispatched {
            Some(DispatchOutcome::Blocked { error }) | Some(DispatchOutcome::Failed { error }) => {
                Err(EngineError::Permission(error.clone()))
            }
            _ => Ok(outcome),
        }
    }

    pub async fn cancel_notification(&self, id: &str) -> EngineResult<CancelOutcome> {
        self.scheduler.cancel(id).await
    }

    pub async fn list_pending(&self) -> EngineResult<Vec<ScheduledNotification>> {
        self.scheduler.list_pending().await
    }

    pub async fn get_notification(&self, id: &str) -> EngineResult<Option<ScheduledNotification>> {
        let store = &self.store;
        let record = retry_storage(&self.config.storage_retry, "get_notification", || {
            store.get_notification(id)
        })
        .await?;
        Ok(record)
    }

    /// Applies a click action. A snooze schedules its follow-up record
    /// before returning.
    pub async fn handle_action(
        &self,
        id: &str,
        action: NotificationAction,
    ) -> EngineResult<ActionOutcome> {
        let outcome = self.dispatcher.handle_action(id, action).await?;
        if let ActionOutcome::Snoozed { follow_up } = &outcome {
            self.schedule_record(follow_up.clone()).await?;
        }
        Ok(outcome)
    }

    pub async fn plan_calendar_notifications(
        &self,
        events: &[CalendarEvent],
    ) -> EngineResult<PlanReport> {
        self.planner.plan(events).await
    }

    pub async fn enqueue_offline_task(
        &self,
        kind: TaskKind,
        payload: TaskPayload,
        priority: i32,
    ) -> EngineResult<OfflineTask> {
        self.sync.enqueue(kind, payload, priority).await
    }

    pub async fn get_task(&self, task_id: &str) -> EngineResult<Option<OfflineTask>> {
        self.sync.get_task(task_id).await
    }

    pub async fn list_tasks(&self, index: TaskIndex) -> EngineResult<Vec<OfflineTask>> {
        self.sync.list_tasks(index).await
    }

    pub async fn retry_task(&self, task_id: &str) -> EngineResult<bool> {
        self.sync.retry_failed(task_id).await
    }

    pub async fn abandon_task(&self, task_id: &str) -> EngineResult<bool> {
        self.sync.abandon(task_id).await
    }

    pub async fn process_sync(&self, trigger: SyncTrigger) -> EngineResult<SyncReport> {
        self.sync.process(trigger).await
    }

    /// Starts the background sync worker; a previous worker is stopped.
    pub fn spawn_sync_worker(&self, signals: mpsc::Receiver<SyncSignal>) {
        let handle = self.sync.spawn_worker(signals);
        let previous = self
            .sync_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub async fn export(&self) -> EngineResult<ExportDocument> {
        let store = &self.store;
        let snapshot = retry_storage(&self.config.storage_retry, "snapshot", || store.snapshot())
            .await?;
        let document = ExportDocument::from_snapshot(snapshot, self.clock.now_ms());
        info!(
            "event=store_export module=engine status=ok entries={}",
            document.entries.len()
        );
        Ok(document)
    }

    /// Merges `document` into the store and arms any imported pending records.
    pub async fn import(&self, document: ExportDocument) -> EngineResult<ImportReport> {
        let snapshot = document.into_snapshot()?;
        let store = &self.store;
        let restored =
            retry_storage(&self.config.storage_retry, "restore", || store.restore(&snapshot))
                .await?;
        let reconcile = self.scheduler.reconcile().await?;
        info!(
            "event=store_import module=engine status=ok written={} skipped={}",
            restored.written, restored.skipped
        );
        Ok(ImportReport {
            entries: restored.written,
            skipped: restored.skipped,
            reconcile,
        })
    }

    /// Drops terminal notifications and synced tasks older than the retention window.
    pub async fn prune(&self) -> EngineResult<PruneReport> {
        let before = self.clock.now_ms().saturating_sub(self.config.retention_ms);
        let store = &self.store;
        let retry = &self.config.storage_retry;
        let notifications =
            retry_storage(retry, "prune_terminal", || store.prune_terminal(before)).await?;
        let tasks = retry_storage(retry, "prune_synced", || store.prune_synced(before)).await?;
        info!(
            "event=store_prune module=engine status=ok notifications={} tasks={}",
            notifications, tasks
        );
        Ok(PruneReport {
            notifications,
            tasks,
        })
    }

    /// Aborts timers and the sync worker. Persisted state is untouched.
    pub fn shutdown(&self) {
        self.scheduler.shutdown();
        if let Some(worker) = self
            .sync_worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            worker.abort();
        }
        info!("event=engine_shutdown module=engine status=ok");
    }

    pub fn scheduler(&self) -> &TimerScheduler {
        &self.scheduler
    }
}
