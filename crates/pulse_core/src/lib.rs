//! Durable reminder scheduling and offline task sync.
//! The store is the single source of truth; timers and queues are derived from it.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod platform;
pub mod repo;
pub mod service;
pub mod transfer;

pub use config::{ConfigError, CoreConfig, SchedulerConfig, SyncRetryPolicy};
pub use logging::{default_log_level, init_logging, logging_status, LogSettings, LoggingError};
pub use model::calendar::CalendarEvent;
pub use model::notification::{
    NotificationAction, NotificationId, NotificationPayload, NotificationRequest,
    NotificationStatus, ScheduledNotification,
};
pub use model::offline_task::{OfflineTask, SyncQueueItem, TaskKind, TaskPayload};
pub use model::validation::ValidationError;
pub use platform::{
    AppNavigator, Clock, NetworkError, NotificationPresenter, PresentError, PresentRequest,
    SyncTransport, SystemClock, TokioClock,
};
pub use repo::{PersistentStore, SqliteStore, StoreError, StoreResult, TaskIndex};
pub use service::dispatcher::{ActionOutcome, DispatchEvent, DispatchOutcome};
pub use service::engine::{EngineDeps, ImportReport, PruneReport, PulseEngine};
pub use service::planner::PlanReport;
pub use service::scheduler::{CancelOutcome, ReconcileReport, ScheduleOutcome};
pub use service::sync::{SyncReport, SyncSignal, SyncTrigger};
pub use service::{EngineError, EngineResult};
pub use transfer::{ExportDocument, ExportEntry, TransferError, EXPORT_FORMAT_VERSION};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
