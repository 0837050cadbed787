//! Notification presentation state machine.
//!
//! # Responsibility
//! - Move a due record from `Scheduled` to `Shown` and present it, at most once.
//! - Apply the click policy (`view`, `dismiss`, `snooze`).
//!
//! # Invariants
//! - Presentation happens only while this dispatcher holds the claim lease on
//!   a `Scheduled` record; a record that is terminal or claimed elsewhere is
//!   not presented.
//! - `Shown` is written only after the platform accepted the notification,
//!   and only if the record is still `Scheduled` under the same claim.
//! - A failed presentation drops its claim without touching the status, so a
//!   cancel that landed meanwhile stands.
//! - Snooze never reopens the original record.

use crate::config::SchedulerConfig;
use crate::model::notification::{NotificationAction, NotificationStatus, ScheduledNotification};
use crate::platform::{
    AppNavigator, Clock, NotificationPresenter, PresentError, PresentRequest,
};
use crate::repo::{
    retry_storage, ClaimOutcome, ClaimSettlement, PersistentStore, StorageRetryPolicy,
    StoreResult, TransitionOutcome,
};
use crate::service::{EngineError, EngineResult};
use log::{info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Result of one dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Shown { shown_at: i64 },
    /// Another path already moved the record out of `Scheduled`.
    Skipped { current: Option<NotificationStatus> },
    /// Another dispatcher is presenting the record; its claim expires at
    /// `claimed_until`.
    Busy { claimed_until: i64 },
    /// Presentation failed transiently; the record stays `Scheduled`.
    Deferred { error: PresentError },
    /// Permission not granted yet; the record stays `Scheduled` but is not
    /// re-armed until the next reconcile.
    Blocked { error: PresentError },
    /// Permission permanently denied; the record is `Failed`.
    Failed { error: PresentError },
}

impl DispatchOutcome {
    pub fn is_shown(&self) -> bool {
        matches!(self, Self::Shown { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Shown { .. } => "shown",
            Self::Skipped { .. } => "skipped",
            Self::Busy { .. } => "busy",
            Self::Deferred { .. } => "deferred",
            Self::Blocked { .. } => "blocked",
            Self::Failed { .. } => "failed",
        }
    }
}

/// Published for every dispatch so timer-driven failures reach the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchEvent {
    pub notification_id: String,
    pub outcome: DispatchOutcome,
}

/// Result of a click/action callback.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome {
    Opened { target: String },
    Dismissed,
    /// Follow-up record to schedule; the original stays `Shown`.
    Snoozed { follow_up: ScheduledNotification },
}

pub struct NotificationDispatcher {
    store: Arc<dyn PersistentStore>,
    presenter: Arc<dyn NotificationPresenter>,
    navigator: Arc<dyn AppNavigator>,
    clock: Arc<dyn Clock>,
    storage_retry: StorageRetryPolicy,
    snooze_offset_ms: i64,
    claim_lease_ms: i64,
    events: Option<mpsc::UnboundedSender<DispatchEvent>>,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        presenter: Arc<dyn NotificationPresenter>,
        navigator: Arc<dyn AppNavigator>,
        clock: Arc<dyn Clock>,
        storage_retry: StorageRetryPolicy,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            presenter,
            navigator,
            clock,
            storage_retry,
            snooze_offset_ms: config.snooze_offset_ms,
            claim_lease_ms: config.present_claim_lease_ms,
            events: None,
        }
    }

    /// Publishes every dispatch outcome on `events`.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<DispatchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Claims and presents one record.
    pub async fn fire(&self, id: &str) -> StoreResult<DispatchOutcome> {
        let outcome = self.fire_inner(id).await?;
        match &outcome {
            DispatchOutcome::Shown { .. }
            | DispatchOutcome::Skipped { .. }
            | DispatchOutcome::Busy { .. } => info!(
                "event=notification_dispatch module=dispatcher status={} id={}",
                outcome.label(),
                id
            ),
            DispatchOutcome::Deferred { error }
            | DispatchOutcome::Blocked { error }
            | DispatchOutcome::Failed { error } => warn!(
                "event=notification_dispatch module=dispatcher status={} id={} error={}",
                outcome.label(),
                id,
                error
            ),
        }
        if let Some(events) = &self.events {
            let _ = events.send(DispatchEvent {
                notification_id: id.to_string(),
                outcome: outcome.clone(),
            });
        }
        Ok(outcome)
    }

    async fn fire_inner(&self, id: &str) -> StoreResult<DispatchOutcome> {
        let record = retry_storage(&self.storage_retry, "get_notification", || {
            self.store.get_notification(id)
        })
        .await?;
        let record = match record {
            Some(record) if record.is_pending() => record,
            other => {
                return Ok(DispatchOutcome::Skipped {
                    current: other.map(|r| r.status),
                })
            }
        };

        let token = Uuid::new_v4().to_string();
        let now = self.clock.now_ms();
        let lease_until = now.saturating_add(self.claim_lease_ms);
        let claim = retry_storage(&self.storage_retry, "claim_notification", || {
            self.store.claim_dispatch(id, &token, now, lease_until)
        })
        .await?;
        match claim {
            ClaimOutcome::Claimed => {}
            ClaimOutcome::Held { until } => {
                return Ok(DispatchOutcome::Busy {
                    claimed_until: until,
                })
            }
            ClaimOutcome::Rejected { current } => return Ok(DispatchOutcome::Skipped { current }),
        }

        let request = PresentRequest::for_notification(&record);
        let presented = self.presenter.present(&request).await;
        let settled_at = self.clock.now_ms();
        let (settlement, outcome) = match presented {
            Ok(()) => (
                ClaimSettlement::Shown { at: settled_at },
                DispatchOutcome::Shown {
                    shown_at: settled_at,
                },
            ),
            Err(error @ PresentError::PermissionDenied { permanent: true }) => (
                ClaimSettlement::Failed {
                    at: settled_at,
                    reason: error.to_string(),
                },
                DispatchOutcome::Failed { error },
            ),
            Err(error @ PresentError::PermissionDenied { permanent: false }) => {
                (ClaimSettlement::Released, DispatchOutcome::Blocked { error })
            }
            Err(error @ PresentError::Unavailable(_)) => {
                (ClaimSettlement::Released, DispatchOutcome::Deferred { error })
            }
        };

        let settled = retry_storage(&self.storage_retry, "settle_claim", || {
            self.store.settle_claim(id, &token, &settlement)
        })
        .await?;
        match settled {
            TransitionOutcome::Applied => Ok(outcome),
            TransitionOutcome::Rejected { current } => {
                // Cancelled (or taken over) while presenting; the stored status stands.
                warn!(
                    "event=notification_settle module=dispatcher status=rejected id={} attempted={} current={:?}",
                    id,
                    outcome.label(),
                    current
                );
                Ok(DispatchOutcome::Skipped { current })
            }
        }
    }

    /// Applies the click policy for `action` on record `id`.
    ///
    /// # Errors
    /// - `NotFound` when the record does not exist.
    /// - `InvalidState` when snoozing a record that was never shown.
    pub async fn handle_action(
        &self,
        id: &str,
        action: NotificationAction,
    ) -> EngineResult<ActionOutcome> {
        let record = retry_storage(&self.storage_retry, "get_notification", || {
            self.store.get_notification(id)
        })
        .await?
        .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        info!(
            "event=notification_action module=dispatcher status=start id={} action={}",
            id,
            action.as_str()
        );
        match action {
            NotificationAction::View => {
                let target = record
                    .payload
                    .target()
                    .unwrap_or_else(|| format!("/notifications/{id}"));
                self.navigator.open(&target);
                Ok(ActionOutcome::Opened { target })
            }
            NotificationAction::Dismiss => Ok(ActionOutcome::Dismissed),
            NotificationAction::Snooze => {
                let follow_up = record
                    .snoozed_copy(self.snooze_offset_ms, self.clock.now_ms())
                    .filter(|_| record.status == NotificationStatus::Shown)
                    .ok_or(EngineError::InvalidState {
                        id: record.id.clone(),
                        status: record.status,
                    })?;
                Ok(ActionOutcome::Snoozed { follow_up })
            }
        }
    }
}
