//! Scheduled notification domain model.
//!
//! # Responsibility
//! - Define the persisted reminder record and its typed payload.
//! - Encode the one-way status state machine.
//!
//! # Invariants
//! - `Scheduled` is the only non-terminal status; every transition leaves it.
//! - `due_at` never changes for a given record. Snoozing creates a new record
//!   whose `snoozed_from` points at the original.

use crate::model::validation::{require_non_blank, validate_record_id, ValidationError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable notification identifier (UUID text or a derived id such as
/// `calendar-<eventId>`).
pub type NotificationId = String;

/// Lifecycle state of a scheduled notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationStatus {
    /// Persisted and waiting for its due time.
    Scheduled,
    /// Presented to the user. Terminal.
    Shown,
    /// Cancelled before presentation. Terminal.
    Cancelled,
    /// Presentation permanently denied by the platform. Terminal.
    Failed,
}

impl NotificationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Shown => "shown",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(Self::Scheduled),
            "shown" => Some(Self::Shown),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

/// Typed payload carried by a notification, keyed by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationPayload {
    /// Plain user reminder with an optional in-app navigation target.
    Reminder {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Reminder derived from a calendar event.
    CalendarEvent { event_id: String, start_at: i64 },
    /// Habit nudge.
    Habit { habit_id: String },
    /// Todo deadline reminder.
    TaskDue { task_ref: String },
    /// Extension-defined reminder.
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl NotificationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Reminder { .. } => "reminder",
            Self::CalendarEvent { .. } => "calendar_event",
            Self::Habit { .. } => "habit",
            Self::TaskDue { .. } => "task_due",
            Self::Custom { .. } => "custom",
        }
    }

    /// In-app route the `view` action should open, when the payload has one.
    pub fn target(&self) -> Option<String> {
        match self {
            Self::Reminder { target } => target.clone(),
            Self::CalendarEvent { event_id, .. } => Some(format!("/calendar/{event_id}")),
            Self::Habit { habit_id } => Some(format!("/habits/{habit_id}")),
            Self::TaskDue { task_ref } => Some(format!("/todos/{task_ref}")),
            Self::Custom { data, .. } => data
                .get("target")
                .and_then(serde_json::Value::as_str)
                .map(ToString::to_string),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Reminder { .. } => Ok(()),
            Self::CalendarEvent { event_id, .. } => require_non_blank(event_id, "event_id"),
            Self::Habit { habit_id } => require_non_blank(habit_id, "habit_id"),
            Self::TaskDue { task_ref } => require_non_blank(task_ref, "task_ref"),
            Self::Custom { name, .. } => require_non_blank(name, "name"),
        }
    }
}

impl Default for NotificationPayload {
    fn default() -> Self {
        Self::Reminder { target: None }
    }
}

/// User action reported by the platform's click/action callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAction {
    /// Bring the app forward and navigate to the payload target.
    View,
    Dismiss,
    Snooze,
}

impl NotificationAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Dismiss => "dismiss",
            Self::Snooze => "snooze",
        }
    }

    /// Parses a platform action id; a plain body click arrives as `""`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" | "view" => Some(Self::View),
            "dismiss" | "close" => Some(Self::Dismiss),
            "snooze" => Some(Self::Snooze),
            _ => None,
        }
    }
}

/// Inbound request from the UI layer to schedule a reminder.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NotificationRequest {
    /// Caller-chosen id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<NotificationId>,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub due_at: i64,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default)]
    pub badge: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub payload: NotificationPayload,
    #[serde(default)]
    pub require_interaction: bool,
    #[serde(default)]
    pub silent: bool,
}

/// Persisted reminder record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledNotification {
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    /// Unix epoch milliseconds.
    pub due_at: i64,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub payload: NotificationPayload,
    pub require_interaction: bool,
    pub silent: bool,
    pub status: NotificationStatus,
    pub created_at: i64,
    pub shown_at: Option<i64>,
    pub cancelled_at: Option<i64>,
    pub failed_at: Option<i64>,
    pub failure_reason: Option<String>,
    pub snoozed_from: Option<NotificationId>,
}

impl ScheduledNotification {
    /// Creates a `Scheduled` record with the given id.
    pub fn new(
        id: impl Into<NotificationId>,
        title: impl Into<String>,
        due_at: i64,
        payload: NotificationPayload,
        created_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            due_at,
            icon: None,
            badge: None,
            tag: None,
            payload,
            require_interaction: false,
            silent: false,
            status: NotificationStatus::Scheduled,
            created_at,
            shown_at: None,
            cancelled_at: None,
            failed_at: None,
            failure_reason: None,
            snoozed_from: None,
        }
    }

    /// Builds a `Scheduled` record from a UI request.
    pub fn from_request(request: NotificationRequest, created_at: i64) -> Self {
        let id = request
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            body: request.body,
            icon: request.icon,
            badge: request.badge,
            tag: request.tag,
            require_interaction: request.require_interaction,
            silent: request.silent,
            ..Self::new(id, request.title, request.due_at, request.payload, created_at)
        }
    }

    /// Derives the follow-up record a snooze action creates.
    ///
    /// The copy's id is derived from the original's, so snoozing the same
    /// record twice names the same follow-up. `due_at = shown_at +
    /// snooze_offset_ms`; the original is left untouched.
    pub fn snoozed_copy(&self, snooze_offset_ms: i64, created_at: i64) -> Option<Self> {
        let shown_at = self.shown_at?;
        Some(Self {
            id: snooze_follow_up_id(&self.id),
            due_at: shown_at.saturating_add(snooze_offset_ms),
            status: NotificationStatus::Scheduled,
            created_at,
            shown_at: None,
            cancelled_at: None,
            failed_at: None,
            failure_reason: None,
            snoozed_from: Some(self.id.clone()),
            ..self.clone()
        })
    }

    /// Returns whether the record is still waiting to be dispatched.
    pub fn is_pending(&self) -> bool {
        self.status == NotificationStatus::Scheduled
    }

    /// Checks write-path invariants.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_record_id(&self.id)?;
        if self.title.trim().is_empty() {
            return Err(ValidationError::EmptyTitle {
                id: self.id.clone(),
            });
        }
        if self.due_at <= 0 {
            return Err(ValidationError::InvalidDueAt {
                id: self.id.clone(),
                due_at: self.due_at,
            });
        }
        self.payload.validate()
    }
}

fn snooze_follow_up_id(original_id: &str) -> String {
    let derived = Uuid::new_v5(&Uuid::NAMESPACE_OID, original_id.as_bytes());
    format!("snooze-{derived}")
}
