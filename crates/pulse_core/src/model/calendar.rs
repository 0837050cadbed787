//! Calendar event input for reminder planning.

use crate::model::notification::{NotificationPayload, ScheduledNotification};
use crate::model::validation::{validate_record_id, ValidationError};
use serde::{Deserialize, Serialize};

const MS_PER_MINUTE: i64 = 60_000;

/// Calendar event as delivered by the calendar fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: String,
    pub title: String,
    /// Unix epoch milliseconds.
    pub start_at: i64,
    /// Minutes before `start_at` the reminder fires.
    pub reminder_offset_minutes: i64,
    #[serde(default)]
    pub location: Option<String>,
}

impl CalendarEvent {
    /// Deterministic notification id, so re-planning upserts instead of duplicating.
    pub fn notification_id(&self) -> String {
        format!("calendar-{}", self.id)
    }

    /// `start_at - offset`, or `None` on arithmetic overflow.
    pub fn notify_at(&self) -> Option<i64> {
        self.reminder_offset_minutes
            .checked_mul(MS_PER_MINUTE)
            .and_then(|offset_ms| self.start_at.checked_sub(offset_ms))
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_record_id(&self.id)?;
        if self.reminder_offset_minutes < 0 {
            return Err(ValidationError::NegativeReminderOffset {
                event_id: self.id.clone(),
                minutes: self.reminder_offset_minutes,
            });
        }
        Ok(())
    }

    /// Builds the reminder record for this event.
    pub fn to_notification(&self, notify_at: i64, created_at: i64) -> ScheduledNotification {
        let mut record = ScheduledNotification::new(
            self.notification_id(),
            self.title.clone(),
            notify_at,
            NotificationPayload::CalendarEvent {
                event_id: self.id.clone(),
                start_at: self.start_at,
            },
            created_at,
        );
        record.body = match (&self.location, self.reminder_offset_minutes) {
            (Some(location), 0) => format!("Starting now at {location}"),
            (Some(location), minutes) => format!("Starts in {minutes} min at {location}"),
            (None, 0) => "Starting now".to_string(),
            (None, minutes) => format!("Starts in {minutes} min"),
        };
        record.tag = Some(record.id.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::CalendarEvent;

    fn event(offset: i64) -> CalendarEvent {
        CalendarEvent {
            id: "evt1".to_string(),
            title: "Standup".to_string(),
            start_at: 10 * 60_000,
            reminder_offset_minutes: offset,
            location: None,
        }
    }

    #[test]
    fn notify_at_subtracts_offset_in_minutes() {
        assert_eq!(event(5).notify_at(), Some(5 * 60_000));
        assert_eq!(event(0).notify_at(), Some(10 * 60_000));
    }

    #[test]
    fn notification_uses_deterministic_id_and_tag() {
        let record = event(5).to_notification(300_000, 1);
        assert_eq!(record.id, "calendar-evt1");
        assert_eq!(record.tag.as_deref(), Some("calendar-evt1"));
        assert_eq!(record.body, "Starts in 5 min");
        record.validate().unwrap();
    }

    #[test]
    fn negative_offset_is_rejected() {
        assert!(event(-1).validate().is_err());
    }
}
