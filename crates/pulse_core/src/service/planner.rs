//! Calendar event reminders.
//!
//! # Responsibility
//! - Derive one reminder per calendar event and hand it to the scheduler.
//!
//! # Invariants
//! - Reminder ids are `calendar-<eventId>`, so re-planning the same events
//!   upserts instead of duplicating.
//! - A batch is validated as a whole before any record is written.

use crate::model::calendar::CalendarEvent;
use crate::model::validation::ValidationError;
use crate::platform::Clock;
use crate::repo::UpsertOutcome;
use crate::service::scheduler::TimerScheduler;
use crate::service::EngineResult;
use log::info;
use std::sync::Arc;

/// Per-batch counters returned by `plan`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReport {
    pub scheduled: usize,
    pub unchanged: usize,
    pub rescheduled: usize,
    /// Reminder time already passed beyond the grace window.
    pub skipped_elapsed: usize,
    /// Reminder already shown, cancelled or failed; never revived.
    pub skipped_terminal: usize,
}

pub struct CalendarNotificationPlanner {
    scheduler: TimerScheduler,
    clock: Arc<dyn Clock>,
    grace_ms: i64,
}

impl CalendarNotificationPlanner {
    pub fn new(scheduler: TimerScheduler, clock: Arc<dyn Clock>, grace_ms: i64) -> Self {
        Self {
            scheduler,
            clock,
            grace_ms,
        }
    }

    pub async fn plan(&self, events: &[CalendarEvent]) -> EngineResult<PlanReport> {
        let mut planned = Vec::with_capacity(events.len());
        for event in events {
            event.validate()?;
            let notify_at = event.notify_at().ok_or_else(|| {
                ValidationError::NegativeReminderOffset {
                    event_id: event.id.clone(),
                    minutes: event.reminder_offset_minutes,
                }
            })?;
            planned.push((event, notify_at));
        }

        let now = self.clock.now_ms();
        let mut report = PlanReport::default();
        for (event, notify_at) in planned {
            if notify_at < now.saturating_sub(self.grace_ms) {
                report.skipped_elapsed += 1;
                continue;
            }
            let outcome = self
                .scheduler
                .schedule_replacing(event.to_notification(notify_at, now))
                .await?;
            match outcome.upsert {
                UpsertOutcome::Inserted => report.scheduled += 1,
                UpsertOutcome::Unchanged => report.unchanged += 1,
                UpsertOutcome::Replaced => report.rescheduled += 1,
                UpsertOutcome::Terminal(_) => report.skipped_terminal += 1,
                // Surfaced as an error by `schedule`; never produced when replacing.
                UpsertOutcome::Conflict => {}
            }
        }
        info!(
            "event=calendar_plan module=planner status=ok events={} scheduled={} unchanged={} rescheduled={} skipped_elapsed={} skipped_terminal={}",
            events.len(),
            report.scheduled,
            report.unchanged,
            report.rescheduled,
            report.skipped_elapsed,
            report.skipped_terminal
        );
        Ok(report)
    }
}
