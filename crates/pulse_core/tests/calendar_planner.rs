mod common;

use common::{memory_store, start_engine, test_clock, T0};
use pulse_core::repo::NotificationRepository;
use pulse_core::{CalendarEvent, EngineError, NotificationStatus, PlanReport};
use std::time::Duration;

const HOUR_MS: i64 = 60 * 60 * 1000;

fn event(id: &str, start_at: i64, offset_minutes: i64) -> CalendarEvent {
    CalendarEvent {
        id: id.to_string(),
        title: format!("Meeting {id}"),
        start_at,
        reminder_offset_minutes: offset_minutes,
        location: None,
    }
}

#[tokio::test(start_paused = true)]
async fn planning_twice_keeps_one_record_per_event() {
    let h = start_engine(memory_store(), test_clock()).await;
    let events = vec![
        event("standup", T0 + HOUR_MS, 15),
        event("review", T0 + 3 * HOUR_MS, 30),
        event("retro", T0 + 5 * HOUR_MS, 0),
    ];

    let first = h.engine.plan_calendar_notifications(&events).await.unwrap();
    let second = h.engine.plan_calendar_notifications(&events).await.unwrap();

    assert_eq!(first.scheduled, 3);
    assert_eq!(
        second,
        PlanReport {
            unchanged: 3,
            ..PlanReport::default()
        }
    );
    assert_eq!(h.store.count_notifications().unwrap(), 3);
    assert_eq!(h.engine.scheduler().armed_count(), 3);

    let standup = h
        .store
        .get_notification("calendar-standup")
        .unwrap()
        .unwrap();
    assert_eq!(standup.due_at, T0 + HOUR_MS - 15 * 60_000);
    assert_eq!(standup.tag.as_deref(), Some("calendar-standup"));
}

#[tokio::test(start_paused = true)]
async fn moved_event_is_rescheduled_in_place() {
    let h = start_engine(memory_store(), test_clock()).await;
    h.engine
        .plan_calendar_notifications(&[event("sync", T0 + HOUR_MS, 10)])
        .await
        .unwrap();

    let report = h
        .engine
        .plan_calendar_notifications(&[event("sync", T0 + 2 * HOUR_MS, 10)])
        .await
        .unwrap();

    assert_eq!(report.rescheduled, 1);
    assert_eq!(h.store.count_notifications().unwrap(), 1);
    let record = h.store.get_notification("calendar-sync").unwrap().unwrap();
    assert_eq!(record.due_at, T0 + 2 * HOUR_MS - 10 * 60_000);
    assert_eq!(record.status, NotificationStatus::Scheduled);
}

#[tokio::test(start_paused = true)]
async fn elapsed_and_terminal_reminders_are_skipped() {
    let h = start_engine(memory_store(), test_clock()).await;
    let soon = event("soon", T0 + 1_000, 0);
    h.engine
        .plan_calendar_notifications(&[soon.clone()])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(
        h.store.get_notification("calendar-soon").unwrap().unwrap().status,
        NotificationStatus::Shown
    );

    let past = event("yesterday", T0 - 24 * HOUR_MS, 5);
    let report = h
        .engine
        .plan_calendar_notifications(&[soon, past])
        .await
        .unwrap();

    assert_eq!(report.skipped_terminal, 1);
    assert_eq!(report.skipped_elapsed, 1);
    assert_eq!(h.presenter.shown_count("calendar-soon"), 1);
    assert!(h.store.get_notification("calendar-yesterday").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn reminder_within_grace_window_fires_late() {
    let h = start_engine(memory_store(), test_clock()).await;
    // Reminder time 30s ago, inside the default 60s grace window.
    let report = h
        .engine
        .plan_calendar_notifications(&[event("late", T0 + 5 * 60_000 - 30_000, 5)])
        .await
        .unwrap();

    assert_eq!(report.scheduled, 1);
    assert_eq!(h.presenter.shown_count("calendar-late"), 1);
}

#[tokio::test(start_paused = true)]
async fn invalid_batch_writes_nothing() {
    let h = start_engine(memory_store(), test_clock()).await;
    let events = vec![
        event("good", T0 + HOUR_MS, 10),
        event("bad", T0 + HOUR_MS, -5),
    ];

    let err = h
        .engine
        .plan_calendar_notifications(&events)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert_eq!(h.store.count_notifications().unwrap(), 0);
}
