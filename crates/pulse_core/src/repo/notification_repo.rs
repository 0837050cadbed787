//! Notification persistence: upsert, indexed queries and guarded transitions.
//!
//! # Invariants
//! - `upsert_scheduled` never revives a terminal record.
//! - `transition` applies only when the stored status equals the expected
//!   `from` status; the caller learns the winner from the outcome.
//! - Status only moves forward. A presentation claim is a lease on a
//!   `Scheduled` row; releasing it leaves the status alone, so a cancel that
//!   lands while the platform is presenting still wins.

use super::sqlite_store::{bool_to_int, parse_flag, SqliteStore};
use super::{StoreError, StoreResult};
use crate::model::notification::{NotificationPayload, NotificationStatus, ScheduledNotification};
use rusqlite::{params, Connection, OptionalExtension, Row};

const NOTIFICATION_SELECT_SQL: &str = "SELECT
    id,
    title,
    body,
    due_at,
    icon,
    badge,
    tag,
    payload_json,
    require_interaction,
    silent,
    status,
    created_at,
    shown_at,
    cancelled_at,
    failed_at,
    failure_reason,
    snoozed_from
FROM notifications";

/// Secondary-index lookups supported by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationIndex {
    /// All records in one status, due order.
    Status(NotificationStatus),
    /// `Scheduled` records with `due_at <= value`, due order.
    DueBefore(i64),
    /// Records sharing a presentation tag.
    Tag(String),
}

/// Guarded status change out of `Scheduled`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusChange {
    /// `Scheduled -> Cancelled`. Wins over an unsettled presentation claim.
    Cancel { at: i64 },
    /// `Scheduled -> Failed`.
    Fail { at: i64, reason: String },
}

/// Result of a guarded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied,
    /// Another writer got there first; carries the status found, if any.
    Rejected { current: Option<NotificationStatus> },
}

impl TransitionOutcome {
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Result of taking the presentation claim on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    /// Another dispatcher holds an unexpired claim.
    Held { until: i64 },
    /// The record is not `Scheduled` (or does not exist).
    Rejected { current: Option<NotificationStatus> },
}

/// How a presentation claim ends. Each variant only applies while the
/// record is still `Scheduled` under the same claim token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimSettlement {
    /// Presented: `Scheduled -> Shown`, stamping `shown_at`.
    Shown { at: i64 },
    /// Not presented; the claim is dropped and the status is untouched.
    Released,
    /// Permanently denied: `Scheduled -> Failed`.
    Failed { at: i64, reason: String },
}

/// What `upsert_scheduled` does when the id is still pending with other content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingPolicy {
    /// Overwrite the pending record in place (derived records such as
    /// calendar reminders).
    Replace,
    /// Leave it untouched and report `Conflict`.
    Keep,
}

/// Result of writing a `Scheduled` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// Same id and identical content already scheduled.
    Unchanged,
    /// Same id still scheduled with different content; replaced in place.
    Replaced,
    /// Same id still scheduled with different content; nothing written.
    Conflict,
    /// Same id already terminal; nothing written.
    Terminal(NotificationStatus),
}

/// Storage contract for scheduled notifications.
pub trait NotificationRepository {
    fn upsert_scheduled(
        &self,
        record: &ScheduledNotification,
        policy: PendingPolicy,
    ) -> StoreResult<UpsertOutcome>;
    fn get_notification(&self, id: &str) -> StoreResult<Option<ScheduledNotification>>;
    fn query_notifications(
        &self,
        index: &NotificationIndex,
    ) -> StoreResult<Vec<ScheduledNotification>>;
    fn transition(&self, id: &str, change: &StatusChange) -> StoreResult<TransitionOutcome>;
    /// Leases a `Scheduled` record to `token` until `lease_until`. An expired
    /// claim left by a crashed dispatcher can be taken over.
    fn claim_dispatch(
        &self,
        id: &str,
        token: &str,
        now: i64,
        lease_until: i64,
    ) -> StoreResult<ClaimOutcome>;
    fn settle_claim(
        &self,
        id: &str,
        token: &str,
        settlement: &ClaimSettlement,
    ) -> StoreResult<TransitionOutcome>;
    fn delete_notification(&self, id: &str) -> StoreResult<bool>;
    /// Deletes terminal records whose terminal timestamp is older than `before`.
    fn prune_terminal(&self, before: i64) -> StoreResult<usize>;
    fn count_notifications(&self) -> StoreResult<usize>;

    /// `Scheduled` records in ascending due order.
    fn list_scheduled_by_due(&self) -> StoreResult<Vec<ScheduledNotification>> {
        self.query_notifications(&NotificationIndex::Status(NotificationStatus::Scheduled))
    }
}

impl NotificationRepository for SqliteStore {
    fn upsert_scheduled(
        &self,
        record: &ScheduledNotification,
        policy: PendingPolicy,
    ) -> StoreResult<UpsertOutcome> {
        record.validate()?;
        if record.status != NotificationStatus::Scheduled {
            return Err(StoreError::InvalidData(format!(
                "upsert_scheduled expects a scheduled record, `{}` is {}",
                record.id,
                record.status.as_str()
            )));
        }
        let payload_json = serde_json::to_string(&record.payload)?;

        self.write_tx(|tx| {
            let existing = fetch_notification(tx, &record.id)?;
            match existing {
                None => {
                    insert_notification(tx, record, &payload_json)?;
                    Ok(UpsertOutcome::Inserted)
                }
                Some(current) if current.status.is_terminal() => {
                    Ok(UpsertOutcome::Terminal(current.status))
                }
                Some(current) if same_content(&current, record) => Ok(UpsertOutcome::Unchanged),
                Some(_) if policy == PendingPolicy::Keep => Ok(UpsertOutcome::Conflict),
                Some(_) => {
                    tx.execute(
                        "UPDATE notifications
                         SET
                            title = ?1,
                            body = ?2,
                            due_at = ?3,
                            icon = ?4,
                            badge = ?5,
                            tag = ?6,
                            payload_json = ?7,
                            require_interaction = ?8,
                            silent = ?9,
                            created_at = ?10,
                            snoozed_from = ?11
                         WHERE id = ?12 AND status = 'scheduled';",
                        params![
                            record.title,
                            record.body,
                            record.due_at,
                            record.icon,
                            record.badge,
                            record.tag,
                            payload_json,
                            bool_to_int(record.require_interaction),
                            bool_to_int(record.silent),
                            record.created_at,
                            record.snoozed_from,
                            record.id,
                        ],
                    )?;
                    Ok(UpsertOutcome::Replaced)
                }
            }
        })
    }

    fn get_notification(&self, id: &str) -> StoreResult<Option<ScheduledNotification>> {
        let conn = self.lock()?;
        fetch_notification(&conn, id)
    }

    fn query_notifications(
        &self,
        index: &NotificationIndex,
    ) -> StoreResult<Vec<ScheduledNotification>> {
        let conn = self.lock()?;
        let order = "ORDER BY due_at ASC, id ASC";
        let mut stmt;
        let mut rows = match index {
            NotificationIndex::Status(status) => {
                stmt = conn.prepare(&format!(
                    "{NOTIFICATION_SELECT_SQL} WHERE status = ?1 {order};"
                ))?;
                stmt.query([status.as_str()])?
            }
            NotificationIndex::DueBefore(due_at) => {
                stmt = conn.prepare(&format!(
                    "{NOTIFICATION_SELECT_SQL} WHERE status = 'scheduled' AND due_at <= ?1 {order};"
                ))?;
                stmt.query([due_at])?
            }
            NotificationIndex::Tag(tag) => {
                stmt = conn.prepare(&format!("{NOTIFICATION_SELECT_SQL} WHERE tag = ?1 {order};"))?;
                stmt.query([tag])?
            }
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(parse_notification_row(row)?);
        }
        Ok(records)
    }

    fn transition(&self, id: &str, change: &StatusChange) -> StoreResult<TransitionOutcome> {
        let conn = self.lock()?;
        let changed = match change {
            StatusChange::Cancel { at } => conn.execute(
                "UPDATE notifications
                 SET status = 'cancelled', cancelled_at = ?1, claim_token = NULL, claimed_until = NULL
                 WHERE id = ?2 AND status = 'scheduled';",
                params![at, id],
            )?,
            StatusChange::Fail { at, reason } => conn.execute(
                "UPDATE notifications
                 SET status = 'failed', failed_at = ?1, failure_reason = ?2,
                     claim_token = NULL, claimed_until = NULL
                 WHERE id = ?3 AND status = 'scheduled';",
                params![at, reason, id],
            )?,
        };

        if changed == 1 {
            return Ok(TransitionOutcome::Applied);
        }
        Ok(TransitionOutcome::Rejected {
            current: fetch_status(&conn, id)?,
        })
    }

    fn claim_dispatch(
        &self,
        id: &str,
        token: &str,
        now: i64,
        lease_until: i64,
    ) -> StoreResult<ClaimOutcome> {
        self.write_tx(|tx| {
            let changed = tx.execute(
                "UPDATE notifications SET claim_token = ?1, claimed_until = ?2
                 WHERE id = ?3
                   AND status = 'scheduled'
                   AND (claimed_until IS NULL OR claimed_until <= ?4);",
                params![token, lease_until, id, now],
            )?;
            if changed == 1 {
                return Ok(ClaimOutcome::Claimed);
            }
            let row = tx
                .query_row(
                    "SELECT status, claimed_until FROM notifications WHERE id = ?1;",
                    [id],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
                )
                .optional()?;
            match row {
                None => Ok(ClaimOutcome::Rejected { current: None }),
                Some((status, claimed_until)) => match parse_status(&status)? {
                    NotificationStatus::Scheduled => Ok(ClaimOutcome::Held {
                        until: claimed_until.unwrap_or(now),
                    }),
                    other => Ok(ClaimOutcome::Rejected {
                        current: Some(other),
                    }),
                },
            }
        })
    }

    fn settle_claim(
        &self,
        id: &str,
        token: &str,
        settlement: &ClaimSettlement,
    ) -> StoreResult<TransitionOutcome> {
        let conn = self.lock()?;
        let changed = match settlement {
            ClaimSettlement::Shown { at } => conn.execute(
                "UPDATE notifications
                 SET status = 'shown', shown_at = ?1, claim_token = NULL, claimed_until = NULL
                 WHERE id = ?2 AND status = 'scheduled' AND claim_token = ?3;",
                params![at, id, token],
            )?,
            ClaimSettlement::Released => conn.execute(
                "UPDATE notifications SET claim_token = NULL, claimed_until = NULL
                 WHERE id = ?1 AND status = 'scheduled' AND claim_token = ?2;",
                params![id, token],
            )?,
            ClaimSettlement::Failed { at, reason } => conn.execute(
                "UPDATE notifications
                 SET status = 'failed', failed_at = ?1, failure_reason = ?2,
                     claim_token = NULL, claimed_until = NULL
                 WHERE id = ?3 AND status = 'scheduled' AND claim_token = ?4;",
                params![at, reason, id, token],
            )?,
        };

        if changed == 1 {
            return Ok(TransitionOutcome::Applied);
        }
        Ok(TransitionOutcome::Rejected {
            current: fetch_status(&conn, id)?,
        })
    }

    fn delete_notification(&self, id: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM notifications WHERE id = ?1;", [id])?;
        Ok(changed > 0)
    }

    fn prune_terminal(&self, before: i64) -> StoreResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM notifications
             WHERE status != 'scheduled'
               AND COALESCE(shown_at, cancelled_at, failed_at, created_at) < ?1;",
            [before],
        )?;
        Ok(removed)
    }

    fn count_notifications(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM notifications;", [], |row| {
            row.get(0)
        })?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

pub(crate) fn fetch_notification(
    conn: &Connection,
    id: &str,
) -> StoreResult<Option<ScheduledNotification>> {
    let mut stmt = conn.prepare(&format!("{NOTIFICATION_SELECT_SQL} WHERE id = ?1;"))?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(parse_notification_row(row)?)),
        None => Ok(None),
    }
}

pub(crate) fn select_all_notifications(conn: &Connection) -> StoreResult<Vec<ScheduledNotification>> {
    let mut stmt = conn.prepare(&format!("{NOTIFICATION_SELECT_SQL} ORDER BY id ASC;"))?;
    let mut rows = stmt.query([])?;
    let mut records = Vec::new();
    while let Some(row) = rows.next()? {
        records.push(parse_notification_row(row)?);
    }
    Ok(records)
}

fn insert_notification(
    conn: &Connection,
    record: &ScheduledNotification,
    payload_json: &str,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO notifications (
            id, title, body, due_at, icon, badge, tag, payload_json,
            require_interaction, silent, status, created_at, shown_at,
            cancelled_at, failed_at, failure_reason, snoozed_from
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17);",
        params![
            record.id,
            record.title,
            record.body,
            record.due_at,
            record.icon,
            record.badge,
            record.tag,
            payload_json,
            bool_to_int(record.require_interaction),
            bool_to_int(record.silent),
            record.status.as_str(),
            record.created_at,
            record.shown_at,
            record.cancelled_at,
            record.failed_at,
            record.failure_reason,
            record.snoozed_from,
        ],
    )?;
    Ok(())
}

/// Writes an imported record verbatim unless the stored one is already
/// terminal. Returns whether anything was written.
pub(crate) fn restore_notification(
    conn: &Connection,
    record: &ScheduledNotification,
) -> StoreResult<bool> {
    record.validate()?;
    if let Some(current) = fetch_status(conn, &record.id)? {
        if current.is_terminal() {
            return Ok(false);
        }
    }
    let payload_json = serde_json::to_string(&record.payload)?;
    conn.execute("DELETE FROM notifications WHERE id = ?1;", [&record.id])?;
    insert_notification(conn, record, &payload_json)?;
    Ok(true)
}

fn fetch_status(conn: &Connection, id: &str) -> StoreResult<Option<NotificationStatus>> {
    conn.query_row(
        "SELECT status FROM notifications WHERE id = ?1;",
        [id],
        |row| row.get::<_, String>(0),
    )
    .optional()?
    .map(|value| parse_status(&value))
    .transpose()
}

fn same_content(current: &ScheduledNotification, next: &ScheduledNotification) -> bool {
    current.title == next.title
        && current.body == next.body
        && current.due_at == next.due_at
        && current.icon == next.icon
        && current.badge == next.badge
        && current.tag == next.tag
        && current.payload == next.payload
        && current.require_interaction == next.require_interaction
        && current.silent == next.silent
}

fn parse_status(value: &str) -> StoreResult<NotificationStatus> {
    NotificationStatus::parse(value).ok_or_else(|| {
        StoreError::InvalidData(format!(
            "invalid status `{value}` in notifications.status"
        ))
    })
}

fn parse_notification_row(row: &Row<'_>) -> StoreResult<ScheduledNotification> {
    let id: String = row.get("id")?;
    let payload_json: String = row.get("payload_json")?;
    let payload: NotificationPayload = serde_json::from_str(&payload_json).map_err(|err| {
        StoreError::InvalidData(format!(
            "invalid payload for notification `{id}` in notifications.payload_json: {err}"
        ))
    })?;
    let status_text: String = row.get("status")?;

    Ok(ScheduledNotification {
        title: row.get("title")?,
        body: row.get("body")?,
        due_at: row.get("due_at")?,
        icon: row.get("icon")?,
        badge: row.get("badge")?,
        tag: row.get("tag")?,
        payload,
        require_interaction: parse_flag(row, "require_interaction", "notifications")?,
        silent: parse_flag(row, "silent", "notifications")?,
        status: parse_status(&status_text)?,
        created_at: row.get("created_at")?,
        shown_at: row.get("shown_at")?,
        cancelled_at: row.get("cancelled_at")?,
        failed_at: row.get("failed_at")?,
        failure_reason: row.get("failure_reason")?,
        snoozed_from: row.get("snoozed_from")?,
        id,
    })
}
