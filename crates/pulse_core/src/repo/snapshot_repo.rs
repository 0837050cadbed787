//! Whole-store snapshot and restore used by export/import.
//!
//! # Invariants
//! - Restore merges: it never moves a stored record backwards. Terminal
//!   notifications, synced tasks and permanently failed tasks stay as stored.

use super::notification_repo::{restore_notification, select_all_notifications};
use super::sqlite_store::SqliteStore;
use super::task_repo::{
    purge_settled_queue_items, restore_queue_item, restore_task, select_all_queue_items,
    select_all_tasks,
};
use super::StoreResult;
use crate::model::notification::ScheduledNotification;
use crate::model::offline_task::{OfflineTask, SyncQueueItem};

/// Every persisted record, each list ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub notifications: Vec<ScheduledNotification>,
    pub tasks: Vec<OfflineTask>,
    pub queue_items: Vec<SyncQueueItem>,
}

impl StoreSnapshot {
    pub fn len(&self) -> usize {
        self.notifications.len() + self.tasks.len() + self.queue_items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Counts from one restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub written: usize,
    /// Entries kept as stored because the store had already moved past them.
    pub skipped: usize,
}

impl RestoreReport {
    fn tally(&mut self, written: bool) {
        if written {
            self.written += 1;
        } else {
            self.skipped += 1;
        }
    }
}

pub trait SnapshotRepository {
    fn snapshot(&self) -> StoreResult<StoreSnapshot>;
    /// Merges every record in one transaction. Records the store does not
    /// know are written verbatim; known ones are only overwritten while they
    /// are still pending.
    fn restore(&self, snapshot: &StoreSnapshot) -> StoreResult<RestoreReport>;
}

impl SnapshotRepository for SqliteStore {
    fn snapshot(&self) -> StoreResult<StoreSnapshot> {
        let conn = self.lock()?;
        Ok(StoreSnapshot {
            notifications: select_all_notifications(&conn)?,
            tasks: select_all_tasks(&conn)?,
            queue_items: select_all_queue_items(&conn)?,
        })
    }

    fn restore(&self, snapshot: &StoreSnapshot) -> StoreResult<RestoreReport> {
        self.write_tx(|tx| {
            let mut report = RestoreReport::default();
            for record in &snapshot.notifications {
                report.tally(restore_notification(tx, record)?);
            }
            for task in &snapshot.tasks {
                report.tally(restore_task(tx, task)?);
            }
            for item in &snapshot.queue_items {
                report.tally(restore_queue_item(tx, item)?);
            }
            purge_settled_queue_items(tx)?;
            Ok(report)
        })
    }
}
