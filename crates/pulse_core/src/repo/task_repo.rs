//! Offline task and sync queue persistence.
//!
//! # Invariants
//! - A task and its queue item are created in one transaction.
//! - `mark_task_synced` only flips unsynced rows, so a second caller observes
//!   `false` and must not treat the task as newly synced.
//! - Queue claims are leases taken with a conditional update; at most one
//!   runner holds an unexpired claim.

use super::sqlite_store::{bool_to_int, parse_flag, SqliteStore};
use super::{StoreError, StoreResult};
use crate::model::offline_task::{OfflineTask, SyncQueueItem, TaskKind, TaskPayload};
use rusqlite::{params, Connection, OptionalExtension, Row};

const TASK_SELECT_SQL: &str = "SELECT
    id,
    kind,
    payload_json,
    created_at,
    synced,
    synced_at,
    retry_count,
    priority,
    permanently_failed,
    failed_at,
    last_error
FROM offline_tasks";

const QUEUE_SELECT_SQL: &str = "SELECT
    id,
    task_id,
    enqueued_at,
    priority,
    retry_count,
    last_attempt_at,
    next_attempt_at,
    claimed_until
FROM sync_queue";

/// Secondary-index lookups over offline tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskIndex {
    Synced(bool),
    PermanentlyFailed,
    /// Tasks with `priority >= value`.
    MinPriority(i32),
}

/// Counters after a failed submission was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncFailureCounts {
    /// Lifetime failures of the task.
    pub task_retry_count: u32,
    /// Failures in the current queue round.
    pub item_retry_count: u32,
}

/// Storage contract for offline tasks and their queue.
pub trait OfflineTaskRepository {
    fn insert_task(&self, task: &OfflineTask, item: &SyncQueueItem) -> StoreResult<()>;
    fn get_task(&self, id: &str) -> StoreResult<Option<OfflineTask>>;
    /// Results are ordered by priority descending, then creation time.
    fn query_tasks(&self, index: TaskIndex) -> StoreResult<Vec<OfflineTask>>;
    fn get_queue_item(&self, task_id: &str) -> StoreResult<Option<SyncQueueItem>>;
    /// Items eligible at `now`, ordered by priority descending then enqueue time.
    fn list_due_queue_items(&self, now: i64, limit: usize) -> StoreResult<Vec<SyncQueueItem>>;
    fn count_queue_items(&self) -> StoreResult<usize>;
    /// Earliest `next_attempt_at` across the queue, if any item is queued.
    fn earliest_next_attempt(&self) -> StoreResult<Option<i64>>;
    /// Takes the submission lease on an item. Returns `false` if someone else holds it.
    fn claim_queue_item(&self, item_id: &str, now: i64, lease_until: i64) -> StoreResult<bool>;
    fn release_queue_claim(&self, item_id: &str) -> StoreResult<()>;
    fn delete_queue_item(&self, item_id: &str) -> StoreResult<bool>;
    /// Flips `synced` and drops the queue item. Returns `false` if already synced.
    fn mark_task_synced(&self, task_id: &str, at: i64) -> StoreResult<bool>;
    fn record_sync_failure(
        &self,
        item_id: &str,
        task_id: &str,
        at: i64,
        next_attempt_at: i64,
        error: &str,
    ) -> StoreResult<SyncFailureCounts>;
    /// Moves an unsynced task to permanent failure and drops its queue item.
    fn mark_permanently_failed(&self, task_id: &str, at: i64) -> StoreResult<bool>;
    /// Clears permanent failure and enqueues `item`. Returns `false` when the
    /// task is missing or already synced.
    fn requeue_task(&self, task_id: &str, item: &SyncQueueItem) -> StoreResult<bool>;
    fn delete_task(&self, task_id: &str) -> StoreResult<bool>;
    /// Deletes synced tasks synced before `before`.
    fn prune_synced(&self, before: i64) -> StoreResult<usize>;
}

impl OfflineTaskRepository for SqliteStore {
    fn insert_task(&self, task: &OfflineTask, item: &SyncQueueItem) -> StoreResult<()> {
        task.validate()?;
        if item.task_id != task.id {
            return Err(StoreError::InvalidData(format!(
                "queue item `{}` references `{}`, expected `{}`",
                item.id, item.task_id, task.id
            )));
        }
        self.write_tx(|tx| {
            write_task(tx, task)?;
            write_queue_item(tx, item)?;
            Ok(())
        })
    }

    fn get_task(&self, id: &str) -> StoreResult<Option<OfflineTask>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{TASK_SELECT_SQL} WHERE id = ?1;"))?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_task_row(row)?)),
            None => Ok(None),
        }
    }

    fn query_tasks(&self, index: TaskIndex) -> StoreResult<Vec<OfflineTask>> {
        let conn = self.lock()?;
        let (filter, value) = match index {
            TaskIndex::Synced(synced) => ("synced = ?1", bool_to_int(synced)),
            TaskIndex::PermanentlyFailed => ("permanently_failed = ?1", 1),
            TaskIndex::MinPriority(priority) => ("priority >= ?1", i64::from(priority)),
        };
        let mut stmt = conn.prepare(&format!(
            "{TASK_SELECT_SQL} WHERE {filter} ORDER BY priority DESC, created_at ASC, id ASC;"
        ))?;
        let mut rows = stmt.query([value])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(parse_task_row(row)?);
        }
        Ok(tasks)
    }

    fn get_queue_item(&self, task_id: &str) -> StoreResult<Option<SyncQueueItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!("{QUEUE_SELECT_SQL} WHERE task_id = ?1;"))?;
        let mut rows = stmt.query([task_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(parse_queue_row(row)?)),
            None => Ok(None),
        }
    }

    fn list_due_queue_items(&self, now: i64, limit: usize) -> StoreResult<Vec<SyncQueueItem>> {
        let conn = self.lock()?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(&format!(
            "{QUEUE_SELECT_SQL}
             WHERE next_attempt_at <= ?1
             ORDER BY priority DESC, enqueued_at ASC, id ASC
             LIMIT ?2;"
        ))?;
        let mut rows = stmt.query(params![now, limit])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_queue_row(row)?);
        }
        Ok(items)
    }

    fn count_queue_items(&self) -> StoreResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_queue;", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn earliest_next_attempt(&self) -> StoreResult<Option<i64>> {
        let conn = self.lock()?;
        let earliest: Option<i64> =
            conn.query_row("SELECT MIN(next_attempt_at) FROM sync_queue;", [], |row| {
                row.get(0)
            })?;
        Ok(earliest)
    }

    fn claim_queue_item(&self, item_id: &str, now: i64, lease_until: i64) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE sync_queue SET claimed_until = ?1
             WHERE id = ?2 AND (claimed_until IS NULL OR claimed_until <= ?3);",
            params![lease_until, item_id, now],
        )?;
        Ok(changed == 1)
    }

    fn release_queue_claim(&self, item_id: &str) -> StoreResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_queue SET claimed_until = NULL WHERE id = ?1;",
            [item_id],
        )?;
        Ok(())
    }

    fn delete_queue_item(&self, item_id: &str) -> StoreResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM sync_queue WHERE id = ?1;", [item_id])?;
        Ok(changed > 0)
    }

    fn mark_task_synced(&self, task_id: &str, at: i64) -> StoreResult<bool> {
        self.write_tx(|tx| {
            let changed = tx.execute(
                "UPDATE offline_tasks SET synced = 1, synced_at = ?1, last_error = NULL
                 WHERE id = ?2 AND synced = 0;",
                params![at, task_id],
            )?;
            tx.execute("DELETE FROM sync_queue WHERE task_id = ?1;", [task_id])?;
            Ok(changed == 1)
        })
    }

    fn record_sync_failure(
        &self,
        item_id: &str,
        task_id: &str,
        at: i64,
        next_attempt_at: i64,
        error: &str,
    ) -> StoreResult<SyncFailureCounts> {
        self.write_tx(|tx| {
            let task_changed = tx.execute(
                "UPDATE offline_tasks SET retry_count = retry_count + 1, last_error = ?1
                 WHERE id = ?2 AND synced = 0;",
                params![error, task_id],
            )?;
            if task_changed == 0 {
                return Err(StoreError::NotFound(task_id.to_string()));
            }
            tx.execute(
                "UPDATE sync_queue
                 SET
                    retry_count = retry_count + 1,
                    last_attempt_at = ?1,
                    next_attempt_at = ?2,
                    claimed_until = NULL
                 WHERE id = ?3;",
                params![at, next_attempt_at, item_id],
            )?;

            let task_retry_count: u32 = tx.query_row(
                "SELECT retry_count FROM offline_tasks WHERE id = ?1;",
                [task_id],
                |row| row.get(0),
            )?;
            let item_retry_count: u32 = tx
                .query_row(
                    "SELECT retry_count FROM sync_queue WHERE id = ?1;",
                    [item_id],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| StoreError::NotFound(item_id.to_string()))?;
            Ok(SyncFailureCounts {
                task_retry_count,
                item_retry_count,
            })
        })
    }

    fn mark_permanently_failed(&self, task_id: &str, at: i64) -> StoreResult<bool> {
        self.write_tx(|tx| {
            let changed = tx.execute(
                "UPDATE offline_tasks SET permanently_failed = 1, failed_at = ?1
                 WHERE id = ?2 AND synced = 0;",
                params![at, task_id],
            )?;
            tx.execute("DELETE FROM sync_queue WHERE task_id = ?1;", [task_id])?;
            Ok(changed == 1)
        })
    }

    fn requeue_task(&self, task_id: &str, item: &SyncQueueItem) -> StoreResult<bool> {
        self.write_tx(|tx| {
            let changed = tx.execute(
                "UPDATE offline_tasks SET permanently_failed = 0, failed_at = NULL
                 WHERE id = ?1 AND synced = 0;",
                [task_id],
            )?;
            if changed == 0 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO sync_queue (
                    id, task_id, enqueued_at, priority, retry_count,
                    last_attempt_at, next_attempt_at, claimed_until
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(task_id) DO UPDATE SET
                    retry_count = 0,
                    next_attempt_at = excluded.next_attempt_at,
                    claimed_until = NULL;",
                params![
                    item.id,
                    task_id,
                    item.enqueued_at,
                    item.priority,
                    item.retry_count,
                    item.last_attempt_at,
                    item.next_attempt_at,
                    item.claimed_until,
                ],
            )?;
            Ok(true)
        })
    }

    fn delete_task(&self, task_id: &str) -> StoreResult<bool> {
        self.write_tx(|tx| {
            tx.execute("DELETE FROM sync_queue WHERE task_id = ?1;", [task_id])?;
            let changed = tx.execute("DELETE FROM offline_tasks WHERE id = ?1;", [task_id])?;
            Ok(changed > 0)
        })
    }

    fn prune_synced(&self, before: i64) -> StoreResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM offline_tasks WHERE synced = 1 AND synced_at < ?1;",
            [before],
        )?;
        Ok(removed)
    }
}

/// Inserts or overwrites a task row verbatim.
pub(crate) fn write_task(conn: &Connection, task: &OfflineTask) -> StoreResult<()> {
    task.validate()?;
    let payload_json = serde_json::to_string(&task.payload)?;
    conn.execute(
        "INSERT INTO offline_tasks (
            id, kind, payload_json, created_at, synced, synced_at, retry_count,
            priority, permanently_failed, failed_at, last_error
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            kind = excluded.kind,
            payload_json = excluded.payload_json,
            created_at = excluded.created_at,
            synced = excluded.synced,
            synced_at = excluded.synced_at,
            retry_count = excluded.retry_count,
            priority = excluded.priority,
            permanently_failed = excluded.permanently_failed,
            failed_at = excluded.failed_at,
            last_error = excluded.last_error;",
        params![
            task.id,
            task.kind.as_str(),
            payload_json,
            task.created_at,
            bool_to_int(task.synced),
            task.synced_at,
            task.retry_count,
            task.priority,
            bool_to_int(task.permanently_failed),
            task.failed_at,
            task.last_error,
        ],
    )?;
    Ok(())
}

/// Inserts or overwrites a queue row verbatim.
pub(crate) fn write_queue_item(conn: &Connection, item: &SyncQueueItem) -> StoreResult<()> {
    // One queue item per task: a differently keyed item for the same task yields.
    conn.execute(
        "DELETE FROM sync_queue WHERE task_id = ?1 AND id != ?2;",
        params![item.task_id, item.id],
    )?;
    conn.execute(
        "INSERT INTO sync_queue (
            id, task_id, enqueued_at, priority, retry_count,
            last_attempt_at, next_attempt_at, claimed_until
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            task_id = excluded.task_id,
            enqueued_at = excluded.enqueued_at,
            priority = excluded.priority,
            retry_count = excluded.retry_count,
            last_attempt_at = excluded.last_attempt_at,
            next_attempt_at = excluded.next_attempt_at,
            claimed_until = excluded.claimed_until;",
        params![
            item.id,
            item.task_id,
            item.enqueued_at,
            item.priority,
            item.retry_count,
            item.last_attempt_at,
            item.next_attempt_at,
            item.claimed_until,
        ],
    )?;
    Ok(())
}

/// Merges an imported task. A stored task that already synced, or failed
/// permanently while the import has not synced it, is kept; otherwise the
/// import wins but never lowers the retry count.
pub(crate) fn restore_task(conn: &Connection, task: &OfflineTask) -> StoreResult<bool> {
    let existing = conn
        .query_row(
            "SELECT synced, permanently_failed, retry_count FROM offline_tasks WHERE id = ?1;",
            [&task.id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? != 0,
                    row.get::<_, i64>(1)? != 0,
                    row.get::<_, u32>(2)?,
                ))
            },
        )
        .optional()?;
    match existing {
        Some((true, _, _)) => Ok(false),
        Some((false, true, _)) if !task.synced => Ok(false),
        Some((false, _, retry_count)) if retry_count > task.retry_count => {
            let merged = OfflineTask {
                retry_count,
                ..task.clone()
            };
            write_task(conn, &merged)?;
            Ok(true)
        }
        _ => {
            write_task(conn, task)?;
            Ok(true)
        }
    }
}

/// Merges an imported queue item unless its task is synced or permanently
/// failed in the store.
pub(crate) fn restore_queue_item(conn: &Connection, item: &SyncQueueItem) -> StoreResult<bool> {
    let settled: bool = conn
        .query_row(
            "SELECT synced = 1 OR permanently_failed = 1 FROM offline_tasks WHERE id = ?1;",
            [&item.task_id],
            |row| row.get::<_, i64>(0).map(|flag| flag != 0),
        )
        .optional()?
        .unwrap_or(false);
    if settled {
        return Ok(false);
    }
    write_queue_item(conn, item)?;
    Ok(true)
}

/// Drops queue rows whose task no longer needs submitting.
pub(crate) fn purge_settled_queue_items(conn: &Connection) -> StoreResult<usize> {
    let removed = conn.execute(
        "DELETE FROM sync_queue
         WHERE task_id IN (
            SELECT id FROM offline_tasks WHERE synced = 1 OR permanently_failed = 1
         );",
        [],
    )?;
    Ok(removed)
}

pub(crate) fn select_all_tasks(conn: &Connection) -> StoreResult<Vec<OfflineTask>> {
    let mut stmt = conn.prepare(&format!("{TASK_SELECT_SQL} ORDER BY id ASC;"))?;
    let mut rows = stmt.query([])?;
    let mut tasks = Vec::new();
    while let Some(row) = rows.next()? {
        tasks.push(parse_task_row(row)?);
    }
    Ok(tasks)
}

pub(crate) fn select_all_queue_items(conn: &Connection) -> StoreResult<Vec<SyncQueueItem>> {
    let mut stmt = conn.prepare(&format!("{QUEUE_SELECT_SQL} ORDER BY id ASC;"))?;
    let mut rows = stmt.query([])?;
    let mut items = Vec::new();
    while let Some(row) = rows.next()? {
        items.push(parse_queue_row(row)?);
    }
    Ok(items)
}

fn parse_task_row(row: &Row<'_>) -> StoreResult<OfflineTask> {
    let id: String = row.get("id")?;
    let kind_text: String = row.get("kind")?;
    let kind = TaskKind::parse(&kind_text).ok_or_else(|| {
        StoreError::InvalidData(format!("invalid task kind `{kind_text}` in offline_tasks.kind"))
    })?;
    let payload_json: String = row.get("payload_json")?;
    let payload: TaskPayload = serde_json::from_str(&payload_json).map_err(|err| {
        StoreError::InvalidData(format!(
            "invalid payload for task `{id}` in offline_tasks.payload_json: {err}"
        ))
    })?;

    let task = OfflineTask {
        kind,
        payload,
        created_at: row.get("created_at")?,
        synced: parse_flag(row, "synced", "offline_tasks")?,
        synced_at: row.get("synced_at")?,
        retry_count: row.get("retry_count")?,
        priority: row.get("priority")?,
        permanently_failed: parse_flag(row, "permanently_failed", "offline_tasks")?,
        failed_at: row.get("failed_at")?,
        last_error: row.get("last_error")?,
        id,
    };
    task.validate()
        .map_err(|err| StoreError::InvalidData(format!("task `{}`: {err}", task.id)))?;
    Ok(task)
}

fn parse_queue_row(row: &Row<'_>) -> StoreResult<SyncQueueItem> {
    Ok(SyncQueueItem {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        enqueued_at: row.get("enqueued_at")?,
        priority: row.get("priority")?,
        retry_count: row.get("retry_count")?,
        last_attempt_at: row.get("last_attempt_at")?,
        next_attempt_at: row.get("next_attempt_at")?,
        claimed_until: row.get("claimed_until")?,
    })
}

#[cfg(test)]
mod tests {
    use super::{OfflineTaskRepository, TaskIndex};
    use crate::model::offline_task::{OfflineTask, SyncQueueItem, TaskPayload};
    use crate::repo::SqliteStore;

    fn enqueue(store: &SqliteStore, priority: i32, at: i64) -> (OfflineTask, SyncQueueItem) {
        let task = OfflineTask::new(
            TaskPayload::Journal {
                entry_id: format!("entry-{priority}-{at}"),
                content: "dear diary".to_string(),
                mood: None,
            },
            priority,
            at,
        );
        let item = SyncQueueItem::for_task(&task, at);
        store.insert_task(&task, &item).unwrap();
        (task, item)
    }

    #[test]
    fn due_items_order_by_priority_then_fifo() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (low, _) = enqueue(&store, 1, 10);
        let (high_late, _) = enqueue(&store, 5, 30);
        let (high_early, _) = enqueue(&store, 5, 20);

        let order: Vec<String> = store
            .list_due_queue_items(100, 10)
            .unwrap()
            .into_iter()
            .map(|item| item.task_id)
            .collect();
        assert_eq!(order, vec![high_early.id, high_late.id, low.id]);
    }

    #[test]
    fn claim_is_exclusive_until_lease_expires() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (_, item) = enqueue(&store, 1, 0);

        assert!(store.claim_queue_item(&item.id, 100, 200).unwrap());
        assert!(!store.claim_queue_item(&item.id, 150, 250).unwrap());
        assert!(store.claim_queue_item(&item.id, 200, 300).unwrap());
    }

    #[test]
    fn mark_synced_flips_once_and_removes_queue_item() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (task, _) = enqueue(&store, 1, 0);

        assert!(store.mark_task_synced(&task.id, 50).unwrap());
        assert!(!store.mark_task_synced(&task.id, 60).unwrap());

        let loaded = store.get_task(&task.id).unwrap().unwrap();
        assert!(loaded.synced);
        assert_eq!(loaded.synced_at, Some(50));
        assert!(store.get_queue_item(&task.id).unwrap().is_none());
    }

    #[test]
    fn failure_counts_accumulate_and_backoff_gates_item() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (task, item) = enqueue(&store, 1, 0);

        let first = store
            .record_sync_failure(&item.id, &task.id, 10, 1_010, "offline")
            .unwrap();
        let second = store
            .record_sync_failure(&item.id, &task.id, 20, 2_020, "offline")
            .unwrap();
        assert_eq!(first.task_retry_count, 1);
        assert_eq!(second.item_retry_count, 2);

        assert_eq!(store.earliest_next_attempt().unwrap(), Some(2_020));
        assert!(store.list_due_queue_items(2_000, 10).unwrap().is_empty());
        assert_eq!(store.list_due_queue_items(2_020, 10).unwrap().len(), 1);
    }

    #[test]
    fn permanent_failure_keeps_task_and_requeue_restores_it() {
        let store = SqliteStore::open_in_memory().unwrap();
        let (task, item) = enqueue(&store, 2, 0);
        store
            .record_sync_failure(&item.id, &task.id, 10, 20, "500")
            .unwrap();

        assert!(store.mark_permanently_failed(&task.id, 30).unwrap());
        assert_eq!(store.count_queue_items().unwrap(), 0);
        let failed = store.query_tasks(TaskIndex::PermanentlyFailed).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 1);

        let fresh = SyncQueueItem::for_task(&task, 40);
        assert!(store.requeue_task(&task.id, &fresh).unwrap());
        let restored = store.get_task(&task.id).unwrap().unwrap();
        assert!(!restored.permanently_failed);
        assert_eq!(restored.retry_count, 1);
        assert_eq!(store.get_queue_item(&task.id).unwrap().unwrap().retry_count, 0);
    }
}
