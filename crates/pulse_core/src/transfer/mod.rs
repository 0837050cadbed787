//! JSON export/import of the whole store.
//!
//! # Responsibility
//! - Serialize every persisted record into one versioned document.
//! - Restore such a document into a store, merging by record id.
//!
//! # Invariants
//! - Records round-trip verbatim, including status and timestamps.
//! - Documents with an unknown `version` are rejected before any write.

use crate::model::notification::ScheduledNotification;
use crate::model::offline_task::{OfflineTask, SyncQueueItem};
use crate::repo::{StoreError, StoreSnapshot};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const EXPORT_FORMAT_VERSION: u32 = 1;

/// Top-level export document: `{version, timestamp, entries}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportDocument {
    pub version: u32,
    /// Unix epoch milliseconds the export was taken.
    pub timestamp: i64,
    pub entries: Vec<ExportEntry>,
}

/// One persisted record, tagged by its store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportEntry {
    Notification(ScheduledNotification),
    OfflineTask(OfflineTask),
    SyncQueueItem(SyncQueueItem),
}

#[derive(Debug)]
pub enum TransferError {
    UnsupportedVersion(u32),
    Json(serde_json::Error),
    Store(StoreError),
}

impl Display for TransferError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedVersion(version) => write!(
                f,
                "unsupported export version {version}; expected {EXPORT_FORMAT_VERSION}"
            ),
            Self::Json(err) => write!(f, "invalid export document: {err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for TransferError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::UnsupportedVersion(_) => None,
            Self::Json(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<StoreError> for TransferError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl ExportDocument {
    pub fn from_snapshot(snapshot: StoreSnapshot, timestamp: i64) -> Self {
        let StoreSnapshot {
            notifications,
            tasks,
            queue_items,
        } = snapshot;
        let entries = notifications
            .into_iter()
            .map(ExportEntry::Notification)
            .chain(tasks.into_iter().map(ExportEntry::OfflineTask))
            .chain(queue_items.into_iter().map(ExportEntry::SyncQueueItem))
            .collect();
        Self {
            version: EXPORT_FORMAT_VERSION,
            timestamp,
            entries,
        }
    }

    /// Splits entries back into per-store lists after checking the version.
    pub fn into_snapshot(self) -> Result<StoreSnapshot, TransferError> {
        if self.version != EXPORT_FORMAT_VERSION {
            return Err(TransferError::UnsupportedVersion(self.version));
        }
        let mut snapshot = StoreSnapshot::default();
        for entry in self.entries {
            match entry {
                ExportEntry::Notification(record) => snapshot.notifications.push(record),
                ExportEntry::OfflineTask(task) => snapshot.tasks.push(task),
                ExportEntry::SyncQueueItem(item) => snapshot.queue_items.push(item),
            }
        }
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String, TransferError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, TransferError> {
        Ok(serde_json::from_str(text)?)
    }
}
