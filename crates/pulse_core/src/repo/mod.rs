//! Persistent store contracts and the SQLite implementation.
//!
//! # Responsibility
//! - Define the indexed, transactional record store the services run on.
//! - Keep SQL details inside the persistence boundary.
//!
//! # Invariants
//! - Every write commits before returning; there is no in-memory-only success.
//! - Status changes are conditional updates, so the database itself decides
//!   which of two racing writers wins.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::DbError;
use crate::model::validation::ValidationError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod notification_repo;
pub mod retry;
pub mod snapshot_repo;
mod sqlite_store;
pub mod task_repo;

pub use notification_repo::{
    ClaimOutcome, ClaimSettlement, NotificationIndex, NotificationRepository, PendingPolicy,
    StatusChange, TransitionOutcome, UpsertOutcome,
};
pub use retry::{backoff_delay_ms, retry_storage, StorageRetryPolicy};
pub use snapshot_repo::{RestoreReport, SnapshotRepository, StoreSnapshot};
pub use sqlite_store::SqliteStore;
pub use task_repo::{OfflineTaskRepository, SyncFailureCounts, TaskIndex};

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage failure surfaced to callers.
#[derive(Debug)]
pub enum StoreError {
    Db(DbError),
    Validation(ValidationError),
    NotFound(String),
    InvalidData(String),
    Serialization(serde_json::Error),
    Poisoned,
}

impl StoreError {
    /// Returns whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Db(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "storage error: {err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::Serialization(err) => write!(f, "payload serialization failed: {err}"),
            Self::Poisoned => write!(f, "store connection mutex poisoned"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Serialization(err) => Some(err),
            Self::NotFound(_) | Self::InvalidData(_) | Self::Poisoned => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ValidationError> for StoreError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// The full storage capability the engine depends on.
pub trait PersistentStore:
    NotificationRepository + OfflineTaskRepository + SnapshotRepository + Send + Sync
{
}

impl<T> PersistentStore for T where
    T: NotificationRepository + OfflineTaskRepository + SnapshotRepository + Send + Sync
{
}
