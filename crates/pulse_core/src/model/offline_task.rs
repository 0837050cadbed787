//! Offline mutation records and their sync queue entries.
//!
//! # Invariants
//! - `synced` flips from `false` to `true` at most once.
//! - `retry_count` on a task counts lifetime submission failures and never
//!   decreases; the queue item's `retry_count` counts the current round.
//! - A permanently failed task has no queue item until it is re-triggered.

use crate::model::validation::{require_non_blank, validate_record_id, ValidationError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of an offline mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Journal,
    Todo,
    Habit,
    Checkin,
    Custom,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Journal => "journal",
            Self::Todo => "todo",
            Self::Habit => "habit",
            Self::Checkin => "checkin",
            Self::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "journal" => Some(Self::Journal),
            "todo" => Some(Self::Todo),
            "habit" => Some(Self::Habit),
            "checkin" => Some(Self::Checkin),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }
}

/// Typed mutation body, tagged by the same `kind` as the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    Journal {
        entry_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mood: Option<String>,
    },
    Todo {
        todo_id: String,
        title: String,
        #[serde(default)]
        completed: bool,
    },
    Habit {
        habit_id: String,
        /// Local calendar day, `YYYY-MM-DD`.
        completed_on: String,
    },
    Checkin {
        checkin_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        score: Option<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    Custom {
        name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Journal { .. } => TaskKind::Journal,
            Self::Todo { .. } => TaskKind::Todo,
            Self::Habit { .. } => TaskKind::Habit,
            Self::Checkin { .. } => TaskKind::Checkin,
            Self::Custom { .. } => TaskKind::Custom,
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::Journal { entry_id, .. } => require_non_blank(entry_id, "entry_id"),
            Self::Todo { todo_id, title, .. } => {
                require_non_blank(todo_id, "todo_id")?;
                require_non_blank(title, "title")
            }
            Self::Habit {
                habit_id,
                completed_on,
            } => {
                require_non_blank(habit_id, "habit_id")?;
                require_non_blank(completed_on, "completed_on")
            }
            Self::Checkin {
                checkin_id, score, ..
            } => {
                require_non_blank(checkin_id, "checkin_id")?;
                match score {
                    Some(value) if *value > 10 => Err(ValidationError::InvalidPayload(format!(
                        "checkin score must be within 0..=10, got {value}"
                    ))),
                    _ => Ok(()),
                }
            }
            Self::Custom { name, .. } => require_non_blank(name, "name"),
        }
    }
}

/// A data mutation created while the network was unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineTask {
    pub id: String,
    pub kind: TaskKind,
    pub payload: TaskPayload,
    pub created_at: i64,
    pub synced: bool,
    pub synced_at: Option<i64>,
    pub retry_count: u32,
    pub priority: i32,
    pub permanently_failed: bool,
    pub failed_at: Option<i64>,
    pub last_error: Option<String>,
}

impl OfflineTask {
    /// Creates an unsynced task with a generated id.
    pub fn new(payload: TaskPayload, priority: i32, created_at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind: payload.kind(),
            payload,
            created_at,
            synced: false,
            synced_at: None,
            retry_count: 0,
            priority,
            permanently_failed: false,
            failed_at: None,
            last_error: None,
        }
    }

    /// Returns whether the automatic sync loop may still pick this task up.
    pub fn is_retryable(&self) -> bool {
        !self.synced && !self.permanently_failed
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_record_id(&self.id)?;
        if self.priority <= 0 {
            return Err(ValidationError::NonPositivePriority(self.priority));
        }
        if self.kind != self.payload.kind() {
            return Err(ValidationError::KindMismatch {
                declared: self.kind.as_str().to_string(),
                payload: self.payload.kind().as_str().to_string(),
            });
        }
        self.payload.validate()
    }
}

/// Queue entry driving submission of one unsynced task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub id: String,
    pub task_id: String,
    pub enqueued_at: i64,
    pub priority: i32,
    pub retry_count: u32,
    pub last_attempt_at: Option<i64>,
    /// Backoff gate: the item is not eligible before this instant.
    pub next_attempt_at: i64,
    /// Claim lease held by the runner currently submitting the task.
    pub claimed_until: Option<i64>,
}

impl SyncQueueItem {
    pub fn for_task(task: &OfflineTask, enqueued_at: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            enqueued_at,
            priority: task.priority,
            retry_count: 0,
            last_attempt_at: None,
            next_attempt_at: enqueued_at,
            claimed_until: None,
        }
    }
}
