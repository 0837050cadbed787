//! Request validation shared by every write path.
//!
//! # Invariants
//! - Validation runs before anything touches the store.
//! - Record ids are short, printable and URL-safe so they can travel inside
//!   notification tags and navigation targets unchanged.

use once_cell::sync::Lazy;
use regex::Regex;
use std::error::Error;
use std::fmt::{Display, Formatter};

static RECORD_ID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]{0,127}$").expect("record id pattern is valid")
});

/// Synchronous rejection of a malformed schedule/task request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyId,
    InvalidId(String),
    EmptyTitle { id: String },
    InvalidDueAt { id: String, due_at: i64 },
    NonPositivePriority(i32),
    NegativeReminderOffset { event_id: String, minutes: i64 },
    KindMismatch { declared: String, payload: String },
    InvalidPayload(String),
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyId => write!(f, "record id cannot be empty"),
            Self::InvalidId(id) => write!(
                f,
                "record id `{id}` must match [A-Za-z0-9][A-Za-z0-9_.:-]{{0,127}}"
            ),
            Self::EmptyTitle { id } => write!(f, "notification `{id}` has an empty title"),
            Self::InvalidDueAt { id, due_at } => {
                write!(f, "notification `{id}` has invalid due_at {due_at}")
            }
            Self::NonPositivePriority(priority) => {
                write!(f, "priority must be positive, got {priority}")
            }
            Self::NegativeReminderOffset { event_id, minutes } => write!(
                f,
                "calendar event `{event_id}` has negative reminder offset {minutes}"
            ),
            Self::KindMismatch { declared, payload } => write!(
                f,
                "declared kind `{declared}` does not match payload kind `{payload}`"
            ),
            Self::InvalidPayload(message) => write!(f, "invalid payload: {message}"),
        }
    }
}

impl Error for ValidationError {}

/// Checks a caller-supplied record id.
pub fn validate_record_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::EmptyId);
    }
    if !RECORD_ID_PATTERN.is_match(id) {
        return Err(ValidationError::InvalidId(id.to_string()));
    }
    Ok(())
}

pub(crate) fn require_non_blank(value: &str, field: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidPayload(format!(
            "`{field}` cannot be empty"
        )));
    }
    Ok(())
}
