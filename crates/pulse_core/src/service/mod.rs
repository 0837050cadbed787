//! Reminder scheduling and offline sync services.
//!
//! # Responsibility
//! - Turn persisted records into timers, presentations and network replays.
//! - Keep UI/host layers decoupled from storage details.
//!
//! # Invariants
//! - The persisted status is authoritative; in-memory timers are a cache.
//! - Service APIs never bypass repository validation/persistence contracts.

use crate::config::ConfigError;
use crate::model::notification::NotificationStatus;
use crate::model::validation::ValidationError;
use crate::platform::PresentError;
use crate::repo::StoreError;
use crate::transfer::TransferError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod dispatcher;
pub mod engine;
pub mod planner;
pub mod scheduler;
pub mod sync;

pub type EngineResult<T> = Result<T, EngineError>;

/// Error surfaced by service and engine calls.
#[derive(Debug)]
pub enum EngineError {
    Config(ConfigError),
    Validation(ValidationError),
    Storage(StoreError),
    Permission(PresentError),
    NotFound(String),
    /// The id is already pending with different content.
    Conflict {
        id: String,
    },
    InvalidState {
        id: String,
        status: NotificationStatus,
    },
    Transfer(TransferError),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "validation failed: {err}"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::Permission(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "not found: {id}"),
            Self::Conflict { id } => write!(
                f,
                "notification `{id}` is already scheduled with different content"
            ),
            Self::InvalidState { id, status } => write!(
                f,
                "notification `{id}` is {} and does not accept this action",
                status.as_str()
            ),
            Self::Transfer(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::Permission(err) => Some(err),
            Self::Transfer(err) => Some(err),
            Self::NotFound(_) | Self::Conflict { .. } | Self::InvalidState { .. } => None,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Validation(err) => Self::Validation(err),
            other => Self::Storage(other),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<ValidationError> for EngineError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<TransferError> for EngineError {
    fn from(value: TransferError) -> Self {
        Self::Transfer(value)
    }
}
