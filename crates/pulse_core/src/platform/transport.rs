//! Network submission of offline tasks.

use crate::model::offline_task::OfflineTask;
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    Offline,
    Timeout,
    /// Non-success HTTP status from the sync endpoint.
    Status(u16),
    Other(String),
}

impl Display for NetworkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "network unreachable"),
            Self::Timeout => write!(f, "request timed out"),
            Self::Status(code) => write!(f, "sync endpoint returned status {code}"),
            Self::Other(message) => write!(f, "{message}"),
        }
    }
}

impl Error for NetworkError {}

/// Replays one offline task against the remote endpoint.
///
/// Implementations should treat the task id as an idempotency key; the core
/// avoids resubmitting synced tasks but cannot see a response that was lost.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn submit(&self, task: &OfflineTask) -> Result<(), NetworkError>;
}
