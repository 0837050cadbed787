//! Notification presentation and click navigation capabilities.

use crate::model::notification::{NotificationAction, ScheduledNotification};
use async_trait::async_trait;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// What the presenter is asked to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentRequest {
    pub notification_id: String,
    pub title: String,
    pub body: String,
    pub icon: Option<String>,
    pub badge: Option<String>,
    pub tag: Option<String>,
    pub require_interaction: bool,
    pub silent: bool,
    pub actions: Vec<NotificationAction>,
}

impl PresentRequest {
    pub fn for_notification(record: &ScheduledNotification) -> Self {
        Self {
            notification_id: record.id.clone(),
            title: record.title.clone(),
            body: record.body.clone(),
            icon: record.icon.clone(),
            badge: record.badge.clone(),
            tag: record.tag.clone(),
            require_interaction: record.require_interaction,
            silent: record.silent,
            actions: vec![
                NotificationAction::View,
                NotificationAction::Snooze,
                NotificationAction::Dismiss,
            ],
        }
    }
}

/// Presentation failure reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresentError {
    /// Notification permission is not granted. `permanent` is set when the
    /// user has blocked notifications rather than just not answered yet.
    PermissionDenied { permanent: bool },
    /// Presentation surface temporarily unavailable.
    Unavailable(String),
}

impl Display for PresentError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PermissionDenied { permanent: true } => {
                write!(f, "notification permission permanently denied")
            }
            Self::PermissionDenied { permanent: false } => {
                write!(f, "notification permission not granted")
            }
            Self::Unavailable(message) => write!(f, "presentation unavailable: {message}"),
        }
    }
}

impl Error for PresentError {}

/// Displays notifications on the host platform.
#[async_trait]
pub trait NotificationPresenter: Send + Sync {
    async fn present(&self, request: &PresentRequest) -> Result<(), PresentError>;
}

/// Brings the app to the foreground at an in-app target.
pub trait AppNavigator: Send + Sync {
    fn open(&self, target: &str);
}
