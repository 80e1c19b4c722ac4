//! Notification value types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Visual category of a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
    Update,
}

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// Toast/banner inside the running application.
    InApp,
    /// Operating-system level push notification.
    OsPush,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InApp => f.write_str("in-app"),
            Self::OsPush => f.write_str("os-push"),
        }
    }
}

/// Optional call-to-action attached to a notification.
#[derive(Clone)]
pub struct NotificationAction {
    pub label: String,
    handler: Arc<dyn Fn() + Send + Sync>,
}

impl NotificationAction {
    pub fn new<F>(label: impl Into<String>, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            handler: Arc::new(handler),
        }
    }

    /// Run the action's handler.
    pub fn invoke(&self) {
        (self.handler)();
    }
}

impl fmt::Debug for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationAction")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// A delivered notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: String,
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    /// Epoch millis at delivery.
    pub timestamp: i64,
    pub read: bool,
    pub action: Option<NotificationAction>,
}

/// What a caller asks the router to send.
#[derive(Debug, Clone)]
pub struct NotificationRequest {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    pub channels: Vec<Channel>,
    pub action: Option<NotificationAction>,
}

impl NotificationRequest {
    /// An `info` notification on the in-app channel.
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind: NotificationKind::Info,
            channels: vec![Channel::InApp],
            action: None,
        }
    }

    #[must_use]
    pub fn kind(mut self, kind: NotificationKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn channels(mut self, channels: &[Channel]) -> Self {
        self.channels = channels.to_vec();
        self
    }

    #[must_use]
    pub fn action<F>(mut self, label: impl Into<String>, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.action = Some(NotificationAction::new(label, handler));
        self
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn request_defaults_to_in_app_info() {
        let request = NotificationRequest::new("Title", "Body");
        assert_eq!(request.kind, NotificationKind::Info);
        assert_eq!(request.channels, vec![Channel::InApp]);
        assert!(request.action.is_none());
    }

    #[test]
    fn action_handler_runs_on_invoke() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let request = NotificationRequest::new("Update", "Ready").action("Install", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let action = request.action.unwrap();
        assert_eq!(action.label, "Install");
        action.invoke();
        action.invoke();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn channel_names() {
        assert_eq!(Channel::InApp.to_string(), "in-app");
        assert_eq!(
            serde_json::to_string(&Channel::OsPush).unwrap(),
            r#""os-push""#
        );
    }
}
