//! OS-level push delivery behind a permission gate.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Mutex;
use tracing::info;

/// Platform permission for OS push notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PushPermission {
    /// The user has not been asked yet.
    #[default]
    Undetermined,
    Granted,
    Denied,
}

/// Platform push mechanism.
#[async_trait]
pub trait PushBackend: Send + Sync {
    /// Current permission state.
    fn permission(&self) -> PushPermission;

    /// Ask the user for permission and return the outcome.
    async fn request_permission(&self) -> PushPermission;

    /// Display a push notification. Only called when permission is granted.
    async fn show(&self, title: &str, body: &str) -> Result<()>;
}

/// Push backend that writes notifications to the log.
///
/// Used on hosts without a native notification center and in tests. It keeps
/// a record of every push it displayed.
#[derive(Debug)]
pub struct LogPushBackend {
    permission: Mutex<PushPermission>,
    /// Answer given when permission is requested.
    answer: PushPermission,
    delivered: Mutex<Vec<(String, String)>>,
    requests: Mutex<usize>,
}

impl LogPushBackend {
    /// Backend in `initial` state that answers permission requests with `answer`.
    pub fn new(initial: PushPermission, answer: PushPermission) -> Self {
        Self {
            permission: Mutex::new(initial),
            answer,
            delivered: Mutex::new(Vec::new()),
            requests: Mutex::new(0),
        }
    }

    /// Backend with permission already granted.
    pub fn granted() -> Self {
        Self::new(PushPermission::Granted, PushPermission::Granted)
    }

    /// `(title, body)` of every push shown so far.
    pub fn delivered(&self) -> Vec<(String, String)> {
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// How many times permission was requested.
    pub fn permission_requests(&self) -> usize {
        *self.requests.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for LogPushBackend {
    fn default() -> Self {
        Self::granted()
    }
}

#[async_trait]
impl PushBackend for LogPushBackend {
    fn permission(&self) -> PushPermission {
        *self.permission.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn request_permission(&self) -> PushPermission {
        *self.requests.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        let mut permission = self.permission.lock().unwrap_or_else(|e| e.into_inner());
        *permission = self.answer;
        *permission
    }

    async fn show(&self, title: &str, body: &str) -> Result<()> {
        info!(title, body, "os push notification");
        self.delivered
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((title.to_owned(), body.to_owned()));
        Ok(())
    }
}
