//! Multi-channel notification router.

use crate::notify::notification::{Channel, Notification, NotificationRequest};
use crate::notify::push::{PushBackend, PushPermission};
use crate::state::now_millis;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Default number of in-app notifications kept in the inbox.
const DEFAULT_INBOX_LIMIT: usize = 50;

/// UI listener for in-app notifications.
pub type InAppListener = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Token returned by [`NotificationRouter::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle(u64);

/// Routes notifications to the in-app and OS push channels.
pub struct NotificationRouter {
    listeners: Mutex<Vec<(ListenerHandle, InAppListener)>>,
    next_handle: AtomicU64,
    inbox: Mutex<VecDeque<Notification>>,
    inbox_limit: usize,
    push: Arc<dyn PushBackend>,
    /// Set once the push permission prompt has been shown.
    permission_asked: AtomicBool,
}

impl NotificationRouter {
    pub fn new(push: Arc<dyn PushBackend>) -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            inbox: Mutex::new(VecDeque::new()),
            inbox_limit: DEFAULT_INBOX_LIMIT,
            push,
            permission_asked: AtomicBool::new(false),
        }
    }

    /// Override the inbox bound.
    #[must_use]
    pub fn with_inbox_limit(mut self, limit: usize) -> Self {
        self.inbox_limit = limit.max(1);
        self
    }

    /// Register a UI listener for in-app notifications.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let handle = ListenerHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((handle, Arc::new(listener)));
        handle
    }

    pub fn unsubscribe(&self, handle: ListenerHandle) -> bool {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        listeners.len() != before
    }

    /// Deliver `request` on each of its channels and return the notification
    /// as built. Channel failures are logged, never returned.
    pub async fn send(&self, request: NotificationRequest) -> Notification {
        let notification = Notification {
            id: uuid::Uuid::new_v4().to_string(),
            title: request.title,
            message: request.message,
            kind: request.kind,
            timestamp: now_millis(),
            read: false,
            action: request.action,
        };

        if request.channels.contains(&Channel::InApp) {
            self.deliver_in_app(&notification);
        }
        if request.channels.contains(&Channel::OsPush) {
            self.deliver_push(&notification).await;
        }
        notification
    }

    fn deliver_in_app(&self, notification: &Notification) {
        {
            let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
            inbox.push_front(notification.clone());
            inbox.truncate(self.inbox_limit);
        }

        let listeners: Vec<InAppListener> = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(notification);
        }
    }

    async fn deliver_push(&self, notification: &Notification) {
        let permission = match self.push.permission() {
            PushPermission::Undetermined => {
                if self.permission_asked.swap(true, Ordering::SeqCst) {
                    debug!("push permission already requested, skipping");
                    return;
                }
                self.push.request_permission().await
            }
            other => other,
        };

        if permission != PushPermission::Granted {
            debug!(?permission, "push channel unavailable, skipping");
            return;
        }

        if let Err(e) = self
            .push
            .show(&notification.title, &notification.message)
            .await
        {
            warn!(error = %e, "os push delivery failed");
        }
    }

    /// In-app notifications, newest first.
    pub fn inbox(&self) -> Vec<Notification> {
        self.inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn unread_count(&self) -> usize {
        self.inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|n| !n.read)
            .count()
    }

    /// Mark one notification read. Returns `true` if it was in the inbox.
    pub fn mark_read(&self, id: &str) -> bool {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        match inbox.iter_mut().find(|n| n.id == id) {
            Some(n) => {
                n.read = true;
                true
            }
            None => false,
        }
    }

    pub fn mark_all_read(&self) {
        let mut inbox = self.inbox.lock().unwrap_or_else(|e| e.into_inner());
        for n in inbox.iter_mut() {
            n.read = true;
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::notify::notification::NotificationKind;
    use crate::notify::push::LogPushBackend;

    fn router(push: Arc<LogPushBackend>) -> NotificationRouter {
        NotificationRouter::new(push)
    }

    #[tokio::test]
    async fn in_app_fans_out_to_every_listener() {
        let push = Arc::new(LogPushBackend::granted());
        let router = router(Arc::clone(&push));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = Arc::clone(&seen);
            router.subscribe(move |n| seen.lock().unwrap().push(n.title.clone()));
        }

        router
            .send(NotificationRequest::new("Hello", "World").kind(NotificationKind::Success))
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["Hello", "Hello"]);
        assert!(push.delivered().is_empty());
    }

    #[tokio::test]
    async fn push_only_request_skips_in_app() {
        let push = Arc::new(LogPushBackend::granted());
        let router = router(Arc::clone(&push));

        router
            .send(NotificationRequest::new("Ping", "Body").channels(&[Channel::OsPush]))
            .await;

        assert!(router.inbox().is_empty());
        assert_eq!(push.delivered(), vec![("Ping".to_owned(), "Body".to_owned())]);
    }

    #[tokio::test]
    async fn undetermined_permission_is_requested_once() {
        let push = Arc::new(LogPushBackend::new(
            PushPermission::Undetermined,
            PushPermission::Granted,
        ));
        let router = router(Arc::clone(&push));
        let request = NotificationRequest::new("A", "B").channels(&[Channel::OsPush]);

        router.send(request.clone()).await;
        router.send(request).await;

        assert_eq!(push.permission_requests(), 1);
        assert_eq!(push.delivered().len(), 2);
    }

    #[tokio::test]
    async fn refused_request_sends_nothing() {
        let push = Arc::new(LogPushBackend::new(
            PushPermission::Undetermined,
            PushPermission::Denied,
        ));
        let router = router(Arc::clone(&push));

        router
            .send(NotificationRequest::new("A", "B").channels(&[Channel::InApp, Channel::OsPush]))
            .await;

        assert_eq!(push.permission_requests(), 1);
        assert!(push.delivered().is_empty());
        assert_eq!(router.inbox().len(), 1);
    }

    #[tokio::test]
    async fn denied_permission_is_silently_skipped() {
        let push = Arc::new(LogPushBackend::new(
            PushPermission::Denied,
            PushPermission::Granted,
        ));
        let router = router(Arc::clone(&push));

        router
            .send(NotificationRequest::new("A", "B").channels(&[Channel::OsPush]))
            .await;

        assert_eq!(push.permission_requests(), 0);
        assert!(push.delivered().is_empty());
    }

    #[tokio::test]
    async fn inbox_tracks_read_state_and_is_bounded() {
        let router = router(Arc::new(LogPushBackend::granted())).with_inbox_limit(2);
        router.send(NotificationRequest::new("1", "")).await;
        let second = router.send(NotificationRequest::new("2", "")).await;
        router.send(NotificationRequest::new("3", "")).await;

        let titles: Vec<String> = router.inbox().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["3", "2"]);
        assert_eq!(router.unread_count(), 2);

        assert!(router.mark_read(&second.id));
        assert_eq!(router.unread_count(), 1);
        router.mark_all_read();
        assert_eq!(router.unread_count(), 0);
        assert!(!router.mark_read("missing"));
    }

    #[tokio::test]
    async fn unsubscribed_listener_is_not_called() {
        let router = router(Arc::new(LogPushBackend::granted()));
        let seen = Arc::new(Mutex::new(0usize));
        let counter = Arc::clone(&seen);
        let handle = router.subscribe(move |_| *counter.lock().unwrap() += 1);

        assert!(router.unsubscribe(handle));
        router.send(NotificationRequest::new("A", "B")).await;
        assert_eq!(*seen.lock().unwrap(), 0);
    }
}
