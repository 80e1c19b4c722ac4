//! In-process broadcast fabric shared by all instances of one user.
//!
//! Delivery is best-effort among currently-live instances: FIFO per source
//! (one broadcast channel), unordered across sources from a handler's point
//! of view, and lossy for an instance that falls more than `capacity` events
//! behind. An instance never receives its own events.

use crate::sync::event::SyncEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Callback invoked for every event delivered to an instance.
pub type SyncHandler = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

type HandlerList = Arc<Mutex<Vec<(SubscriptionHandle, SyncHandler)>>>;

/// The shared channel all instances of one user context join.
#[derive(Clone)]
pub struct SyncHub {
    tx: broadcast::Sender<SyncEvent>,
}

impl SyncHub {
    /// Create a hub buffering up to `capacity` undelivered events per instance.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Join with a fresh random instance id.
    ///
    /// Must be called from within a tokio runtime: the bus spawns a delivery task.
    pub fn join(&self) -> EventBus {
        self.join_as(uuid::Uuid::new_v4().to_string())
    }

    /// Join with a caller-chosen stable instance id.
    pub fn join_as(&self, instance_id: impl Into<String>) -> EventBus {
        let instance_id = instance_id.into();
        let rx = self.tx.subscribe();
        let handlers: HandlerList = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(deliver(
            instance_id.clone(),
            rx,
            Arc::clone(&handlers),
            cancel.clone(),
        ));
        debug!(instance = %instance_id, "instance joined sync hub");

        EventBus {
            instance_id,
            tx: self.tx.clone(),
            handlers,
            next_handle: AtomicU64::new(1),
            cancel,
        }
    }

    /// Number of instances currently able to receive events.
    pub fn live_instances(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// One instance's view of the hub.
///
/// Dropping the bus (or calling [`EventBus::leave`]) stops delivery to it.
pub struct EventBus {
    instance_id: String,
    tx: broadcast::Sender<SyncEvent>,
    handlers: HandlerList,
    next_handle: AtomicU64,
    cancel: CancellationToken,
}

impl EventBus {
    /// Stable id stamped on every event this instance publishes.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Broadcast `event` to every other live instance.
    ///
    /// The event is tagged with this instance's id and returned as sent.
    pub fn publish(&self, mut event: SyncEvent) -> SyncEvent {
        event.source_instance_id = self.instance_id.clone();
        debug!(
            kind = %event.kind,
            instance = %self.instance_id,
            "publishing sync event"
        );
        // No receivers is not an error.
        let _ = self.tx.send(event.clone());
        event
    }

    /// Register a handler for events from other instances.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.push((handle, Arc::new(handler)));
        handle
    }

    /// Remove a handler. Returns `true` if it was registered.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(h, _)| *h != handle);
        handlers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop receiving events. Publishing still works.
    pub fn leave(&self) {
        self.cancel.cancel();
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("instance_id", &self.instance_id)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

async fn deliver(
    instance_id: String,
    mut rx: broadcast::Receiver<SyncEvent>,
    handlers: HandlerList,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => {
                    if event.source_instance_id == instance_id {
                        continue;
                    }
                    let current: Vec<SyncHandler> = handlers
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .iter()
                        .map(|(_, h)| Arc::clone(h))
                        .collect();
                    for handler in current {
                        handler(&event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(instance = %instance_id, skipped, "sync delivery lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!(instance = %instance_id, "sync delivery stopped");
}
