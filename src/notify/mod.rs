//! Human-facing notification fan-out.
//!
//! The router delivers each message on the channels requested by the caller:
//! `in-app` (synchronous fan-out to UI listeners plus a bounded inbox) and
//! `os-push` (a platform backend gated by a permission). Channels are
//! best-effort and never fail the caller.

pub mod notification;
pub mod push;
pub mod router;

pub use notification::{
    Channel, Notification, NotificationAction, NotificationKind, NotificationRequest,
};
pub use push::{LogPushBackend, PushBackend, PushPermission};
pub use router::{ListenerHandle, NotificationRouter};
