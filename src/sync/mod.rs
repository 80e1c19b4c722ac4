//! Cross-instance sync events.
//!
//! Every running instance of the application for one user joins the same
//! [`SyncHub`] and gets its own [`EventBus`]. Publishing on one bus delivers
//! the event to every *other* live bus; nothing is queued for instances that
//! join later. The bus is a notification fabric only: it carries no locks and
//! makes no attempt to coordinate instances.

pub mod bus;
pub mod event;
pub mod merge;

pub use bus::{EventBus, SubscriptionHandle, SyncHandler, SyncHub};
pub use event::{SyncEvent, SyncEventKind};
pub use merge::LastWriteWins;
