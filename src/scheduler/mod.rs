//! Autonomous update scheduler.
//!
//! One periodic background task per instance drives the updater according
//! to the package severity and the user's auto-update preference, without
//! any UI interaction for non-critical updates.

pub mod runner;
pub mod tick;

pub use runner::{AutoUpdateScheduler, SchedulerHandle};
pub use tick::{TickOutcome, TickRecord};
