//! Notifications published by a [`Relimit`](crate::Relimit) instance.
//!
//! Subscribers receive events through a `tokio::sync::broadcast` channel; a
//! subscriber that falls behind loses the oldest events, never blocks the
//! scheduler.

use std::fmt;

use crate::error::RelimitError;

/// Default capacity of the event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Coordinator-level signals.
#[derive(Debug, Clone)]
pub enum Event {
    /// No item is pending, scheduled or running anywhere.
    Drained,
    /// The first failure reported by a `process` handler or the rate scheduler.
    Failed(RelimitError),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Drained => write!(f, "drained"),
            Event::Failed(err) => write!(f, "failed: {err}"),
        }
    }
}
