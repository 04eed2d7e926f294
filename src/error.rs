//! Error types for the admission scheduler.
use crate::rate::RateParseError;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error returned by `process` handlers and rate schedulers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared form of [`BoxError`] so one failure can be handed to every waiter.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Invalid configuration, detected at build time or when a group is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// No `process` handler was supplied.
    #[error("`process` handler is required")]
    MissingProcess,
    /// Neither a fixed rate nor a rate function was supplied.
    #[error("`rate` must be set to a fixed rate string or a rate function")]
    MissingRate,
    /// A rate string failed to parse.
    #[error(transparent)]
    InvalidRate(#[from] RateParseError),
    /// The window resolution must be at least one bucket.
    #[error("intervals must be > 0 (got {provided})")]
    InvalidIntervals {
        /// Value provided by caller.
        provided: usize,
    },
    /// The garbage-collection sweep needs a non-zero period.
    #[error("sweep interval must be > 0 (got {0:?})")]
    InvalidSweepInterval(Duration),
}

/// Errors surfaced by [`Relimit`](crate::Relimit) operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RelimitError {
    /// Configuration problem.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// `push` was called after `shutdown`.
    #[error("relimit has been shut down")]
    ShutDown,
    /// A `process` handler failed or panicked.
    #[error("processing failed: {0}")]
    Process(#[source] SharedError),
    /// The rate scheduler could not compute a delay.
    #[error("rate scheduler failed: {0}")]
    Scheduler(#[source] SharedError),
}

impl RelimitError {
    pub(crate) fn process(err: BoxError) -> Self {
        Self::Process(Arc::from(err))
    }

    pub(crate) fn scheduler(err: BoxError) -> Self {
        Self::Scheduler(Arc::from(err))
    }

    /// Check if this error came from a `process` handler.
    pub fn is_process(&self) -> bool {
        matches!(self, Self::Process(_))
    }

    /// Check if this error is a configuration error.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Check if this error reports a push after shutdown.
    pub fn is_shut_down(&self) -> bool {
        matches!(self, Self::ShutDown)
    }
}
