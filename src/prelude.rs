//! Convenient re-exports for common relimit types.
pub use crate::{
    error::{BoxError, ConfigError, RelimitError},
    events::Event,
    rate::Rate,
    relimit::{Relimit, RelimitBuilder},
    scheduler::{LocalScheduler, LocalSchedulerConfig, RateScheduler},
    stats::{Stat, StatView},
    GroupState,
};
