#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # relimit
//!
//! Per-key rate-limited admission for async Rust.
//!
//! Items pushed into a [`Relimit`] are grouped by a key. Each group is a FIFO
//! queue paced by its own rate (`"3/80ms"`, `"10/s"`, `"1/h"`), and a
//! `consume` predicate can hold work back based on live counters, which gives
//! backpressure across groups. Admitted items run through an async `process`
//! handler once their time slot opens.
//!
//! ## Features
//!
//! - **Sliding-window pacing** per key and period ([`LocalScheduler`])
//! - **Backpressure predicates** fed with per-group and global [`Stat`]s
//! - **Graceful shutdown** that drops queued work and lets running handlers finish
//! - **Pluggable seams**: [`RateScheduler`], [`Clock`] and [`Sleeper`]
//!
//! ## Quick Start
//!
//! ```rust
//! use relimit::{BoxError, Relimit};
//!
//! #[tokio::main]
//! async fn main() {
//!     let relimit = Relimit::builder()
//!         .rate("3/80ms")
//!         .process(|n: u32| async move {
//!             let _ = n;
//!             Ok::<_, BoxError>(())
//!         })
//!         .build()
//!         .unwrap();
//!
//!     relimit.push_all(0..10).unwrap();
//!     relimit.wait().await.unwrap();
//! }
//! ```

pub mod clock;
pub mod error;
pub mod events;
pub mod group;
pub mod prelude;
pub mod rate;
pub mod relimit;
pub mod scheduler;
pub mod sleeper;
pub mod stats;
pub mod window;

// Re-exports
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::{BoxError, ConfigError, RelimitError, SharedError};
pub use events::Event;
pub use group::GroupState;
pub use rate::{parse_rate, Rate, RateParseError};
pub use relimit::{Key, Relimit, RelimitBuilder};
pub use scheduler::{LocalScheduler, LocalSchedulerConfig, RateScheduler};
pub use sleeper::{Sleeper, TokioSleeper, TrackingSleeper};
pub use stats::{Stat, StatView};
pub use window::Window;
