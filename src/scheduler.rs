//! Rate scheduling: "how long until the next admission slot for this key is free".
//!
//! [`RateScheduler`] is the seam between the coordinator and the window
//! storage. [`LocalScheduler`] keeps one [`Window`] per (key, period) pair in
//! process memory and sweeps expired windows in the background.
//!
//! Windows are namespaced by period: two callers sharing a key but using
//! different periods never share a window, since a longer period's buckets
//! would otherwise suppress the shorter one's slots.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;

use crate::clock::{Clock, MonotonicClock};
use crate::error::{BoxError, ConfigError};
use crate::rate::Rate;
use crate::window::Window;

/// Default number of buckets per window.
pub const DEFAULT_INTERVALS: usize = 16;
/// Default period of the expired-window sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Computes admission delays for keyed rates.
///
/// `schedule` is asynchronous so that a remote backend can implement it; once
/// it returns `delay`, the slot at `now + delay` is reserved for the caller.
#[async_trait]
pub trait RateScheduler<K>: Send + Sync {
    /// Reserve a slot for `key` under `rate` and return how long to wait for it.
    async fn schedule(&self, key: &K, rate: Rate) -> Result<Duration, BoxError>;

    /// Acquire any resources ahead of the first `schedule` call.
    async fn start(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Release background resources.
    async fn shutdown(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Validated configuration for [`LocalScheduler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSchedulerConfig {
    intervals: usize,
    sweep_interval: Duration,
}

impl LocalSchedulerConfig {
    /// Create a config with validation.
    pub fn new(intervals: usize, sweep_interval: Duration) -> Result<Self, ConfigError> {
        if intervals == 0 {
            return Err(ConfigError::InvalidIntervals { provided: intervals });
        }
        if sweep_interval.is_zero() {
            return Err(ConfigError::InvalidSweepInterval(sweep_interval));
        }
        Ok(Self { intervals, sweep_interval })
    }

    /// Buckets per window.
    pub fn intervals(&self) -> usize {
        self.intervals
    }

    /// Period of the expired-window sweep.
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

impl Default for LocalSchedulerConfig {
    fn default() -> Self {
        Self { intervals: DEFAULT_INTERVALS, sweep_interval: DEFAULT_SWEEP_INTERVAL }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct WindowKey<K> {
    key: K,
    period: Duration,
}

struct Storage<K> {
    windows: HashMap<WindowKey<K>, Window>,
    sweep: Option<AbortHandle>,
}

struct Shared<K> {
    config: LocalSchedulerConfig,
    clock: Arc<dyn Clock>,
    storage: Mutex<Storage<K>>,
}

/// In-process sliding-window scheduler.
///
/// Clones share the same windows. Must be used from within a tokio runtime,
/// which hosts the expired-window sweep.
pub struct LocalScheduler<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for LocalScheduler<K> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<K> fmt::Debug for LocalScheduler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("config", &self.shared.config)
            .field("clock", &self.shared.clock)
            .finish_non_exhaustive()
    }
}

impl<K> Default for LocalScheduler<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(LocalSchedulerConfig::default())
    }
}

impl<K> LocalScheduler<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new(config: LocalSchedulerConfig) -> Self {
        Self::with_clock(config, MonotonicClock::default())
    }

    /// Use a specific clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(config: LocalSchedulerConfig, clock: C) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                clock: Arc::new(clock),
                storage: Mutex::new(Storage { windows: HashMap::new(), sweep: None }),
            }),
        }
    }

    /// Reserve a slot synchronously; [`RateScheduler::schedule`] delegates here.
    ///
    /// Arms the background sweep, so it must run inside a tokio runtime.
    pub fn reserve(&self, key: &K, rate: Rate) -> Duration {
        let now = self.shared.clock.now_millis();
        let mut storage = self.shared.lock();

        let window_key = WindowKey { key: key.clone(), period: rate.period() };
        let intervals = self.shared.config.intervals;
        let delay = storage
            .windows
            .entry(window_key)
            .or_insert_with(|| Window::new(intervals, rate.period(), now))
            .admit(rate.count(), now);

        Shared::arm_sweep(&self.shared, &mut storage);
        delay
    }

    /// Number of live windows.
    pub fn window_count(&self) -> usize {
        self.shared.lock().windows.len()
    }

    /// Whether the background sweep is currently armed.
    pub fn is_sweeping(&self) -> bool {
        self.shared.lock().sweep.is_some()
    }

    /// Drop expired windows now; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let (removed, _) = self.shared.sweep();
        removed
    }
}

impl<K> Shared<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn lock(&self) -> std::sync::MutexGuard<'_, Storage<K>> {
        self.storage.lock().expect("scheduler storage poisoned")
    }

    /// Remove expired windows. Disarms the sweep when nothing is left.
    fn sweep(&self) -> (usize, bool) {
        let now = self.clock.now_millis();
        let mut storage = self.lock();

        let before = storage.windows.len();
        storage.windows.retain(|_, window| !window.is_expired(now));
        let removed = before - storage.windows.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = storage.windows.len(), "expired rate windows swept");
        }

        let keep_running = !storage.windows.is_empty();
        if !keep_running {
            if let Some(sweep) = storage.sweep.take() {
                sweep.abort();
                tracing::debug!("rate window sweep disarmed");
            }
        }
        (removed, keep_running)
    }

    /// Spawn the periodic sweep unless it is already running or there is nothing to sweep.
    ///
    /// The task only holds a `Weak` reference, so it ends once the scheduler is dropped.
    fn arm_sweep(shared: &Arc<Self>, storage: &mut Storage<K>) {
        if storage.sweep.is_some() || storage.windows.is_empty() {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(shared);
        let period = shared.config.sweep_interval;
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = tokio::time::interval_at(start, period);
            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else { break };
                let (_, keep_running) = shared.sweep();
                if !keep_running {
                    break;
                }
            }
        });

        storage.sweep = Some(task.abort_handle());
        tracing::debug!(?period, "rate window sweep armed");
    }
}

#[async_trait]
impl<K> RateScheduler<K> for LocalScheduler<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    async fn schedule(&self, key: &K, rate: Rate) -> Result<Duration, BoxError> {
        Ok(self.reserve(key, rate))
    }

    async fn start(&self) -> Result<(), BoxError> {
        let mut storage = self.shared.lock();
        Shared::arm_sweep(&self.shared, &mut storage);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), BoxError> {
        let mut storage = self.shared.lock();
        if let Some(sweep) = storage.sweep.take() {
            sweep.abort();
        }
        storage.windows.clear();
        Ok(())
    }
}

impl<K> Drop for Shared<K> {
    fn drop(&mut self) {
        if let Ok(storage) = self.storage.get_mut() {
            if let Some(sweep) = storage.sweep.take() {
                sweep.abort();
            }
        }
    }
}
