#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Install a test subscriber once; `RUST_LOG`-style filtering is not needed here.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Tracks how many handlers run at once, globally and per group.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    current: AtomicUsize,
    max: AtomicUsize,
    processed: AtomicUsize,
    groups: Mutex<HashMap<String, (usize, usize)>>,
}

impl ConcurrencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a handler of `group` as running for `hold`.
    pub async fn run(&self, group: &str, hold: Duration) {
        let now = self.inner.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max.fetch_max(now, Ordering::SeqCst);
        {
            let mut groups = self.inner.groups.lock().expect("tracker poisoned");
            let entry = groups.entry(group.to_string()).or_insert((0, 0));
            entry.0 += 1;
            entry.1 = entry.1.max(entry.0);
        }

        tokio::time::sleep(hold).await;

        {
            let mut groups = self.inner.groups.lock().expect("tracker poisoned");
            if let Some(entry) = groups.get_mut(group) {
                entry.0 -= 1;
            }
        }
        self.inner.current.fetch_sub(1, Ordering::SeqCst);
        self.inner.processed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.inner.max.load(Ordering::SeqCst)
    }

    pub fn max_for(&self, group: &str) -> usize {
        self.inner.groups.lock().expect("tracker poisoned").get(group).map_or(0, |e| e.1)
    }

    pub fn processed(&self) -> usize {
        self.inner.processed.load(Ordering::SeqCst)
    }
}

/// Records when each item started, relative to creation.
#[derive(Debug, Clone)]
pub struct RunLog<T> {
    start: Instant,
    runs: Arc<Mutex<Vec<(T, Duration)>>>,
}

impl<T: Clone> RunLog<T> {
    pub fn new() -> Self {
        Self { start: Instant::now(), runs: Arc::new(Mutex::new(Vec::new())) }
    }

    pub fn record(&self, item: T) {
        let at = self.start.elapsed();
        self.runs.lock().expect("run log poisoned").push((item, at));
    }

    pub fn items(&self) -> Vec<T> {
        self.runs.lock().expect("run log poisoned").iter().map(|(item, _)| item.clone()).collect()
    }

    pub fn times(&self) -> Vec<Duration> {
        self.runs.lock().expect("run log poisoned").iter().map(|(_, at)| *at).collect()
    }
}
