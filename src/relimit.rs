//! The coordinator: per-key admission with rate pacing and backpressure.
//!
//! Semantics:
//! - Every pushed item is normalized to a key; items sharing a key form a
//!   group with one FIFO queue and one rate (looked up when the group is created).
//! - A group admits its head item once the `consume` predicate approves it,
//!   then asks the [`RateScheduler`] for a delay and runs `process` when the
//!   delay elapses.
//! - A declined predicate pauses the group. Paused groups are retried when an
//!   item completes: the completing group first, then the groups with nothing
//!   in flight, in the order they paused, stopping at the first refusal.
//! - `shutdown` drops everything that has not started running and lets
//!   running handlers finish.
//!
//! Invariants:
//! - `total == pending + scheduled + active`, per group and globally, whenever
//!   the state lock is released.
//! - Within a group, items start processing in push order.
//! - The predicate is asked once per decision; an approval obtained while
//!   unpausing is banked as a credit and spent by the next admission step.
//!
//! All transitions for all groups run under one lock, so the coordinator is a
//! single scheduling domain even on a multi-threaded runtime. Continuations are
//! spawned as new tasks rather than called recursively.
//!
//! ```rust
//! use relimit::{BoxError, Relimit};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let relimit = Relimit::keyed(|job: &(String, u32)| job.0.clone())
//!     .rate("10/s")
//!     .consume(|_job, stats| stats.global().active < 4)
//!     .process(|job: (String, u32)| async move {
//!         let _ = job;
//!         Ok::<_, BoxError>(())
//!     })
//!     .build()
//!     .unwrap();
//!
//! relimit.push(("alice".to_string(), 1)).unwrap();
//! relimit.push(("bob".to_string(), 2)).unwrap();
//! relimit.wait().await.unwrap();
//! # });
//! ```

use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;

use crate::error::{BoxError, ConfigError, RelimitError};
use crate::events::{Event, DEFAULT_EVENT_CAPACITY};
use crate::group::{Group, GroupState};
use crate::rate::{parse_rate, Rate};
use crate::scheduler::{LocalScheduler, RateScheduler};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::stats::{Counts, Stat, StatView};

/// Bounds required of group keys.
pub trait Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<K> Key for K where K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

type NormalizeFn<T, K> = Arc<dyn Fn(&T) -> K + Send + Sync>;
type RateFn<T> = Arc<dyn Fn(&T) -> String + Send + Sync>;
type ConsumeFn<T, K> = Arc<dyn Fn(&T, &StatView<'_, K>) -> bool + Send + Sync>;
type ProcessFn<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

enum RateSource<T> {
    Fixed(Rate),
    PerItem(RateFn<T>),
}

impl<T> RateSource<T> {
    fn resolve(&self, item: &T) -> Result<Rate, ConfigError> {
        match self {
            RateSource::Fixed(rate) => Ok(*rate),
            RateSource::PerItem(rate_fn) => Ok(parse_rate(&rate_fn(item))?),
        }
    }
}

enum RateInput<T> {
    Fixed(String),
    PerItem(RateFn<T>),
}

struct State<T, K> {
    groups: HashMap<K, Group<T>>,
    counts: Counts,
    /// Groups in `PausingNoActive`, oldest first.
    paused: Vec<K>,
    timers: HashMap<u64, AbortHandle>,
    next_timer: u64,
    shutdown: bool,
    failure: Option<RelimitError>,
}

impl<T, K: Key> State<T, K> {
    fn new() -> Self {
        Self {
            groups: HashMap::new(),
            counts: Counts::default(),
            paused: Vec::new(),
            timers: HashMap::new(),
            next_timer: 0,
            shutdown: false,
            failure: None,
        }
    }

    fn group_mut(&mut self, key: &K) -> &mut Group<T> {
        match self.groups.get_mut(key) {
            Some(group) => group,
            None => panic!("relimit: no group for key {key:?}"),
        }
    }

    fn group(&self, key: &K) -> &Group<T> {
        match self.groups.get(key) {
            Some(group) => group,
            None => panic!("relimit: no group for key {key:?}"),
        }
    }

    fn head(&self, key: &K) -> &T {
        match self.group(key).pending.front() {
            Some(item) => item,
            None => panic!("relimit: group {key:?} has no queued item to admit"),
        }
    }

    fn view(&self) -> StatView<'_, K> {
        StatView::new(&self.groups, &self.counts)
    }

    fn is_drained(&self) -> bool {
        self.counts.total == 0 && self.groups.is_empty()
    }

    fn mark_started(&mut self, key: &K) {
        self.group_mut(key).counts.started();
        self.counts.started();
    }

    /// Change a group's state and keep the paused index in step.
    fn set_state(&mut self, key: &K, next: GroupState) {
        let group = self.group_mut(key);
        let previous = group.state;
        group.state = next;

        if previous == GroupState::PausingNoActive {
            self.paused.retain(|k| k != key);
        }
        if next == GroupState::PausingNoActive {
            self.paused.push(key.clone());
        }
        tracing::trace!(?key, ?previous, ?next, "group state");
    }
}

struct Inner<T, K> {
    normalize: NormalizeFn<T, K>,
    rate: RateSource<T>,
    consume: ConsumeFn<T, K>,
    process: ProcessFn<T>,
    scheduler: Arc<dyn RateScheduler<K>>,
    sleeper: Arc<dyn Sleeper>,
    events: broadcast::Sender<Event>,
    state: Mutex<State<T, K>>,
}

impl<T, K> Inner<T, K>
where
    T: Send + 'static,
    K: Key,
{
    fn lock(&self) -> MutexGuard<'_, State<T, K>> {
        self.state.lock().expect("relimit state poisoned")
    }

    fn spawn_admission(self: &Arc<Self>, key: K) {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.admit(key).await });
    }

    /// One admission step for a group in `Consuming`.
    async fn admit(self: Arc<Self>, key: K) {
        let (item, rate) = {
            let mut st = self.lock();
            if st.shutdown {
                return;
            }
            debug_assert_eq!(st.group(&key).state, GroupState::Consuming);

            let approved = st.group_mut(&key).take_credit() || self.approves(&mut st, &key);

            if !approved {
                let next = if st.group(&key).has_in_flight() {
                    GroupState::Pausing
                } else {
                    GroupState::PausingNoActive
                };
                st.set_state(&key, next);
                tracing::debug!(?key, state = ?next, "admission paused by consume predicate");
                return;
            }

            let group = st.group_mut(&key);
            let Some(item) = group.pending.pop_front() else {
                panic!("relimit: group {key:?} approved an item from an empty queue");
            };
            let rate = group.rate;
            st.set_state(&key, GroupState::RequestRateLimit);
            (item, rate)
        };

        let delay = self.scheduler.schedule(&key, rate).await;

        let mut st = self.lock();
        if st.shutdown {
            tracing::trace!(?key, "dropping item admitted before shutdown");
            return;
        }

        let delay = match delay {
            Ok(delay) => delay,
            Err(err) => {
                drop(item);
                st.group_mut(&key).counts.dropped_pending();
                st.counts.dropped_pending();
                self.fail(&mut st, RelimitError::scheduler(err));
                self.resume_after_admission(&mut st, key, Duration::ZERO);
                return;
            }
        };

        st.group_mut(&key).counts.scheduled();
        st.counts.scheduled();
        tracing::trace!(?key, ?delay, "item scheduled");
        self.arm(&mut st, key.clone(), item, delay);
        self.resume_after_admission(&mut st, key, delay);
    }

    /// Decide what a group does after one of its items left the queue.
    fn resume_after_admission(self: &Arc<Self>, st: &mut State<T, K>, key: K, delay: Duration) {
        if st.group(&key).pending.is_empty() {
            st.set_state(&key, GroupState::Empty);
            self.release_if_finished(st, &key);
        } else if !delay.is_zero() {
            st.set_state(&key, GroupState::AwaitTimeSlot);
        } else {
            st.set_state(&key, GroupState::Consuming);
            self.spawn_admission(key);
        }
    }

    /// Run `item` once `delay` has elapsed. Delayed runs are cancellable through `timers`.
    ///
    /// A zero delay starts the item right here, under the lock, so the next
    /// predicate call already sees it as active.
    fn arm(self: &Arc<Self>, st: &mut State<T, K>, key: K, item: T, delay: Duration) {
        let inner = Arc::clone(self);
        if delay.is_zero() {
            st.mark_started(&key);
            tokio::spawn(async move {
                if inner.cancel_if_shut_down(&key) {
                    return;
                }
                inner.execute(key, item).await;
            });
            return;
        }

        let id = st.next_timer;
        st.next_timer = st.next_timer.wrapping_add(1);
        let sleep = self.sleeper.sleep(delay);
        let task = tokio::spawn(async move {
            sleep.await;
            inner.fire(key, item, id).await;
        });
        st.timers.insert(id, task.abort_handle());
    }

    /// Timer expiry: the item's slot is open.
    async fn fire(self: Arc<Self>, key: K, item: T, timer: u64) {
        {
            let mut st = self.lock();
            st.timers.remove(&timer);
            if st.shutdown {
                return;
            }

            st.mark_started(&key);
            if st.group(&key).state == GroupState::AwaitTimeSlot {
                st.set_state(&key, GroupState::Consuming);
                self.spawn_admission(key.clone());
            }
        }
        self.execute(key, item).await;
    }

    /// A zero-delay item whose handler has not been polled yet never runs after shutdown.
    fn cancel_if_shut_down(&self, key: &K) -> bool {
        let mut st = self.lock();
        if !st.shutdown {
            return false;
        }
        st.group_mut(key).counts.finished();
        st.counts.finished();
        tracing::trace!(?key, "dropping item started before shutdown");
        self.release_if_finished(&mut st, key);
        true
    }

    /// Run the handler for a started item, then settle accounting and wake paused groups.
    async fn execute(self: Arc<Self>, key: K, item: T) {
        let process = Arc::clone(&self.process);
        let outcome = AssertUnwindSafe(async move { process(item).await }).catch_unwind().await;
        let result = outcome.unwrap_or_else(|payload| Err(panic_error("process handler", payload)));

        let mut st = self.lock();
        st.group_mut(&key).counts.finished();
        st.counts.finished();

        if let Err(err) = result {
            self.fail(&mut st, RelimitError::process(err));
        }

        if !self.release_if_finished(&mut st, &key)
            && st.group(&key).state == GroupState::Pausing
        {
            if st.group(&key).counts.active == 0 {
                st.set_state(&key, GroupState::PausingNoActive);
            }
            self.try_unpause(&mut st, &key);
        }

        let candidates = st.paused.clone();
        for candidate in candidates {
            if !self.try_unpause(&mut st, &candidate) {
                break;
            }
        }
    }

    /// Ask `consume` about a group's head item. A panicking predicate is
    /// reported like a failed handler and counts as a refusal.
    fn approves(&self, st: &mut State<T, K>, key: &K) -> bool {
        let verdict = {
            let st_ref: &State<T, K> = st;
            let item = st_ref.head(key);
            let view = st_ref.view();
            panic::catch_unwind(AssertUnwindSafe(|| (self.consume)(item, &view)))
        };
        match verdict {
            Ok(approved) => approved,
            Err(payload) => {
                self.fail(st, RelimitError::process(panic_error("consume predicate", payload)));
                false
            }
        }
    }

    /// Ask the predicate about a paused group's head item; on approval bank the
    /// answer as a credit and restart admission.
    fn try_unpause(self: &Arc<Self>, st: &mut State<T, K>, key: &K) -> bool {
        if st.shutdown || !st.group(key).state.is_paused() {
            return false;
        }

        if !self.approves(st, key) {
            return false;
        }

        st.group_mut(key).consume_credits += 1;
        st.set_state(key, GroupState::Consuming);
        tracing::debug!(?key, "group resumed");
        self.spawn_admission(key.clone());
        true
    }

    /// Delete a finished group; signal drain when it was the last thing alive.
    fn release_if_finished(&self, st: &mut State<T, K>, key: &K) -> bool {
        if !st.groups.get(key).map_or(false, Group::is_finished) {
            return false;
        }
        st.groups.remove(key);
        tracing::debug!(?key, "group released");

        if st.is_drained() {
            self.emit_drained();
        }
        true
    }

    /// Record a failure. Only the first one is kept and broadcast.
    fn fail(&self, st: &mut State<T, K>, err: RelimitError) {
        tracing::error!(error = %err, "relimit item failed");
        if st.failure.is_none() {
            st.failure = Some(err.clone());
            let _ = self.events.send(Event::Failed(err));
        }
    }

    fn emit_drained(&self) {
        tracing::info!("relimit drained");
        let _ = self.events.send(Event::Drained);
    }
}

fn always_consume<T, K>(_item: &T, _stats: &StatView<'_, K>) -> bool {
    true
}

fn panic_error(source: &str, payload: Box<dyn Any + Send>) -> BoxError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("{source} panicked: {message}").into()
}

/// Rate-limited admission scheduler for items grouped by key.
///
/// Clones share the same queues, counters and scheduler. All operations that
/// start work (`push`, `push_all`) must be called inside a tokio runtime.
pub struct Relimit<T, K = ()> {
    inner: Arc<Inner<T, K>>,
}

impl<T, K> Clone for Relimit<T, K> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T, K> fmt::Debug for Relimit<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relimit")
            .field("sleeper", &self.inner.sleeper)
            .field("normalize", &"<fn>")
            .field("consume", &"<predicate>")
            .field("process", &"<handler>")
            .finish_non_exhaustive()
    }
}

impl<T> Relimit<T, ()>
where
    T: Send + 'static,
{
    /// Builder that puts every item into one global group.
    pub fn builder() -> RelimitBuilder<T, ()> {
        RelimitBuilder::new(Arc::new(|_: &T| ()))
    }
}

impl<T, K> Relimit<T, K>
where
    T: Send + 'static,
    K: Key,
{
    /// Builder that groups items by `normalize(item)`.
    pub fn keyed<F>(normalize: F) -> RelimitBuilder<T, K>
    where
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        RelimitBuilder::new(Arc::new(normalize))
    }

    /// Queue one item.
    pub fn push(&self, item: T) -> Result<(), RelimitError> {
        self.push_all(std::iter::once(item))
    }

    /// Queue a sequence of items in order.
    ///
    /// A group's rate is resolved when its first item arrives; if that fails,
    /// the offending item and everything after it are not queued.
    pub fn push_all<I>(&self, items: I) -> Result<(), RelimitError>
    where
        I: IntoIterator<Item = T>,
    {
        let inner = &self.inner;
        let mut st = inner.lock();
        if st.shutdown {
            return Err(RelimitError::ShutDown);
        }

        for item in items {
            let key = (inner.normalize)(&item);

            if !st.groups.contains_key(&key) {
                let rate = inner.rate.resolve(&item)?;
                tracing::debug!(?key, %rate, "group created");
                st.groups.insert(key.clone(), Group::new(rate));
            }

            st.group_mut(&key).enqueue(item);
            st.counts.enqueued();

            if st.group(&key).state == GroupState::Empty {
                st.set_state(&key, GroupState::Consuming);
                inner.spawn_admission(key);
            }
        }
        Ok(())
    }

    /// Counters for one group; unknown keys report zeros.
    pub fn stat(&self, key: &K) -> Stat {
        self.inner.lock().view().group(key)
    }

    /// Counters aggregated over all groups.
    pub fn stat_all(&self) -> Stat {
        self.inner.lock().view().global()
    }

    /// Current admission state of a group, if it exists.
    pub fn group_state(&self, key: &K) -> Option<GroupState> {
        self.inner.lock().groups.get(key).map(|group| group.state)
    }

    /// Receive `Drained` and `Failed` notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Resolve once nothing is pending, scheduled or running; fail with the
    /// first processing error instead if one has been reported.
    pub async fn wait(&self) -> Result<(), RelimitError> {
        let mut events = {
            let st = self.inner.lock();
            if let Some(err) = &st.failure {
                return Err(err.clone());
            }
            if st.is_drained() {
                return Ok(());
            }
            self.inner.events.subscribe()
        };

        loop {
            match events.recv().await {
                Ok(Event::Drained) => return Ok(()),
                Ok(Event::Failed(err)) => return Err(err),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "relimit waiter lagged; re-checking state");
                    let st = self.inner.lock();
                    if let Some(err) = &st.failure {
                        return Err(err.clone());
                    }
                    if st.is_drained() {
                        return Ok(());
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Prepare the rate scheduler ahead of the first admission.
    pub async fn start(&self) -> Result<(), RelimitError> {
        self.inner.scheduler.start().await.map_err(RelimitError::scheduler)
    }

    /// Stop admitting work.
    ///
    /// Items that have not started processing are dropped and their timers
    /// cancelled; handlers already running finish normally. Resolves like
    /// [`wait`](Self::wait), so the caller observes those handlers finishing.
    pub async fn shutdown(&self) -> Result<(), RelimitError> {
        {
            let mut st = self.inner.lock();
            if !st.shutdown {
                tracing::info!(
                    pending = st.counts.pending,
                    scheduled = st.counts.scheduled,
                    active = st.counts.active,
                    "relimit shutting down"
                );
            }
            st.shutdown = true;

            for (_, timer) in st.timers.drain() {
                timer.abort();
            }
            st.paused.clear();
            for group in st.groups.values_mut() {
                group.discard_unstarted();
            }
            st.groups.retain(|_, group| group.counts.total > 0);
            st.counts.discard_unstarted();
            debug_assert!(st.counts.is_balanced());

            if st.is_drained() {
                self.inner.emit_drained();
            }
        }

        if let Err(err) = self.inner.scheduler.shutdown().await {
            tracing::warn!(error = %err, "rate scheduler shutdown failed");
        }

        self.wait().await
    }
}

/// Builder for [`Relimit`].
pub struct RelimitBuilder<T, K> {
    normalize: NormalizeFn<T, K>,
    rate: Option<RateInput<T>>,
    consume: Option<ConsumeFn<T, K>>,
    process: Option<ProcessFn<T>>,
    scheduler: Option<Arc<dyn RateScheduler<K>>>,
    sleeper: Arc<dyn Sleeper>,
    event_capacity: usize,
}

impl<T, K> fmt::Debug for RelimitBuilder<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelimitBuilder")
            .field("rate_set", &self.rate.is_some())
            .field("process_set", &self.process.is_some())
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}

impl<T, K> RelimitBuilder<T, K>
where
    T: Send + 'static,
    K: Key,
{
    fn new(normalize: NormalizeFn<T, K>) -> Self {
        Self {
            normalize,
            rate: None,
            consume: None,
            process: None,
            scheduler: None,
            sleeper: Arc::new(TokioSleeper),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Same rate for every group, e.g. `"3/80ms"`. Parsed by [`build`](Self::build).
    pub fn rate(mut self, rate: impl Into<String>) -> Self {
        self.rate = Some(RateInput::Fixed(rate.into()));
        self
    }

    /// Rate string per group, computed from the group's first item.
    pub fn rate_fn<F>(mut self, rate_fn: F) -> Self
    where
        F: Fn(&T) -> String + Send + Sync + 'static,
    {
        self.rate = Some(RateInput::PerItem(Arc::new(rate_fn)));
        self
    }

    /// Admission predicate. Runs under the coordinator lock: it may inspect the
    /// counters it is handed but must not call back into the same `Relimit`.
    pub fn consume<F>(mut self, consume: F) -> Self
    where
        F: Fn(&T, &StatView<'_, K>) -> bool + Send + Sync + 'static,
    {
        self.consume = Some(Arc::new(consume));
        self
    }

    /// Handler run for every admitted item.
    pub fn process<F, Fut, E>(mut self, process: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.process = Some(Arc::new(move |item: T| {
            let fut = process(item);
            async move { fut.await.map_err(Into::into) }.boxed()
        }));
        self
    }

    /// Replace the in-process [`LocalScheduler`].
    pub fn scheduler<S>(mut self, scheduler: S) -> Self
    where
        S: RateScheduler<K> + 'static,
    {
        self.scheduler = Some(Arc::new(scheduler));
        self
    }

    /// Replace the tokio-backed delay sleeper.
    pub fn sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Buffer size of the event channel (minimum 1).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Validate the configuration and build the coordinator.
    pub fn build(self) -> Result<Relimit<T, K>, ConfigError> {
        let process = self.process.ok_or(ConfigError::MissingProcess)?;
        let rate = match self.rate.ok_or(ConfigError::MissingRate)? {
            RateInput::Fixed(rate) => RateSource::Fixed(parse_rate(&rate)?),
            RateInput::PerItem(rate_fn) => RateSource::PerItem(rate_fn),
        };
        let consume: ConsumeFn<T, K> = match self.consume {
            Some(consume) => consume,
            None => Arc::new(always_consume::<T, K>),
        };
        let scheduler: Arc<dyn RateScheduler<K>> = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(LocalScheduler::<K>::default()),
        };
        let (events, _) = broadcast::channel(self.event_capacity);

        Ok(Relimit {
            inner: Arc::new(Inner {
                normalize: self.normalize,
                rate,
                consume,
                process,
                scheduler,
                sleeper: self.sleeper,
                events,
                state: Mutex::new(State::new()),
            }),
        })
    }
}
