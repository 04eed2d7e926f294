//! Item accounting.
//!
//! Every item is in exactly one of three phases once pushed: `pending`
//! (queued or awaiting the rate scheduler), `scheduled` (slot reserved, timer
//! armed) or `active` (handler running). `total` is their sum, kept per group
//! and globally.

use std::collections::HashMap;
use std::hash::Hash;

use crate::group::Group;

/// Internal four-way counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counts {
    pub(crate) pending: usize,
    pub(crate) scheduled: usize,
    pub(crate) active: usize,
    pub(crate) total: usize,
}

impl Counts {
    pub(crate) fn enqueued(&mut self) {
        self.pending += 1;
        self.total += 1;
    }

    pub(crate) fn scheduled(&mut self) {
        self.pending = dec(self.pending, "pending");
        self.scheduled += 1;
    }

    pub(crate) fn started(&mut self) {
        self.scheduled = dec(self.scheduled, "scheduled");
        self.active += 1;
    }

    pub(crate) fn finished(&mut self) {
        self.active = dec(self.active, "active");
        self.total = dec(self.total, "total");
    }

    /// An item left the pending phase without ever being scheduled.
    pub(crate) fn dropped_pending(&mut self) {
        self.pending = dec(self.pending, "pending");
        self.total = dec(self.total, "total");
    }

    /// Forget everything that has not started running.
    pub(crate) fn discard_unstarted(&mut self) {
        self.total = self.active;
        self.pending = 0;
        self.scheduled = 0;
    }

    pub(crate) fn is_balanced(&self) -> bool {
        self.total == self.pending + self.scheduled + self.active
    }

    pub(crate) fn public(&self) -> Stat {
        Stat { total: self.total, active: self.active, pending: self.pending + self.scheduled }
    }
}

fn dec(value: usize, name: &str) -> usize {
    match value.checked_sub(1) {
        Some(v) => v,
        None => panic!("relimit accounting underflow: `{name}` counter already zero"),
    }
}

/// Counters reported to callers. `pending` covers both queued items and items
/// waiting for their rate slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub total: usize,
    pub active: usize,
    pub pending: usize,
}

/// Per-key counter lookup, independent of the queued item type.
pub(crate) trait GroupCounts<K> {
    fn counts(&self, key: &K) -> Option<Counts>;
}

impl<K, T> GroupCounts<K> for HashMap<K, Group<T>>
where
    K: Eq + Hash,
{
    fn counts(&self, key: &K) -> Option<Counts> {
        self.get(key).map(|group| group.counts)
    }
}

/// Read-only view of the coordinator's counters, handed to `consume` predicates.
pub struct StatView<'a, K> {
    groups: &'a dyn GroupCounts<K>,
    global: &'a Counts,
}

impl<'a, K> StatView<'a, K> {
    pub(crate) fn new(groups: &'a dyn GroupCounts<K>, global: &'a Counts) -> Self {
        Self { groups, global }
    }

    /// Counters for one group; unknown keys report zeros.
    pub fn group(&self, key: &K) -> Stat {
        self.groups.counts(key).map(|c| c.public()).unwrap_or_default()
    }

    /// Counters aggregated over every group.
    pub fn global(&self) -> Stat {
        self.global.public()
    }
}
