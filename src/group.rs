//! Per-key admission state.

use std::collections::VecDeque;

use crate::rate::Rate;
use crate::stats::Counts;

/// Where a group's admission loop currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupState {
    /// Nothing queued; the admission loop is idle.
    Empty,
    /// Trying to admit the head of the queue.
    Consuming,
    /// The predicate declined while items of this group are scheduled or running.
    Pausing,
    /// The predicate declined and nothing of this group is in flight.
    PausingNoActive,
    /// Waiting for the rate scheduler to hand out a delay.
    RequestRateLimit,
    /// An admitted item is waiting for its slot; admission resumes when it starts.
    AwaitTimeSlot,
}

impl GroupState {
    pub fn is_paused(self) -> bool {
        matches!(self, GroupState::Pausing | GroupState::PausingNoActive)
    }
}

/// Items sharing one normalized key.
#[derive(Debug)]
pub(crate) struct Group<T> {
    pub(crate) state: GroupState,
    pub(crate) rate: Rate,
    pub(crate) pending: VecDeque<T>,
    /// Predicate approvals already granted by an unpause, honored without asking again.
    pub(crate) consume_credits: usize,
    pub(crate) counts: Counts,
}

impl<T> Group<T> {
    pub(crate) fn new(rate: Rate) -> Self {
        Self {
            state: GroupState::Empty,
            rate,
            pending: VecDeque::new(),
            consume_credits: 0,
            counts: Counts::default(),
        }
    }

    pub(crate) fn enqueue(&mut self, item: T) {
        self.pending.push_back(item);
        self.counts.enqueued();
    }

    /// Spend a banked approval if one is available.
    pub(crate) fn take_credit(&mut self) -> bool {
        if self.consume_credits == 0 {
            return false;
        }
        self.consume_credits -= 1;
        true
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.counts.active > 0 || self.counts.scheduled > 0
    }

    /// Eligible for deletion: idle and holding no items.
    pub(crate) fn is_finished(&self) -> bool {
        self.state == GroupState::Empty && self.counts.total == 0
    }

    /// Drop everything that has not started running.
    pub(crate) fn discard_unstarted(&mut self) {
        self.pending.clear();
        self.consume_credits = 0;
        self.counts.discard_unstarted();
        self.state = GroupState::Empty;
    }
}
