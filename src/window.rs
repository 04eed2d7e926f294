//! Fixed-resolution sliding-window counter.
//!
//! A window covers one rate period split into `intervals` buckets of equal
//! width. Bucket ids are absolute: bucket `n` starts at `n * bucket_width`
//! milliseconds. `head` is the oldest bucket still inside the trailing window,
//! so the live buckets are `head..head + intervals`.
//!
//! The ring holds `2 * intervals` slots. Every slot outside the live range is
//! zero, which lets the window slide forward by zeroing the bucket it leaves
//! while the bucket it enters is already clear.
//!
//! The counter is a pure function of the `now` values it is given; it knows
//! nothing about groups, items or clocks.

use std::time::Duration;

/// Sliding-window admission counter for a single (key, period) pair.
#[derive(Debug, Clone)]
pub struct Window {
    buckets: Box<[u32]>,
    intervals: i64,
    bucket_width: i64,
    head: i64,
    newest: i64,
}

impl Window {
    /// Create an empty window for `period` with `intervals` buckets, positioned at `now_millis`.
    ///
    /// # Panics
    /// Panics if `intervals` is zero.
    pub fn new(intervals: usize, period: Duration, now_millis: u64) -> Self {
        assert!(intervals > 0, "window needs at least one bucket");
        let intervals = i64::try_from(intervals).unwrap_or(i64::MAX / 4);
        let period_millis = period.as_nanos() as f64 / 1_000_000.0;
        let bucket_width = ((period_millis / intervals as f64).round() as i64).max(1);

        let mut window = Self {
            buckets: vec![0; (intervals * 2) as usize].into_boxed_slice(),
            intervals,
            bucket_width,
            head: 0,
            newest: 0,
        };
        window.head = window.start_at(now_millis);
        window.newest = window.head - 1;
        window
    }

    /// Reserve one admission slot and return how long to wait before using it.
    ///
    /// Admits into the bucket containing `now` when fewer than `limit`
    /// admissions are live; otherwise slides the window forward bucket by
    /// bucket until one frees up and admits there.
    pub fn admit(&mut self, limit: u32, now_millis: u64) -> Duration {
        let limit = u64::from(limit.max(1));
        self.advance_to(self.start_at(now_millis));

        let mut count: u64 = (self.head..self.head + self.intervals)
            .map(|pos| u64::from(self.buckets[self.slot(pos)]))
            .sum();
        let mut pos = self.head + self.intervals - 1;

        while count >= limit {
            let vacated = self.slot(self.head);
            count -= u64::from(self.buckets[vacated]);
            self.buckets[vacated] = 0;
            self.head += 1;
            pos += 1;
        }

        let slot = self.slot(pos);
        self.buckets[slot] = self.buckets[slot].saturating_add(1);
        self.newest = self.newest.max(pos);

        let scheduled = pos.saturating_mul(self.bucket_width);
        let offset = scheduled.saturating_sub(to_i64(now_millis)).max(0);
        Duration::from_millis(offset as u64)
    }

    /// Time (ms) after which the window holds no live admissions: the newest
    /// reserved bucket has slid out of the trailing window by then.
    pub fn expire_millis(&self) -> u64 {
        let end = (self.newest + self.intervals).saturating_mul(self.bucket_width);
        u64::try_from(end).unwrap_or(0)
    }

    /// Whether the window can be dropped at `now_millis`.
    pub fn is_expired(&self, now_millis: u64) -> bool {
        self.expire_millis() <= now_millis
    }

    #[cfg(test)]
    fn bucket_width(&self) -> u64 {
        self.bucket_width as u64
    }

    /// Admissions currently counted inside the live range.
    #[cfg(test)]
    fn live_count(&self) -> u64 {
        (self.head..self.head + self.intervals)
            .map(|pos| u64::from(self.buckets[self.slot(pos)]))
            .sum()
    }

    fn start_at(&self, now_millis: u64) -> i64 {
        to_i64(now_millis).div_euclid(self.bucket_width) - self.intervals + 1
    }

    fn advance_to(&mut self, start: i64) {
        // A head ahead of `start` means future buckets are already reserved; keep it.
        if self.head >= start {
            return;
        }
        if start - self.head >= self.intervals {
            self.buckets.fill(0);
        } else {
            for pos in self.head..start {
                let slot = self.slot(pos);
                self.buckets[slot] = 0;
            }
        }
        self.head = start;
    }

    fn slot(&self, pos: i64) -> usize {
        pos.rem_euclid(self.buckets.len() as i64) as usize
    }
}

fn to_i64(millis: u64) -> i64 {
    i64::try_from(millis).unwrap_or(i64::MAX)
}
