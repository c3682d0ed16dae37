//! Rolling outcome record for the circuit breaker.
//!
//! Two disciplines, both bounded in memory:
//! - count based: a ring of the last N outcomes
//! - time based: a fixed number of time buckets covering the trailing span
//!
//! A bucket is dropped once its start is a full span old, so the time window
//! never counts an outcome older than the span, and may forget the newest
//! outcomes of its oldest bucket up to one bucket width early.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::schema::RollingWindow;

/// Buckets per time window.
const TIME_BUCKETS: u32 = 10;

/// Success/failure totals currently inside the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WindowTotals {
    pub successes: u64,
    pub failures: u64,
}

impl WindowTotals {
    pub fn total(&self) -> u64 {
        self.successes + self.failures
    }

    /// Failure ratio in percent, 0 when empty.
    pub fn failure_percentage(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.failures as f64 * 100.0 / total as f64,
        }
    }
}

#[derive(Debug)]
pub enum OutcomeWindow {
    Count(CountWindow),
    Time(TimeWindow),
}

impl OutcomeWindow {
    pub fn new(discipline: RollingWindow) -> Self {
        match discipline {
            RollingWindow::Calls(n) => OutcomeWindow::Count(CountWindow::new(n as usize)),
            RollingWindow::Millis(ms) => {
                OutcomeWindow::Time(TimeWindow::new(Duration::from_millis(ms)))
            }
        }
    }

    pub fn record(&mut self, success: bool, now: Instant) {
        match self {
            OutcomeWindow::Count(w) => w.record(success),
            OutcomeWindow::Time(w) => w.record(success, now),
        }
    }

    pub fn totals(&mut self, now: Instant) -> WindowTotals {
        match self {
            OutcomeWindow::Count(w) => w.totals(),
            OutcomeWindow::Time(w) => w.totals(now),
        }
    }

    pub fn clear(&mut self) {
        match self {
            OutcomeWindow::Count(w) => w.clear(),
            OutcomeWindow::Time(w) => w.clear(),
        }
    }
}

/// The last `capacity` outcomes, oldest evicted first.
#[derive(Debug)]
pub struct CountWindow {
    capacity: usize,
    outcomes: VecDeque<bool>,
    failures: u64,
}

impl CountWindow {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            outcomes: VecDeque::with_capacity(capacity),
            failures: 0,
        }
    }

    fn record(&mut self, success: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(false) = self.outcomes.pop_front() {
                self.failures -= 1;
            }
        }
        if !success {
            self.failures += 1;
        }
        self.outcomes.push_back(success);
    }

    fn totals(&self) -> WindowTotals {
        let total = self.outcomes.len() as u64;
        WindowTotals {
            successes: total - self.failures,
            failures: self.failures,
        }
    }

    fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start: Instant,
    successes: u64,
    failures: u64,
}

/// Outcomes from the trailing `span`, aggregated into buckets.
#[derive(Debug)]
pub struct TimeWindow {
    span: Duration,
    bucket_width: Duration,
    buckets: VecDeque<Bucket>,
}

impl TimeWindow {
    fn new(span: Duration) -> Self {
        let bucket_width = (span / TIME_BUCKETS).max(Duration::from_millis(1));
        Self {
            span,
            bucket_width,
            buckets: VecDeque::with_capacity(TIME_BUCKETS as usize + 1),
        }
    }

    fn evict(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.saturating_duration_since(front.start) >= self.span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    fn record(&mut self, success: bool, now: Instant) {
        self.evict(now);
        let reuse = self
            .buckets
            .back()
            .is_some_and(|b| now < b.start + self.bucket_width);
        if !reuse {
            self.buckets.push_back(Bucket {
                start: now,
                successes: 0,
                failures: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            if success {
                bucket.successes += 1;
            } else {
                bucket.failures += 1;
            }
        }
    }

    fn totals(&mut self, now: Instant) -> WindowTotals {
        self.evict(now);
        self.buckets.iter().fold(WindowTotals::default(), |acc, b| WindowTotals {
            successes: acc.successes + b.successes,
            failures: acc.failures + b.failures,
        })
    }

    fn clear(&mut self) {
        self.buckets.clear();
    }
}
