//! Operation-time markers.
//!
//! An `OpTime` records when a protocol milestone was persisted. Markers are
//! compared as `(term, timestamp)` and the clock never hands out a value that
//! is not strictly greater than every value it has produced or observed, so a
//! commit marker stamped after a restart still orders after the block marker
//! recovered from disk.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Durable logical timestamp for a persisted protocol milestone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpTime {
    pub term: u64,
    pub timestamp: u64,
}

impl OpTime {
    pub const fn new(term: u64, timestamp: u64) -> Self {
        Self { term, timestamp }
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.term, self.timestamp)
    }
}

/// Monotonic source of `OpTime` values for one donor process.
#[derive(Debug)]
pub struct OpTimeClock {
    term: u64,
    last: AtomicU64,
}

impl OpTimeClock {
    pub fn new(term: u64) -> Self {
        Self {
            term,
            last: AtomicU64::new(0),
        }
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    /// Return the next marker. Timestamps track wall-clock milliseconds but
    /// always advance by at least one.
    pub fn tick(&self) -> OpTime {
        let wall = unix_time_ms();
        let mut prev = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange(prev, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return OpTime::new(self.term, next),
                Err(actual) => prev = actual,
            }
        }
    }

    /// Advance past a marker recovered from persisted state.
    pub fn observe(&self, op_time: OpTime) {
        // Only the timestamp is tracked; the term is fixed per process.
        self.last.fetch_max(op_time.timestamp, Ordering::AcqRel);
    }
}

pub(crate) fn unix_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis().min(u128::from(u64::MAX)) as u64)
        .unwrap_or(0)
}
