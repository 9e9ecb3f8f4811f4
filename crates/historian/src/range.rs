//! Canonical optional time windows.
//!
//! A [`TimeRange`] is normalized on construction, so every consumer (reads,
//! range deletes, ledger scans, both store backends) sees the same window:
//!
//! - a bound equal to [`MIN_TIMESTAMP`] or [`MAX_TIMESTAMP`] is unbounded;
//! - if both bounds are present and `start > end`, they are swapped.
//!
//! Bounds are inclusive.

use crate::types::{Timestamp, MAX_TIMESTAMP, MIN_TIMESTAMP};
use std::ops::Bound;

/// An inclusive, optionally open-ended time window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    start: Option<Timestamp>,
    end: Option<Timestamp>,
}

impl TimeRange {
    /// Creates a normalized range from raw optional bounds.
    pub fn new(start: Option<Timestamp>, end: Option<Timestamp>) -> Self {
        let mut start = start.filter(|&ts| !is_sentinel(ts));
        let mut end = end.filter(|&ts| !is_sentinel(ts));

        if let (Some(s), Some(e)) = (start, end) {
            if s > e {
                std::mem::swap(&mut start, &mut end);
            }
        }

        Self { start, end }
    }

    /// Creates a normalized range from two concrete bounds.
    pub fn between(start: Timestamp, end: Timestamp) -> Self {
        Self::new(Some(start), Some(end))
    }

    /// The range covering every timestamp.
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// The range covering exactly one timestamp.
    pub fn at(timestamp: Timestamp) -> Self {
        Self::between(timestamp, timestamp)
    }

    /// Inclusive lower bound, `None` when open.
    pub fn start(&self) -> Option<Timestamp> {
        self.start
    }

    /// Inclusive upper bound, `None` when open.
    pub fn end(&self) -> Option<Timestamp> {
        self.end
    }

    /// Returns true if neither bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// Returns true if `timestamp` lies inside the range.
    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start.map_or(true, |s| timestamp >= s) && self.end.map_or(true, |e| timestamp <= e)
    }

    /// Bounds suitable for `BTreeMap::range`.
    pub fn bounds(&self) -> (Bound<Timestamp>, Bound<Timestamp>) {
        (to_bound(self.start), to_bound(self.end))
    }
}

fn is_sentinel(ts: Timestamp) -> bool {
    ts == MIN_TIMESTAMP || ts == MAX_TIMESTAMP
}

fn to_bound(ts: Option<Timestamp>) -> Bound<Timestamp> {
    match ts {
        Some(ts) => Bound::Included(ts),
        None => Bound::Unbounded,
    }
}
