//! Window types and bounds
//!
//! All window arithmetic uses epoch milliseconds (`i64`). Global windows have
//! no end and use [`GLOBAL_WINDOW_END`] as a sentinel.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// End bound of a global window
pub const GLOBAL_WINDOW_END: i64 = i64::MAX;

/// Half-open time bounds `[start, end)` of a window, in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    /// Start time (inclusive)
    pub start: i64,
    /// End time (exclusive)
    pub end: i64,
}

impl WindowBounds {
    pub fn new(start: i64, end: i64) -> Self {
        debug_assert!(start < end, "Window start must be before end");
        Self { start, end }
    }

    /// Unbounded window starting at `start`
    pub fn global(start: i64) -> Self {
        Self {
            start,
            end: GLOBAL_WINDOW_END,
        }
    }

    pub fn is_global(&self) -> bool {
        self.end == GLOBAL_WINDOW_END
    }

    pub fn duration_ms(&self) -> i64 {
        self.end.saturating_sub(self.start)
    }

    /// Check if a timestamp falls within this window
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Check if this window overlaps with another window
    pub fn overlaps(&self, other: &WindowBounds) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Smallest window covering both
    pub fn merge(&self, other: &WindowBounds) -> WindowBounds {
        WindowBounds {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Time at which the window may complete on the watermark
    pub fn completion_time(&self, allowed_lateness_ms: i64) -> i64 {
        self.end.saturating_add(allowed_lateness_ms)
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        millis_to_datetime(self.start)
    }

    /// End as a timestamp; `None` for global windows
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        (!self.is_global()).then(|| millis_to_datetime(self.end))
    }
}

impl fmt::Display for WindowBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            write!(f, "[{}, +inf)", self.start)
        } else {
            write!(f, "[{}, {})", self.start, self.end)
        }
    }
}

impl PartialOrd for WindowBounds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WindowBounds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

/// Identity of one window state: `(aggregation id, group key, window start)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey {
    pub aggregation_id: String,
    pub group_key: String,
    pub window_start: i64,
}

impl WindowKey {
    pub fn new(aggregation_id: impl Into<String>, group_key: impl Into<String>, window_start: i64) -> Self {
        Self {
            aggregation_id: aggregation_id.into(),
            group_key: group_key.into(),
            window_start,
        }
    }

    /// Same aggregation and group
    pub fn same_group(&self, other: &WindowKey) -> bool {
        self.aggregation_id == other.aggregation_id && self.group_key == other.group_key
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.aggregation_id,
            self.group_key.escape_default(),
            self.window_start
        )
    }
}

pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_bounds_contains() {
        let bounds = WindowBounds::new(1000, 2000);
        assert!(!bounds.contains(999));
        assert!(bounds.contains(1000));
        assert!(bounds.contains(1999));
        assert!(!bounds.contains(2000));
        assert_eq!(bounds.duration_ms(), 1000);
    }

    #[test]
    fn test_window_bounds_overlap_and_merge() {
        let a = WindowBounds::new(1000, 2000);
        let b = WindowBounds::new(1500, 2500);
        let c = WindowBounds::new(2000, 3000);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert_eq!(a.merge(&b), WindowBounds::new(1000, 2500));
    }

    #[test]
    fn test_global_bounds() {
        let g = WindowBounds::global(42);
        assert!(g.is_global());
        assert!(g.end_time().is_none());
        assert!(g.contains(i64::MAX - 1));
        assert_eq!(g.completion_time(5_000), i64::MAX);
    }

    #[test]
    fn test_window_key_ordering_and_display() {
        let k1 = WindowKey::new("agg", "a", 0);
        let k2 = WindowKey::new("agg", "a", 60_000);
        let k3 = WindowKey::new("agg", "b", 0);
        assert!(k1 < k2);
        assert!(k2 < k3);
        assert!(k1.same_group(&k2));
        assert_eq!(k2.to_string(), "agg/a/60000");
    }
}
