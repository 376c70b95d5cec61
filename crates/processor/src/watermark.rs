//! Watermark tracking for event-time progress
//!
//! A stream has a single watermark: the largest event time seen minus the
//! configured out-of-order bound. It never decreases. When no events arrive
//! for longer than the idle timeout the tracker goes idle and either advances
//! the watermark with wall-clock time or reports a stall.
//!
//! # Example
//!
//! ```rust
//! use processor::config::WatermarkPolicy;
//! use processor::watermark::WatermarkTracker;
//!
//! let policy = WatermarkPolicy { max_out_of_order_ms: 5_000, ..Default::default() };
//! let mut tracker = WatermarkTracker::new(policy, 0);
//!
//! tracker.observe_batch(70_000, 0);
//! assert_eq!(tracker.current().timestamp, 65_000);
//!
//! // Older batches never move it back
//! tracker.observe_batch(10_000, 0);
//! assert_eq!(tracker.current().timestamp, 65_000);
//! ```

use crate::config::WatermarkPolicy;
use crate::error::WatermarkError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Represents a watermark timestamp in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Watermark {
    pub timestamp: i64,
}

impl Watermark {
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// Watermark before any event
    pub fn min() -> Self {
        Self::new(i64::MIN)
    }

    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }

    /// Event time strictly behind the watermark
    pub fn is_after(&self, timestamp: i64) -> bool {
        timestamp < self.timestamp
    }

    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_min() {
            write!(f, "Watermark(-inf)")
        } else {
            write!(f, "Watermark({})", self.timestamp)
        }
    }
}

/// Tracker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatermarkState {
    /// Events are arriving
    Advancing,
    /// No events for longer than the idle timeout
    Idle,
}

/// Late event accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateEventStats {
    /// Events whose target window had already completed
    pub dropped_late: u64,
    /// Events behind the watermark that still landed within allowed lateness
    pub accepted_late: u64,
}

/// Per-stream watermark tracker
#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    policy: WatermarkPolicy,
    current: Watermark,
    max_event_time: i64,
    state: WatermarkState,
    /// Processing time of the last observed batch
    last_event_at_ms: i64,
    /// Watermark and processing time when the tracker went idle
    idle_base: Option<(Watermark, i64)>,
    stall_reported: bool,
    late: LateEventStats,
}

impl WatermarkTracker {
    pub fn new(policy: WatermarkPolicy, now_ms: i64) -> Self {
        Self {
            policy,
            current: Watermark::min(),
            max_event_time: i64::MIN,
            state: WatermarkState::Advancing,
            last_event_at_ms: now_ms,
            idle_base: None,
            stall_reported: false,
            late: LateEventStats::default(),
        }
    }

    pub fn current(&self) -> Watermark {
        self.current
    }

    pub fn max_event_time(&self) -> i64 {
        self.max_event_time
    }

    pub fn state(&self) -> WatermarkState {
        self.state
    }

    pub fn late_stats(&self) -> LateEventStats {
        self.late
    }

    /// Fold the maximum event time of a batch into the watermark
    ///
    /// Returns the new watermark when it advanced.
    pub fn observe_batch(&mut self, max_event_time: i64, now_ms: i64) -> Option<Watermark> {
        self.last_event_at_ms = now_ms;
        if self.state == WatermarkState::Idle {
            debug!(watermark = %self.current, "Watermark tracker resumed advancing");
        }
        self.state = WatermarkState::Advancing;
        self.idle_base = None;
        self.stall_reported = false;

        self.max_event_time = self.max_event_time.max(max_event_time);
        let bound = i64::try_from(self.policy.max_out_of_order_ms).unwrap_or(i64::MAX);
        self.advance(Watermark::new(max_event_time.saturating_sub(bound)))
    }

    /// Check for idleness at processing time `now_ms`
    ///
    /// While idle with `idle_advance` the watermark moves forward by the
    /// wall-clock time elapsed since the tracker went idle. Without it a
    /// single [`WatermarkError::Stall`] is returned per idle period.
    pub fn check_idle(&mut self, now_ms: i64) -> Result<Option<Watermark>, WatermarkError> {
        let idle_ms = now_ms.saturating_sub(self.last_event_at_ms);
        let timeout = i64::try_from(self.policy.idle_timeout_ms).unwrap_or(i64::MAX);
        if idle_ms <= timeout {
            return Ok(None);
        }

        if self.state == WatermarkState::Advancing {
            self.state = WatermarkState::Idle;
            self.idle_base = Some((self.current, now_ms));
            debug!(watermark = %self.current, idle_ms, "Watermark tracker went idle");
        }

        if self.policy.idle_advance {
            let (base, since) = self.idle_base.unwrap_or((self.current, now_ms));
            if base.is_min() {
                return Ok(None);
            }
            let candidate = base.timestamp.saturating_add(now_ms.saturating_sub(since));
            return Ok(self.advance(Watermark::new(candidate)));
        }

        if self.stall_reported {
            return Ok(None);
        }
        self.stall_reported = true;
        Err(WatermarkError::Stall {
            watermark: self.current.timestamp,
            idle_ms: idle_ms.max(0) as u64,
            timeout_ms: self.policy.idle_timeout_ms,
        })
    }

    /// Set the watermark directly; moving it backwards is an error
    pub fn advance_to(&mut self, watermark: Watermark) -> Result<(), WatermarkError> {
        if watermark < self.current {
            return Err(WatermarkError::Regression {
                current_watermark: self.current.timestamp,
                new_watermark: watermark.timestamp,
            });
        }
        self.advance(watermark);
        Ok(())
    }

    /// Rehydrate from a checkpoint
    pub fn restore(&mut self, watermark: Watermark, max_event_time: i64, now_ms: i64) {
        self.current = watermark;
        self.max_event_time = max_event_time;
        self.state = WatermarkState::Advancing;
        self.last_event_at_ms = now_ms;
        self.idle_base = None;
        self.stall_reported = false;
        debug!(watermark = %watermark, "Watermark restored");
    }

    pub fn record_dropped_late(&mut self, event_time: i64) {
        self.late.dropped_late += 1;
        warn!(
            event_time,
            watermark = self.current.timestamp,
            "Dropped late event for completed window"
        );
    }

    pub fn record_accepted_late(&mut self, event_time: i64) {
        self.late.accepted_late += 1;
        trace!(
            event_time,
            watermark = self.current.timestamp,
            "Accepted late event within allowed lateness"
        );
    }

    fn advance(&mut self, candidate: Watermark) -> Option<Watermark> {
        if candidate > self.current {
            self.current = candidate;
            trace!(watermark = %candidate, "Advanced watermark");
            Some(candidate)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_out_of_order_ms: u64, idle_timeout_ms: u64, idle_advance: bool) -> WatermarkPolicy {
        WatermarkPolicy {
            max_out_of_order_ms,
            idle_timeout_ms,
            idle_advance,
        }
    }

    #[test]
    fn test_watermark_ordering() {
        let wm1 = Watermark::new(1000);
        let wm2 = Watermark::new(2000);
        assert!(wm1 < wm2);
        assert!(Watermark::min() < wm1);
        assert!(wm2.is_after(1999));
        assert!(!wm2.is_after(2000));
    }

    #[test]
    fn test_bounded_out_of_order() {
        let mut tracker = WatermarkTracker::new(policy(5_000, 30_000, false), 0);
        assert!(tracker.current().is_min());

        assert_eq!(tracker.observe_batch(10_000, 0), Some(Watermark::new(5_000)));
        assert_eq!(tracker.observe_batch(8_000, 0), None);
        assert_eq!(tracker.current(), Watermark::new(5_000));
        assert_eq!(tracker.max_event_time(), 10_000);
    }

    #[test]
    fn test_watermark_never_regresses() {
        let mut tracker = WatermarkTracker::new(policy(0, 30_000, false), 0);
        tracker.observe_batch(100, 0);
        assert!(matches!(
            tracker.advance_to(Watermark::new(50)),
            Err(WatermarkError::Regression { .. })
        ));
        assert_eq!(tracker.current().timestamp, 100);
    }

    #[test]
    fn test_stall_reported_once_per_idle_period() {
        let mut tracker = WatermarkTracker::new(policy(0, 1_000, false), 0);
        tracker.observe_batch(500, 0);

        assert!(tracker.check_idle(1_000).unwrap().is_none());
        assert!(matches!(tracker.check_idle(1_001), Err(WatermarkError::Stall { .. })));
        assert_eq!(tracker.state(), WatermarkState::Idle);
        assert!(tracker.check_idle(5_000).unwrap().is_none());

        tracker.observe_batch(600, 6_000);
        assert_eq!(tracker.state(), WatermarkState::Advancing);
        assert!(tracker.check_idle(7_500).is_err());
    }

    #[test]
    fn test_idle_advance_uses_wall_clock() {
        let mut tracker = WatermarkTracker::new(policy(0, 1_000, true), 0);
        tracker.observe_batch(500, 0);

        assert_eq!(tracker.check_idle(2_000).unwrap(), None);
        assert_eq!(tracker.check_idle(2_700).unwrap(), Some(Watermark::new(1_200)));
        assert_eq!(tracker.current().timestamp, 1_200);
    }

    #[test]
    fn test_late_accounting() {
        let mut tracker = WatermarkTracker::new(WatermarkPolicy::default(), 0);
        tracker.record_dropped_late(58_000);
        tracker.record_accepted_late(61_000);
        tracker.record_accepted_late(62_000);
        assert_eq!(
            tracker.late_stats(),
            LateEventStats {
                dropped_late: 1,
                accepted_late: 2
            }
        );
    }
}
