//! Windowing for stream aggregation
//!
//! # Window Types
//!
//! ## Tumbling Windows
//! Fixed-size, non-overlapping windows. Each event belongs to exactly one window.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----][----][----][----][----]
//! ```
//!
//! ## Sliding Windows
//! Fixed-size windows starting every `slide`. With `slide` dividing `size`
//! an event belongs to `size / slide` windows.
//!
//! ```text
//! Time:     0----5----10---15---20---25---30
//! Windows:  [----------]
//!                [----------]
//!                     [----------]
//! ```
//!
//! ## Session Windows
//! Windows closed by a gap of inactivity. An event inside an open session's
//! gap extends it, and an event bridging two sessions merges them.
//!
//! ```text
//! Time:     0-2--5----------12-14----20
//! Sessions: [----]           [---]   [-]
//! ```
//!
//! ## Global Windows
//! One unbounded pane per group, completed by count, size, time or custom
//! triggers, or flushed when the job stops.
//!
//! # Completion
//!
//! Bounded windows complete once the watermark reaches `end + allowed
//! lateness`. Triggers may complete any window earlier; an early-completed
//! fixed window is tombstoned so late members cannot reopen it.
//!
//! # Example
//!
//! ```rust
//! use processor::config::{AggregateDef, AggregateFunction, AggregationSpec, WindowSpec};
//! use processor::watermark::Watermark;
//! use processor::window::WindowOperator;
//! use serde_json::json;
//! use stream_analytics_types::Event;
//!
//! let spec = AggregationSpec {
//!     id: "per_minute".to_string(),
//!     group_by: vec![],
//!     window: WindowSpec::tumbling(60_000),
//!     functions: vec![AggregateDef::new("*", AggregateFunction::Count, "events")],
//!     triggers: vec![],
//! };
//! let mut operator = WindowOperator::new(&[spec]).unwrap();
//!
//! operator.process(&Event::at_millis(json!({}), 1_000), Watermark::min(), 0).unwrap();
//! let done = operator.on_watermark(Watermark::new(60_000));
//! assert_eq!(done[0].state.member_count, 1);
//! ```

pub mod assigner;
pub mod operator;
pub mod store;
pub mod trigger;
pub mod types;

pub use assigner::{
    assigner_for, group_key, GlobalWindowAssigner, GroupKey, SessionWindowAssigner,
    SlidingWindowAssigner, TumblingWindowAssigner, WindowAssigner, GROUP_SEPARATOR, NULL_SENTINEL,
};
pub use operator::{AssignOutcome, FiredWindow, WindowOperator};
pub use store::{StoreSnapshot, Tombstones, WindowState, WindowStore};
pub use trigger::{
    CountTrigger, ExpressionTrigger, ProcessingTimeTrigger, SizeTrigger, TriggerContext,
    TriggerResult, TriggerSet, WindowTrigger,
};
pub use types::{millis_to_datetime, WindowBounds, WindowKey, GLOBAL_WINDOW_END};
