//! Window assigners
//!
//! Assigners map an event time to the window bounds it belongs to. They are
//! pure functions of the timestamp: the same input always yields the same
//! windows, which keeps replay after recovery deterministic. Session merging
//! and global pane reuse depend on open state and are done by the
//! [`WindowStore`](super::store::WindowStore).

use super::types::WindowBounds;
use crate::config::{WindowKind, WindowSpec};
use crate::error::{ValidationError, ValidationResult};
use serde_json::{Map, Value};
use std::fmt;
use stream_analytics_types::Event;

/// Separator between group-by values in an encoded group key
pub const GROUP_SEPARATOR: char = '\u{1f}';

/// Prefix of every non-string group-by value
pub const TYPED_VALUE_MARKER: char = '\u{0}';

/// Encoding of a null or missing group-by value
pub const NULL_SENTINEL: &str = "\u{0}null";

/// Escapes the separator, the typed-value marker and itself inside strings
const ESCAPE: char = '\u{10}';

/// Trait for assigning events to windows
pub trait WindowAssigner: Send + Sync + fmt::Debug {
    /// Windows containing the timestamp, in ascending start order
    fn assign_windows(&self, timestamp: i64) -> Vec<WindowBounds>;

    /// Maximum number of windows an event can be assigned to
    fn max_windows_per_event(&self) -> usize {
        1
    }

    fn kind(&self) -> WindowKind;
}

/// Fixed-size, non-overlapping windows
///
/// ```text
/// Window size: 5
/// Event at 7 -> [5, 10)
/// Event at -3 -> [-5, 0)
/// ```
#[derive(Debug, Clone)]
pub struct TumblingWindowAssigner {
    size: i64,
}

impl TumblingWindowAssigner {
    pub fn new(size_ms: i64) -> Self {
        assert!(size_ms > 0, "Window size must be positive");
        Self { size: size_ms }
    }

    fn window_start(&self, timestamp: i64) -> i64 {
        timestamp.div_euclid(self.size) * self.size
    }
}

impl WindowAssigner for TumblingWindowAssigner {
    fn assign_windows(&self, timestamp: i64) -> Vec<WindowBounds> {
        let start = self.window_start(timestamp);
        vec![WindowBounds::new(start, start.saturating_add(self.size))]
    }

    fn kind(&self) -> WindowKind {
        WindowKind::Tumbling
    }
}

/// Fixed-size windows starting every `slide`
///
/// ```text
/// Window size: 10, Slide: 5
/// Event at 7 -> [0, 10), [5, 15)
/// ```
#[derive(Debug, Clone)]
pub struct SlidingWindowAssigner {
    size: i64,
    slide: i64,
}

impl SlidingWindowAssigner {
    pub fn new(size_ms: i64, slide_ms: i64) -> Self {
        assert!(size_ms > 0, "Window size must be positive");
        assert!(slide_ms > 0, "Slide must be positive");
        assert!(slide_ms <= size_ms, "Slide must not be larger than window size");
        Self {
            size: size_ms,
            slide: slide_ms,
        }
    }
}

impl WindowAssigner for SlidingWindowAssigner {
    fn assign_windows(&self, timestamp: i64) -> Vec<WindowBounds> {
        let latest = timestamp.div_euclid(self.slide) * self.slide;
        let earliest_allowed = timestamp.saturating_sub(self.size);

        let mut windows = Vec::with_capacity(self.max_windows_per_event());
        let mut start = latest;
        while start > earliest_allowed {
            windows.push(WindowBounds::new(start, start.saturating_add(self.size)));
            start -= self.slide;
        }
        windows.reverse();
        windows
    }

    fn max_windows_per_event(&self) -> usize {
        ((self.size + self.slide - 1) / self.slide) as usize
    }

    fn kind(&self) -> WindowKind {
        WindowKind::Sliding
    }
}

/// Gap-based windows
///
/// Each event proposes `[t, t + timeout)`; the store extends or merges open
/// sessions of the same group that this proposal touches.
///
/// ```text
/// Session timeout: 5
/// Events at 0, 2, 10 -> [0, 7), [10, 15)
/// Event at 8 arrives  -> [0, 15)
/// ```
#[derive(Debug, Clone)]
pub struct SessionWindowAssigner {
    timeout: i64,
}

impl SessionWindowAssigner {
    pub fn new(timeout_ms: i64) -> Self {
        assert!(timeout_ms > 0, "Session gap must be positive");
        Self { timeout: timeout_ms }
    }

    pub fn timeout(&self) -> i64 {
        self.timeout
    }
}

impl WindowAssigner for SessionWindowAssigner {
    fn assign_windows(&self, timestamp: i64) -> Vec<WindowBounds> {
        vec![WindowBounds::new(
            timestamp,
            timestamp.saturating_add(self.timeout),
        )]
    }

    fn kind(&self) -> WindowKind {
        WindowKind::Session
    }
}

/// One unbounded pane per group, completed only by triggers or shutdown
#[derive(Debug, Clone, Default)]
pub struct GlobalWindowAssigner;

impl WindowAssigner for GlobalWindowAssigner {
    fn assign_windows(&self, timestamp: i64) -> Vec<WindowBounds> {
        vec![WindowBounds::global(timestamp)]
    }

    fn kind(&self) -> WindowKind {
        WindowKind::Global
    }
}

/// Build the assigner for a validated window definition
pub fn assigner_for(spec: &WindowSpec) -> ValidationResult<Box<dyn WindowAssigner>> {
    let positive = |value: Option<u64>, field: &str| -> ValidationResult<i64> {
        match value {
            Some(v) if v > 0 && v <= i64::MAX as u64 => Ok(v as i64),
            _ => Err(ValidationError::invalid(
                format!("window.{}", field),
                "must be a positive number of milliseconds",
            )),
        }
    };

    Ok(match spec.kind {
        WindowKind::Tumbling => Box::new(TumblingWindowAssigner::new(positive(
            spec.size_ms,
            "size_ms",
        )?)),
        WindowKind::Sliding => {
            let size = positive(spec.size_ms, "size_ms")?;
            let slide = positive(spec.slide_ms, "slide_ms")?;
            if slide > size {
                return Err(ValidationError::invalid(
                    "window.slide_ms",
                    "must not exceed size_ms",
                ));
            }
            Box::new(SlidingWindowAssigner::new(size, slide))
        }
        WindowKind::Session => Box::new(SessionWindowAssigner::new(positive(
            spec.session_timeout_ms,
            "session_timeout_ms",
        )?)),
        WindowKind::Global => Box::new(GlobalWindowAssigner),
    })
}

/// Group key of an event for a list of group-by fields
#[derive(Debug, Clone, PartialEq)]
pub struct GroupKey {
    /// Stable encoded key
    pub encoded: String,
    /// Group-by values by field name (null for missing fields)
    pub values: Map<String, Value>,
}

/// Compute the group key: values joined by [`GROUP_SEPARATOR`]
///
/// Strings are written raw apart from escaping the separator and marker
/// characters. Every other value is its JSON text behind
/// [`TYPED_VALUE_MARKER`], so the string `"1"` and the number `1` get
/// different keys. Null and missing values encode as [`NULL_SENTINEL`].
pub fn group_key(event: &Event, fields: &[String]) -> GroupKey {
    let mut encoded = String::new();
    let mut values = Map::new();

    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            encoded.push(GROUP_SEPARATOR);
        }
        match event.field(field) {
            None => {
                encoded.push_str(NULL_SENTINEL);
                values.insert(field.clone(), Value::Null);
            }
            Some(Value::Null) => {
                encoded.push_str(NULL_SENTINEL);
                values.insert(field.clone(), Value::Null);
            }
            Some(Value::String(s)) => {
                push_escaped(&mut encoded, s);
                values.insert(field.clone(), Value::String(s.clone()));
            }
            Some(other) => {
                encoded.push(TYPED_VALUE_MARKER);
                encoded.push_str(&other.to_string());
                values.insert(field.clone(), other.clone());
            }
        }
    }

    GroupKey { encoded, values }
}

fn push_escaped(out: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            ESCAPE => {
                out.push(ESCAPE);
                out.push(ESCAPE);
            }
            TYPED_VALUE_MARKER => {
                out.push(ESCAPE);
                out.push('0');
            }
            GROUP_SEPARATOR => {
                out.push(ESCAPE);
                out.push('s');
            }
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_tumbling_window_assignment() {
        let assigner = TumblingWindowAssigner::new(1000);

        assert_eq!(assigner.assign_windows(500), vec![WindowBounds::new(0, 1000)]);
        assert_eq!(assigner.assign_windows(1500), vec![WindowBounds::new(1000, 2000)]);
        // Boundary goes to the next window
        assert_eq!(assigner.assign_windows(2000), vec![WindowBounds::new(2000, 3000)]);
        // Floor division for negative times
        assert_eq!(assigner.assign_windows(-1), vec![WindowBounds::new(-1000, 0)]);
    }

    #[test]
    fn test_sliding_window_assignment() {
        let assigner = SlidingWindowAssigner::new(1000, 500);

        assert_eq!(
            assigner.assign_windows(700),
            vec![WindowBounds::new(0, 1000), WindowBounds::new(500, 1500)]
        );
        assert_eq!(
            assigner.assign_windows(1000),
            vec![WindowBounds::new(500, 1500), WindowBounds::new(1000, 2000)]
        );
    }

    #[test]
    fn test_sliding_window_non_divisible_slide() {
        let assigner = SlidingWindowAssigner::new(1000, 300);
        assert_eq!(assigner.max_windows_per_event(), 4);
        for t in [0, 1, 299, 300, 950, 12_345] {
            let windows = assigner.assign_windows(t);
            assert!(windows.len() == 3 || windows.len() == 4);
            assert!(windows.iter().all(|w| w.contains(t)));
        }
    }

    #[test]
    fn test_session_window_assignment() {
        let assigner = SessionWindowAssigner::new(5000);
        assert_eq!(assigner.assign_windows(1000), vec![WindowBounds::new(1000, 6000)]);
    }

    #[test]
    fn test_assigner_for_spec() {
        let tumbling = assigner_for(&WindowSpec::tumbling(60_000)).unwrap();
        assert_eq!(tumbling.kind(), WindowKind::Tumbling);
        let global = assigner_for(&WindowSpec::global()).unwrap();
        assert!(global.assign_windows(5)[0].is_global());
        assert!(assigner_for(&WindowSpec::tumbling(0)).is_err());
    }

    #[test]
    #[should_panic(expected = "Slide must not be larger than window size")]
    fn test_sliding_invalid_slide() {
        SlidingWindowAssigner::new(1000, 2000);
    }

    #[test]
    fn test_group_key_encoding() {
        let fields = vec!["country".to_string(), "tier".to_string()];

        let a = group_key(&Event::at_millis(json!({"country": "DE", "tier": 2}), 0), &fields);
        assert_eq!(a.encoded, "DE\u{1f}\u{0}2");
        assert_eq!(a.values["tier"], json!(2));

        // A literal "null" string must not collide with a missing value
        let literal = group_key(&Event::at_millis(json!({"country": "null"}), 0), &fields);
        let missing = group_key(&Event::at_millis(json!({"tier": null}), 0), &fields);
        assert_ne!(literal.encoded, missing.encoded);
        assert_eq!(missing.encoded, format!("{}\u{1f}{}", NULL_SENTINEL, NULL_SENTINEL));

        let empty = group_key(&Event::at_millis(json!({"x": 1}), 0), &[]);
        assert_eq!(empty.encoded, "");
    }

    #[test]
    fn test_group_key_distinguishes_types_and_separators() {
        let key = |payload: Value, fields: &[&str]| {
            let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
            group_key(&Event::at_millis(payload, 0), &fields).encoded
        };

        assert_ne!(key(json!({"k": "1"}), &["k"]), key(json!({"k": 1}), &["k"]));
        assert_ne!(key(json!({"k": "true"}), &["k"]), key(json!({"k": true}), &["k"]));
        assert_ne!(key(json!({"k": "\u{0}null"}), &["k"]), key(json!({"k": null}), &["k"]));

        // A separator inside a value cannot shift the field boundary
        assert_ne!(
            key(json!({"a": "x\u{1f}y", "b": "z"}), &["a", "b"]),
            key(json!({"a": "x", "b": "y\u{1f}z"}), &["a", "b"])
        );
        assert_ne!(
            key(json!({"a": "x\u{10}", "b": "s"}), &["a", "b"]),
            key(json!({"a": "x\u{1f}", "b": "s"}), &["a", "b"])
        );
        assert_eq!(key(json!({"k": 2.5}), &["k"]), "\u{0}2.5");
    }
}
