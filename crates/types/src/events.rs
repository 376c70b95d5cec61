//! Event types flowing through the analytics pipeline

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::errors::{AnalyticsError, Result};

/// Core event structure
///
/// The payload is an opaque JSON object. `event_time` is assigned by the source
/// and is authoritative for windowing; `ingest_time` is the wall clock at arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for the event
    pub id: Uuid,
    /// Event payload
    pub payload: Map<String, Value>,
    /// Timestamp when the event occurred
    pub event_time: DateTime<Utc>,
    /// Timestamp when the event entered the engine
    pub ingest_time: DateTime<Utc>,
    /// Source partition, if the source is partitioned
    #[serde(default)]
    pub partition: Option<u32>,
    /// Source offset used for replay and checkpoint bookkeeping
    #[serde(default)]
    pub offset: Option<u64>,
}

impl Event {
    /// Create a new event with the given payload and event time
    pub fn new(payload: Map<String, Value>, event_time: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            event_time,
            ingest_time: Utc::now(),
            partition: None,
            offset: None,
        }
    }

    /// Create an event from a JSON value; non-object values are wrapped as `{"value": ...}`
    pub fn from_value(value: Value, event_time: DateTime<Utc>) -> Self {
        let payload = match value {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self::new(payload, event_time)
    }

    /// Create an event whose event time is given in epoch milliseconds
    pub fn at_millis(payload: Value, event_time_ms: i64) -> Self {
        let event_time = Utc
            .timestamp_millis_opt(event_time_ms)
            .single()
            .unwrap_or_else(Utc::now);
        Self::from_value(payload, event_time)
    }

    /// Set the source offset
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Set the source partition
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Decode one JSON line into an event
    ///
    /// The event time is read from `time_field` when present (RFC 3339 string or
    /// epoch milliseconds); otherwise the ingest time is used.
    pub fn from_json_line(line: &str, time_field: Option<&str>) -> Result<Self> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(payload) = value else {
            return Err(AnalyticsError::InvalidEvent(
                "event must be a JSON object".to_string(),
            ));
        };

        let now = Utc::now();
        let event_time = match time_field.and_then(|f| lookup(&payload, f)) {
            Some(raw) => parse_timestamp(raw).ok_or_else(|| {
                AnalyticsError::InvalidEvent(format!("unparseable event time: {}", raw))
            })?,
            None => now,
        };

        Ok(Self {
            id: Uuid::new_v4(),
            payload,
            event_time,
            ingest_time: now,
            partition: None,
            offset: None,
        })
    }

    /// Event time in epoch milliseconds
    pub fn event_time_ms(&self) -> i64 {
        self.event_time.timestamp_millis()
    }

    /// Resolve a dotted field path; missing paths and JSON null both return `None`
    pub fn field(&self, path: &str) -> Option<&Value> {
        lookup(&self.payload, path)
    }

    /// Approximate in-memory size of the payload in bytes
    pub fn approx_size(&self) -> usize {
        self.payload
            .iter()
            .map(|(k, v)| k.len() + value_size(v))
            .sum()
    }
}

/// Resolve a dotted path inside a JSON object
pub fn lookup<'a>(map: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if let Some(value) = map.get(path) {
        return non_null(value);
    }

    let mut parts = path.split('.');
    let mut current = map.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(inner) => inner.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    non_null(current)
}

fn non_null(value: &Value) -> Option<&Value> {
    if value.is_null() {
        None
    } else {
        Some(value)
    }
}

/// Parse a JSON value as a timestamp (RFC 3339 string or epoch milliseconds)
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| s.parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())),
        _ => None,
    }
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null => 4,
        Value::Bool(_) => 1,
        Value::Number(_) => 8,
        Value::String(s) => s.len(),
        Value::Array(items) => items.iter().map(value_size).sum(),
        Value::Object(map) => map.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_creation() {
        let event = Event::at_millis(json!({"user": "a", "amount": 12.5}), 1_000);
        assert_eq!(event.event_time_ms(), 1_000);
        assert_eq!(event.field("user"), Some(&json!("a")));
        assert!(event.offset.is_none());
    }

    #[test]
    fn test_dotted_field_lookup() {
        let event = Event::at_millis(
            json!({"user": {"country": "DE", "tags": ["x", "y"]}, "missing": null}),
            0,
        );
        assert_eq!(event.field("user.country"), Some(&json!("DE")));
        assert_eq!(event.field("user.tags.1"), Some(&json!("y")));
        assert_eq!(event.field("user.city"), None);
        assert_eq!(event.field("missing"), None);
    }

    #[test]
    fn test_from_json_line_with_time_field() {
        let event =
            Event::from_json_line(r#"{"ts": 60000, "v": 1}"#, Some("ts")).unwrap();
        assert_eq!(event.event_time_ms(), 60_000);

        let event = Event::from_json_line(
            r#"{"ts": "1970-01-01T00:01:00Z", "v": 1}"#,
            Some("ts"),
        )
        .unwrap();
        assert_eq!(event.event_time_ms(), 60_000);
    }

    #[test]
    fn test_from_json_line_rejects_non_objects() {
        assert!(Event::from_json_line("[1, 2]", None).is_err());
        assert!(Event::from_json_line(r#"{"ts": true}"#, Some("ts")).is_err());
    }

    #[test]
    fn test_approx_size_grows_with_payload() {
        let small = Event::at_millis(json!({"a": 1}), 0);
        let large = Event::at_millis(json!({"a": 1, "text": "x".repeat(100)}), 0);
        assert!(large.approx_size() > small.approx_size());
    }
}
