//! Output records: completed windows and alert firings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::ids::StreamId;

/// Why a window was completed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    /// Watermark passed window end plus allowed lateness
    Watermark,
    /// Member count threshold reached
    Count,
    /// Accumulated payload size threshold reached
    Size,
    /// Processing-time timer elapsed
    Time,
    /// Custom expression over the window outputs became true
    Custom,
    /// Flushed while the job was stopping
    Shutdown,
}

impl CompletionReason {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Watermark => "watermark",
            Self::Count => "count",
            Self::Size => "size",
            Self::Time => "time",
            Self::Custom => "custom",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Immutable result of a completed window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub stream_id: StreamId,
    pub aggregation_id: String,
    /// Encoded group key
    pub group_key: String,
    /// Group-by field values, by field name
    pub group: Map<String, Value>,
    pub window_start: DateTime<Utc>,
    /// `None` for global windows
    pub window_end: Option<DateTime<Utc>>,
    pub member_count: u64,
    /// Aggregate outputs by output field
    pub values: BTreeMap<String, Value>,
    pub reason: CompletionReason,
    pub emitted_at: DateTime<Utc>,
}

impl WindowResult {
    /// Get an output value by field name
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    /// Get an output value as f64
    pub fn value_f64(&self, field: &str) -> Option<f64> {
        self.values.get(field).and_then(Value::as_f64)
    }
}

/// Alert severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Info,
    #[default]
    Warning,
    Critical,
}

/// A fired alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertFiring {
    pub id: Uuid,
    pub stream_id: StreamId,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub event_id: Uuid,
    pub event_time: DateTime<Utc>,
    pub fired_at: DateTime<Utc>,
}
