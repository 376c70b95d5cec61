//! Stream definitions
//!
//! A [`StreamSpec`] is submitted once when a stream is registered and is
//! immutable while a job runs. Every section carries serde defaults so a
//! minimal YAML document is enough:
//!
//! ```yaml
//! id: orders
//! source:
//!   time_field: ts
//! aggregations:
//!   - id: per_minute
//!     group_by: [country]
//!     window: { type: tumbling, size_ms: 60000, allowed_lateness_ms: 5000 }
//!     functions:
//!       - { field: amount, function: sum, output: revenue }
//!       - { field: "*", function: count, output: orders }
//! ```
//!
//! [`StreamSpec::validate`] rejects unsupported combinations before a job
//! starts, reporting the offending field path.

use crate::error::{ValidationError, ValidationResult};
use crate::expr::CompiledExpr;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use stream_analytics_types::{AlertSeverity, StreamId};

/// Complete definition of one stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSpec {
    /// Stream identifier
    pub id: String,

    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,

    /// Source descriptor
    #[serde(default)]
    pub source: SourceSpec,

    /// Ordered filter chain
    #[serde(default)]
    pub filters: Vec<FilterDef>,

    /// Ordered transformation pipeline
    #[serde(default)]
    pub transforms: Vec<TransformDef>,

    /// Ordered enrichment stage
    #[serde(default)]
    pub enrichments: Vec<EnrichmentDef>,

    /// Windowed aggregations
    #[serde(default)]
    pub aggregations: Vec<AggregationSpec>,

    /// Per-event alert rules
    #[serde(default)]
    pub alerts: Vec<AlertRule>,

    /// Watermark policy
    #[serde(default)]
    pub watermark: WatermarkPolicy,

    /// Checkpoint policy
    #[serde(default)]
    pub checkpoint: CheckpointPolicy,

    /// Backpressure policy
    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// Sink delivery retry policy
    #[serde(default)]
    pub delivery: RetryConfig,

    /// Forward events that passed the stages to the sinks
    #[serde(default)]
    pub emit_raw_events: bool,

    /// Job-level error and lifecycle limits
    #[serde(default)]
    pub limits: JobLimits,
}

impl StreamSpec {
    /// Empty definition with default policies
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            source: SourceSpec::default(),
            filters: Vec::new(),
            transforms: Vec::new(),
            enrichments: Vec::new(),
            aggregations: Vec::new(),
            alerts: Vec::new(),
            watermark: WatermarkPolicy::default(),
            checkpoint: CheckpointPolicy::default(),
            backpressure: BackpressurePolicy::default(),
            delivery: RetryConfig::default(),
            emit_raw_events: false,
            limits: JobLimits::default(),
        }
    }

    pub fn with_aggregation(mut self, aggregation: AggregationSpec) -> Self {
        self.aggregations.push(aggregation);
        self
    }

    /// Typed stream identifier
    pub fn stream_id(&self) -> ValidationResult<StreamId> {
        StreamId::new(&self.id).map_err(|e| ValidationError::invalid("id", e.to_string()))
    }

    /// Validate the whole definition; the first problem found is returned
    pub fn validate(&self) -> ValidationResult<()> {
        self.stream_id()?;

        if self.aggregations.is_empty() && self.alerts.is_empty() && !self.emit_raw_events {
            return Err(ValidationError::invalid(
                "aggregations",
                "a stream needs at least one aggregation or alert rule, or emit_raw_events",
            ));
        }

        self.source.validate()?;

        for (i, filter) in self.filters.iter().enumerate() {
            filter.validate(&format!("filters[{}]", i))?;
        }
        for (i, transform) in self.transforms.iter().enumerate() {
            transform.validate(&format!("transforms[{}]", i))?;
        }

        let mut enrichment_names = HashSet::new();
        for (i, enrichment) in self.enrichments.iter().enumerate() {
            enrichment.validate(&format!("enrichments[{}]", i))?;
            if !enrichment_names.insert(enrichment.name.as_str()) {
                return Err(ValidationError::Duplicate {
                    kind: "enrichment".to_string(),
                    id: enrichment.name.clone(),
                });
            }
        }

        let mut aggregation_ids = HashSet::new();
        for (i, aggregation) in self.aggregations.iter().enumerate() {
            aggregation.validate(&format!("aggregations[{}]", i))?;
            if !aggregation_ids.insert(aggregation.id.as_str()) {
                return Err(ValidationError::Duplicate {
                    kind: "aggregation".to_string(),
                    id: aggregation.id.clone(),
                });
            }
        }

        let mut alert_ids = HashSet::new();
        for (i, alert) in self.alerts.iter().enumerate() {
            alert.validate(&format!("alerts[{}]", i))?;
            if !alert_ids.insert(alert.id.as_str()) {
                return Err(ValidationError::Duplicate {
                    kind: "alert".to_string(),
                    id: alert.id.clone(),
                });
            }
        }

        self.watermark.validate()?;
        self.checkpoint.validate()?;
        self.backpressure.validate()?;
        self.delivery.validate("delivery")?;
        self.limits.validate()?;

        Ok(())
    }
}

fn check_expression(path: &str, source: &str) -> ValidationResult<CompiledExpr> {
    CompiledExpr::parse(source).map_err(|source| ValidationError::Expression {
        path: path.to_string(),
        source,
    })
}

fn check_non_empty(path: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::invalid(path, "must not be empty"));
    }
    Ok(())
}

/// Source descriptor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Payload field holding the event time (RFC 3339 or epoch ms); ingest time otherwise
    #[serde(default)]
    pub time_field: Option<String>,

    /// Maximum events processed per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Delay between polls when the source returned nothing
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for SourceSpec {
    fn default() -> Self {
        Self {
            time_field: None,
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl SourceSpec {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.batch_size == 0 {
            return Err(ValidationError::invalid(
                "source.batch_size",
                "must be greater than 0",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ValidationError::invalid(
                "source.poll_interval_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// One filter predicate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterDef {
    pub name: String,
    pub condition: String,
}

impl FilterDef {
    fn validate(&self, path: &str) -> ValidationResult<()> {
        check_non_empty(&format!("{}.name", path), &self.name)?;
        check_expression(&format!("{}.condition", path), &self.condition)?;
        Ok(())
    }
}

/// Target representation for `parse` transforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseKind {
    Number,
    Boolean,
    Json,
    Timestamp,
}

/// One transformation step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformDef {
    /// Rename a field
    Map { field: String, to: String },
    /// Keep only the listed fields
    Project { fields: Vec<String> },
    /// Set a field from an expression
    Compute { field: String, expression: String },
    /// Parse a string field
    Parse {
        field: String,
        #[serde(rename = "as")]
        kind: ParseKind,
    },
    /// Remove fields
    Drop { fields: Vec<String> },
    /// Re-derive the event time from a payload field
    SetEventTime { field: String },
}

impl TransformDef {
    /// Short name used in errors and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Map { .. } => "map",
            Self::Project { .. } => "project",
            Self::Compute { .. } => "compute",
            Self::Parse { .. } => "parse",
            Self::Drop { .. } => "drop",
            Self::SetEventTime { .. } => "set_event_time",
        }
    }

    fn validate(&self, path: &str) -> ValidationResult<()> {
        match self {
            Self::Map { field, to } => {
                check_non_empty(&format!("{}.field", path), field)?;
                check_non_empty(&format!("{}.to", path), to)?;
            }
            Self::Project { fields } | Self::Drop { fields } => {
                if fields.is_empty() {
                    return Err(ValidationError::invalid(
                        format!("{}.fields", path),
                        "at least one field is required",
                    ));
                }
                for (i, field) in fields.iter().enumerate() {
                    check_non_empty(&format!("{}.fields[{}]", path, i), field)?;
                }
            }
            Self::Compute { field, expression } => {
                check_non_empty(&format!("{}.field", path), field)?;
                check_expression(&format!("{}.expression", path), expression)?;
            }
            Self::Parse { field, .. } | Self::SetEventTime { field } => {
                check_non_empty(&format!("{}.field", path), field)?;
            }
        }
        Ok(())
    }
}

/// Behaviour when an enrichment key has no match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMissing {
    /// Leave the event unchanged
    #[default]
    Skip,
    /// Report a stage error and drop the event
    Fail,
}

/// One enrichment lookup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentDef {
    pub name: String,

    /// Registered provider name
    pub provider: String,

    /// Payload field holding the lookup key
    pub key_field: String,

    /// Fields to copy from the lookup result; all fields when empty
    #[serde(default)]
    pub fields: Vec<String>,

    /// Nest the copied fields under this object; merged at top level otherwise
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub on_missing: OnMissing,

    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,

    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
}

impl EnrichmentDef {
    fn validate(&self, path: &str) -> ValidationResult<()> {
        check_non_empty(&format!("{}.name", path), &self.name)?;
        check_non_empty(&format!("{}.provider", path), &self.provider)?;
        check_non_empty(&format!("{}.key_field", path), &self.key_field)?;
        if self.cache_max_entries == 0 {
            return Err(ValidationError::invalid(
                format!("{}.cache_max_entries", path),
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Window shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Tumbling,
    Sliding,
    Session,
    Global,
}

impl WindowKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tumbling => "tumbling",
            Self::Sliding => "sliding",
            Self::Session => "session",
            Self::Global => "global",
        }
    }
}

/// Window definition; all durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSpec {
    #[serde(rename = "type")]
    pub kind: WindowKind,

    /// Window length (tumbling, sliding)
    #[serde(default)]
    pub size_ms: Option<u64>,

    /// Distance between window starts (sliding only)
    #[serde(default)]
    pub slide_ms: Option<u64>,

    /// Inactivity gap closing a session (session only)
    #[serde(default)]
    pub session_timeout_ms: Option<u64>,

    /// Grace period after the window end during which late events are accepted
    #[serde(default)]
    pub allowed_lateness_ms: u64,
}

impl WindowSpec {
    pub fn tumbling(size_ms: u64) -> Self {
        Self {
            kind: WindowKind::Tumbling,
            size_ms: Some(size_ms),
            slide_ms: None,
            session_timeout_ms: None,
            allowed_lateness_ms: 0,
        }
    }

    pub fn sliding(size_ms: u64, slide_ms: u64) -> Self {
        Self {
            kind: WindowKind::Sliding,
            size_ms: Some(size_ms),
            slide_ms: Some(slide_ms),
            session_timeout_ms: None,
            allowed_lateness_ms: 0,
        }
    }

    pub fn session(timeout_ms: u64) -> Self {
        Self {
            kind: WindowKind::Session,
            size_ms: None,
            slide_ms: None,
            session_timeout_ms: Some(timeout_ms),
            allowed_lateness_ms: 0,
        }
    }

    pub fn global() -> Self {
        Self {
            kind: WindowKind::Global,
            size_ms: None,
            slide_ms: None,
            session_timeout_ms: None,
            allowed_lateness_ms: 0,
        }
    }

    pub fn with_allowed_lateness(mut self, lateness_ms: u64) -> Self {
        self.allowed_lateness_ms = lateness_ms;
        self
    }

    pub fn validate(&self, path: &str) -> ValidationResult<()> {
        let field = |name: &str| format!("{}.{}", path, name);
        let kind = self.kind.name();

        match self.kind {
            WindowKind::Tumbling | WindowKind::Sliding => {
                match self.size_ms {
                    Some(size) if size > 0 => {}
                    _ => {
                        return Err(ValidationError::invalid(
                            field("size_ms"),
                            format!("{} windows need a size greater than 0", kind),
                        ))
                    }
                }
                if self.session_timeout_ms.is_some() {
                    return Err(ValidationError::unsupported(
                        field("session_timeout_ms"),
                        format!("{} windows do not take a session timeout", kind),
                    ));
                }
            }
            WindowKind::Session => {
                match self.session_timeout_ms {
                    Some(timeout) if timeout > 0 => {}
                    _ => {
                        return Err(ValidationError::invalid(
                            field("session_timeout_ms"),
                            "session windows need a timeout greater than 0",
                        ))
                    }
                }
                if self.size_ms.is_some() {
                    return Err(ValidationError::unsupported(
                        field("size_ms"),
                        "session windows do not take a size",
                    ));
                }
            }
            WindowKind::Global => {
                if self.size_ms.is_some() || self.session_timeout_ms.is_some() {
                    return Err(ValidationError::unsupported(
                        path,
                        "global windows take neither a size nor a session timeout",
                    ));
                }
            }
        }

        match (self.kind, self.slide_ms) {
            (WindowKind::Sliding, Some(slide)) => {
                let size = self.size_ms.unwrap_or(0);
                if slide == 0 || slide > size {
                    return Err(ValidationError::invalid(
                        field("slide_ms"),
                        format!("slide must be in (0, size]; got {} for size {}", slide, size),
                    ));
                }
            }
            (WindowKind::Sliding, None) => {
                return Err(ValidationError::invalid(
                    field("slide_ms"),
                    "sliding windows need a slide",
                ))
            }
            (_, Some(_)) => {
                return Err(ValidationError::unsupported(
                    field("slide_ms"),
                    format!("{} windows do not take a slide", kind),
                ))
            }
            (_, None) => {}
        }

        Ok(())
    }
}

/// Aggregate functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
    Stddev,
    Variance,
    Distinct,
    Percentile,
    First,
    Last,
}

impl AggregateFunction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Avg => "avg",
            Self::Min => "min",
            Self::Max => "max",
            Self::Stddev => "stddev",
            Self::Variance => "variance",
            Self::Distinct => "distinct",
            Self::Percentile => "percentile",
            Self::First => "first",
            Self::Last => "last",
        }
    }
}

/// One `(field, function, output)` triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDef {
    /// Input field; `*` counts every member (count only)
    pub field: String,

    pub function: AggregateFunction,

    /// Output field name; defaults to `<function>_<field>`
    #[serde(default)]
    pub output: Option<String>,

    /// Percentile in (0, 100] (percentile only)
    #[serde(default)]
    pub percentile: Option<f64>,
}

impl AggregateDef {
    pub fn new(field: impl Into<String>, function: AggregateFunction, output: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            function,
            output: Some(output.into()),
            percentile: None,
        }
    }

    pub fn with_percentile(mut self, percentile: f64) -> Self {
        self.percentile = Some(percentile);
        self
    }

    /// Resolved output field name
    pub fn output_field(&self) -> String {
        match &self.output {
            Some(output) => output.clone(),
            None if self.field == "*" => self.function.name().to_string(),
            None => format!("{}_{}", self.function.name(), self.field.replace('.', "_")),
        }
    }

    fn validate(&self, path: &str) -> ValidationResult<()> {
        check_non_empty(&format!("{}.field", path), &self.field)?;
        if self.field == "*" && self.function != AggregateFunction::Count {
            return Err(ValidationError::unsupported(
                format!("{}.field", path),
                "'*' is only valid with count",
            ));
        }

        match (self.function, self.percentile) {
            (AggregateFunction::Percentile, Some(p)) if p > 0.0 && p <= 100.0 => {}
            (AggregateFunction::Percentile, Some(p)) => {
                return Err(ValidationError::invalid(
                    format!("{}.percentile", path),
                    format!("percentile {} is outside (0, 100]", p),
                ))
            }
            (AggregateFunction::Percentile, None) => {
                return Err(ValidationError::invalid(
                    format!("{}.percentile", path),
                    "percentile functions need a percentile",
                ))
            }
            (_, Some(_)) => {
                return Err(ValidationError::unsupported(
                    format!("{}.percentile", path),
                    "only percentile functions take a percentile",
                ))
            }
            (_, None) => {}
        }
        Ok(())
    }
}

/// Early completion trigger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDef {
    /// Fire once the window has this many members
    Count { count: u64 },
    /// Fire once member payloads add up to this many bytes
    Size { bytes: u64 },
    /// Fire this long (processing time) after the window opened
    Time { after_ms: u64 },
    /// Fire when an expression over the window outputs is true
    Custom { expression: String },
}

impl TriggerDef {
    fn validate(&self, path: &str) -> ValidationResult<()> {
        match self {
            Self::Count { count: 0 } => Err(ValidationError::invalid(
                format!("{}.count", path),
                "must be greater than 0",
            )),
            Self::Size { bytes: 0 } => Err(ValidationError::invalid(
                format!("{}.bytes", path),
                "must be greater than 0",
            )),
            Self::Time { after_ms: 0 } => Err(ValidationError::invalid(
                format!("{}.after_ms", path),
                "must be greater than 0",
            )),
            Self::Custom { expression } => {
                check_expression(&format!("{}.expression", path), expression).map(|_| ())
            }
            _ => Ok(()),
        }
    }
}

/// One windowed aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSpec {
    pub id: String,

    /// Group-by fields; one group per stream when empty
    #[serde(default)]
    pub group_by: Vec<String>,

    pub window: WindowSpec,

    pub functions: Vec<AggregateDef>,

    #[serde(default)]
    pub triggers: Vec<TriggerDef>,
}

impl AggregationSpec {
    pub fn new(id: impl Into<String>, window: WindowSpec, functions: Vec<AggregateDef>) -> Self {
        Self {
            id: id.into(),
            group_by: Vec::new(),
            window,
            functions,
            triggers: Vec::new(),
        }
    }

    pub fn group_by(mut self, fields: &[&str]) -> Self {
        self.group_by = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_trigger(mut self, trigger: TriggerDef) -> Self {
        self.triggers.push(trigger);
        self
    }

    pub fn validate(&self, path: &str) -> ValidationResult<()> {
        check_non_empty(&format!("{}.id", path), &self.id)?;
        if self.id.contains('/') {
            return Err(ValidationError::invalid(
                format!("{}.id", path),
                "must not contain '/'",
            ));
        }

        self.window.validate(&format!("{}.window", path))?;

        if self.functions.is_empty() {
            return Err(ValidationError::invalid(
                format!("{}.functions", path),
                "at least one aggregate function is required",
            ));
        }

        let mut outputs = HashSet::new();
        for (i, function) in self.functions.iter().enumerate() {
            let function_path = format!("{}.functions[{}]", path, i);
            function.validate(&function_path)?;
            let output = function.output_field();
            if output == "member_count" || !outputs.insert(output.clone()) {
                return Err(ValidationError::Duplicate {
                    kind: format!("output field in {}", path),
                    id: output,
                });
            }
        }

        for (i, trigger) in self.triggers.iter().enumerate() {
            trigger.validate(&format!("{}.triggers[{}]", path, i))?;
        }

        if self.window.kind == WindowKind::Global && self.triggers.is_empty() {
            return Err(ValidationError::unsupported(
                format!("{}.triggers", path),
                "global windows never close on the watermark and need at least one trigger",
            ));
        }

        Ok(())
    }
}

/// One per-event alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub condition: String,

    #[serde(default)]
    pub severity: AlertSeverity,

    /// Message template; `{field}` placeholders are replaced from the event
    #[serde(default)]
    pub message: Option<String>,

    /// Minimum event-time distance between two firings of this rule
    #[serde(default)]
    pub cooldown_ms: u64,
}

impl AlertRule {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    fn validate(&self, path: &str) -> ValidationResult<()> {
        check_non_empty(&format!("{}.id", path), &self.id)?;
        check_expression(&format!("{}.condition", path), &self.condition)?;
        Ok(())
    }
}

/// Watermark policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatermarkPolicy {
    /// Maximum expected out-of-orderness
    #[serde(default)]
    pub max_out_of_order_ms: u64,

    /// No events for this long marks the stream idle
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Advance the watermark by wall-clock time while idle
    #[serde(default)]
    pub idle_advance: bool,
}

impl Default for WatermarkPolicy {
    fn default() -> Self {
        Self {
            max_out_of_order_ms: 0,
            idle_timeout_ms: default_idle_timeout(),
            idle_advance: false,
        }
    }
}

impl WatermarkPolicy {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.idle_timeout_ms == 0 {
            return Err(ValidationError::invalid(
                "watermark.idle_timeout_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Checkpoint policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPolicy {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_checkpoint_interval")]
    pub interval_ms: u64,

    /// Restore from the latest checkpoint when the job starts
    #[serde(default)]
    pub restore_on_start: bool,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_checkpoint_interval(),
            restore_on_start: false,
        }
    }
}

impl CheckpointPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.enabled && self.interval_ms == 0 {
            return Err(ValidationError::invalid(
                "checkpoint.interval_ms",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Overload policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureKind {
    /// Discard the newest events above the threshold
    Drop,
    /// Suspend ingestion until the queue drains
    #[default]
    Block,
    /// Persist overflow and replay it later
    Spill,
    /// Admit a random fraction above the threshold
    Sample,
}

impl BackpressureKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Drop => "drop",
            Self::Block => "block",
            Self::Spill => "spill",
            Self::Sample => "sample",
        }
    }
}

/// Backpressure policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackpressurePolicy {
    #[serde(default)]
    pub kind: BackpressureKind,

    /// Queue depth at which the policy applies
    #[serde(default = "default_threshold")]
    pub threshold: usize,

    /// Admission probability for `sample`
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    /// Overflow directory for `spill`; in-memory overflow when unset
    #[serde(default)]
    pub spill_dir: Option<PathBuf>,

    /// Spilled events are replayed while depth is below `threshold * resume_ratio`
    #[serde(default = "default_resume_ratio")]
    pub resume_ratio: f64,
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self {
            kind: BackpressureKind::default(),
            threshold: default_threshold(),
            sample_rate: default_sample_rate(),
            spill_dir: None,
            resume_ratio: default_resume_ratio(),
        }
    }
}

impl BackpressurePolicy {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.threshold == 0 {
            return Err(ValidationError::invalid(
                "backpressure.threshold",
                "must be greater than 0",
            ));
        }
        if !(self.sample_rate > 0.0 && self.sample_rate <= 1.0) {
            return Err(ValidationError::invalid(
                "backpressure.sample_rate",
                "must be in (0, 1]",
            ));
        }
        if !(self.resume_ratio > 0.0 && self.resume_ratio <= 1.0) {
            return Err(ValidationError::invalid(
                "backpressure.resume_ratio",
                "must be in (0, 1]",
            ));
        }
        Ok(())
    }
}

/// Retry policy for sink deliveries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Jitter factor (0.0-1.0)
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based); zero for the first try
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay_ms = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let delay_ms = delay_ms.min(self.max_delay_ms as f64);

        let jitter = delay_ms * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay_ms = (delay_ms + jitter).clamp(0.0, self.max_delay_ms as f64);

        Duration::from_millis(final_delay_ms as u64)
    }

    pub fn validate(&self, path: &str) -> ValidationResult<()> {
        if self.max_attempts == 0 {
            return Err(ValidationError::invalid(
                format!("{}.max_attempts", path),
                "must be greater than 0",
            ));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ValidationError::invalid(
                format!("{}.backoff_multiplier", path),
                "must be at least 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ValidationError::invalid(
                format!("{}.jitter_factor", path),
                "must be in [0, 1]",
            ));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ValidationError::invalid(
                format!("{}.initial_delay_ms", path),
                "must not exceed max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Job-level limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobLimits {
    /// Consecutive stage errors escalating to a fatal job error
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_stage_errors: u64,

    /// Errors stored on the job run; further errors are only counted
    #[serde(default = "default_max_recorded_errors")]
    pub max_recorded_errors: usize,

    /// Recovery attempts before the job fails
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,

    /// Emit still-open windows when the job stops
    #[serde(default = "default_true")]
    pub flush_on_stop: bool,
}

impl Default for JobLimits {
    fn default() -> Self {
        Self {
            max_consecutive_stage_errors: default_max_consecutive_errors(),
            max_recorded_errors: default_max_recorded_errors(),
            max_recovery_attempts: default_max_recovery_attempts(),
            flush_on_stop: true,
        }
    }
}

impl JobLimits {
    pub fn validate(&self) -> ValidationResult<()> {
        if self.max_consecutive_stage_errors == 0 {
            return Err(ValidationError::invalid(
                "limits.max_consecutive_stage_errors",
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_poll_interval() -> u64 {
    50
}

fn default_cache_ttl() -> u64 {
    60_000
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_idle_timeout() -> u64 {
    30_000
}

fn default_checkpoint_interval() -> u64 {
    10_000
}

fn default_threshold() -> usize {
    10_000
}

fn default_sample_rate() -> f64 {
    0.1
}

fn default_resume_ratio() -> f64 {
    0.5
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    100
}

fn default_max_delay() -> u64 {
    10_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_factor() -> f64 {
    0.2
}

fn default_max_consecutive_errors() -> u64 {
    100
}

fn default_max_recorded_errors() -> usize {
    1_000
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}
