//! Error types for the stream processor
//!
//! The taxonomy follows how failures surface at runtime: validation errors
//! reject a stream before it starts, stage errors drop one event, watermark
//! stalls and checkpoint failures are warnings, sink errors are retried or
//! counted, and only fatal job errors stop a job.

use thiserror::Error;

use crate::backpressure::BackpressureError;
use crate::engine::EngineError;
use crate::expr::ExprError;
use crate::source::SourceError;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Stream definition rejected before the job started
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Per-event pipeline stage failure
    #[error("stage error: {0}")]
    Stage(#[from] StageError),

    /// Watermark progress problems
    #[error("watermark error: {0}")]
    Watermark(#[from] WatermarkError),

    /// Checkpoint read/write failures
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Output sink failures
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Unrecoverable job failure
    #[error("fatal job error: {0}")]
    Fatal(#[from] FatalJobError),

    /// Aggregation-related errors
    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Expression parse/evaluation errors
    #[error("expression error: {0}")]
    Expression(#[from] ExprError),

    /// Backpressure controller errors
    #[error("backpressure error: {0}")]
    Backpressure(#[from] BackpressureError),

    /// Source adapter errors
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Stream/job registry errors
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Execution errors
    #[error("execution error: {source}")]
    Execution {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization/deserialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

/// Stream definition validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    /// A field has an invalid value
    #[error("invalid value at '{path}': {reason}")]
    Invalid { path: String, reason: String },

    /// A combination of settings is not supported
    #[error("unsupported combination at '{path}': {reason}")]
    Unsupported { path: String, reason: String },

    /// An expression failed to parse
    #[error("invalid expression at '{path}': {source}")]
    Expression {
        path: String,
        #[source]
        source: ExprError,
    },

    /// Two definitions share an identifier
    #[error("duplicate {kind} '{id}'")]
    Duplicate { kind: String, id: String },

    /// A definition refers to something that does not exist
    #[error("unknown {kind} '{name}' at '{path}'")]
    Unknown {
        kind: String,
        name: String,
        path: String,
    },
}

impl ValidationError {
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn unsupported(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unsupported {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Per-event stage errors; the event is dropped and processing continues
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("filter '{name}' failed: {reason}")]
    Filter { name: String, reason: String },

    #[error("transform '{name}' failed: {reason}")]
    Transform { name: String, reason: String },

    #[error("enrichment '{name}' failed: {reason}")]
    Enrichment { name: String, reason: String },
}

impl StageError {
    pub fn stage(&self) -> stream_analytics_types::ErrorStage {
        use stream_analytics_types::ErrorStage;
        match self {
            Self::Filter { .. } => ErrorStage::Filter,
            Self::Transform { .. } => ErrorStage::Transform,
            Self::Enrichment { .. } => ErrorStage::Enrichment,
        }
    }
}

/// Aggregation computation errors
#[derive(Error, Debug)]
pub enum AggregationError {
    /// Invalid metric value (NaN, Inf, etc.)
    #[error("invalid metric value: {value}, reason: {reason}")]
    InvalidValue { value: f64, reason: String },

    /// Percentile outside (0, 100]
    #[error("invalid percentile {percentile}: must be in (0, 100]")]
    InvalidPercentile { percentile: f64 },

    /// Accumulators of different kinds cannot be merged
    #[error("cannot merge {left} accumulator with {right}")]
    IncompatibleMerge { left: String, right: String },

    /// Aggregation state is corrupted
    #[error("corrupted aggregation state for {aggregation_type}: {details}")]
    CorruptedState {
        aggregation_type: String,
        details: String,
    },
}

/// Watermark progress errors
#[derive(Error, Debug, Clone)]
pub enum WatermarkError {
    /// No events arrived within the idleness timeout and the watermark is not advancing
    #[error("watermark stalled at {watermark}: no events for {idle_ms}ms (timeout {timeout_ms}ms)")]
    Stall {
        watermark: i64,
        idle_ms: u64,
        timeout_ms: u64,
    },

    /// Watermark went backwards
    #[error("watermark regression: new watermark {new_watermark} is before current {current_watermark}")]
    Regression {
        current_watermark: i64,
        new_watermark: i64,
    },
}

/// Checkpoint read/write errors; non-fatal while the job runs
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint write failed for {checkpoint_id}: {reason}")]
    Write { checkpoint_id: String, reason: String },

    #[error("checkpoint read failed: {reason}")]
    Read { reason: String },

    #[error("checkpoint {checkpoint_id} is corrupt: {reason}")]
    Corrupt { checkpoint_id: String, reason: String },

    #[error("checkpoint serialization failed: {0}")]
    Serialization(String),
}

/// Output sink delivery errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// Transient failure; the dispatcher retries with backoff
    #[error("retryable delivery failure on sink '{sink}': {reason}")]
    Retryable { sink: String, reason: String },

    /// Permanent failure; the record is marked failed-delivery
    #[error("fatal delivery failure on sink '{sink}': {reason}")]
    Fatal { sink: String, reason: String },
}

impl SinkError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

/// Unrecoverable errors that move a job to `failed` (or `recovering`)
#[derive(Error, Debug, Clone)]
pub enum FatalJobError {
    #[error("{consecutive} consecutive stage errors reached the threshold of {threshold}")]
    StageErrorThreshold { consecutive: u64, threshold: u64 },

    #[error("source failed: {reason}")]
    Source { reason: String },

    #[error("internal invariant violated: {reason}")]
    Invariant { reason: String },

    #[error("recovery failed after {attempts} attempts: {reason}")]
    RecoveryFailed { attempts: u32, reason: String },
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for validation
pub type ValidationResult<T> = std::result::Result<T, ValidationError>;

/// Result type alias for stage operations
pub type StageResult<T> = std::result::Result<T, StageError>;

/// Result type alias for aggregation operations
pub type AggregationResult<T> = std::result::Result<T, AggregationError>;

/// Result type alias for checkpoint operations
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

impl From<bincode::Error> for ProcessorError {
    fn from(err: bincode::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ProcessorError {
    fn from(err: serde_json::Error) -> Self {
        ProcessorError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Unexpected(err.to_string())
    }
}

impl From<bincode::Error> for CheckpointError {
    fn from(err: bincode::Error) -> Self {
        CheckpointError::Serialization(err.to_string())
    }
}
