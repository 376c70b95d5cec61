//! Windowed stream aggregation engine
//!
//! Events flow from a [`Source`] through the backpressure controller into a
//! job's processing loop: filters, transforms and enrichments first, then
//! alert rules, window assignment and incremental aggregation. Completed
//! windows are emitted when the watermark passes their end (or an early
//! trigger fires) and delivered to [`OutputSink`]s with retry. Window state
//! is checkpointed periodically so a failed job resumes from the last
//! checkpoint with at-least-once delivery.
//!
//! [`StreamEngine`] owns registered [`StreamSpec`]s and their jobs; a single
//! job can also be started directly with [`JobSupervisor::start`].

pub mod aggregation;
pub mod backpressure;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod expr;
pub mod metrics;
pub mod sink;
pub mod source;
pub mod stages;
pub mod supervisor;
pub mod watermark;
pub mod window;

pub use backpressure::{Admission, BackpressureController, BackpressureStats};

pub use checkpoint::{
    Checkpoint, CheckpointManager, CheckpointStore, FsCheckpointStore, MemoryCheckpointStore,
};

pub use config::{
    AggregateDef, AggregateFunction, AggregationSpec, AlertRule, BackpressureKind,
    BackpressurePolicy, CheckpointPolicy, JobLimits, RetryConfig, StreamSpec, TriggerDef,
    WatermarkPolicy, WindowKind, WindowSpec,
};

pub use engine::{EngineError, StreamEngine};

pub use error::{
    CheckpointError, FatalJobError, ProcessorError, Result as ProcessorResult, SinkError,
    StageError, ValidationError, WatermarkError,
};

pub use expr::{CompiledExpr, ExprError};

pub use metrics::{EngineMetrics, MetricsRegistry, StreamMetrics};

pub use sink::{FileSink, MemorySink, OutputDispatcher, OutputSink, SinkRecord, StdoutSink};

pub use source::{JsonLinesSource, MemorySource, MemorySourceWriter, Source, SourceError};

pub use stages::{
    AlertChannel, EnrichmentProvider, LogAlertChannel, MemoryAlertChannel, ProviderRegistry,
    StaticLookupProvider,
};

pub use supervisor::{JobContext, JobHandle, JobSupervisor};

pub use watermark::{Watermark, WatermarkTracker};

pub use window::{WindowBounds, WindowKey, WindowOperator, WindowState};
