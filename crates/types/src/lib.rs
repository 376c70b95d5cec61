//! Core types and data models for the stream analytics engine
//!
//! This crate provides the data structures shared by the processor, the
//! configuration loader and the CLI.

pub mod errors;
pub mod events;
pub mod ids;
pub mod jobs;
pub mod results;

pub use errors::{AnalyticsError, Result};
pub use events::Event;
pub use ids::{JobId, StreamId};
pub use jobs::{CheckpointRef, ErrorStage, JobError, JobRun, JobStatus};
pub use results::{AlertFiring, AlertSeverity, CompletionReason, WindowResult};
