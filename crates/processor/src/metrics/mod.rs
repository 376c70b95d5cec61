//! Prometheus metrics for the stream engine
//!
//! [`EngineMetrics`] holds one family per engine counter, labelled by
//! `stream_id`. A running job binds its labels once through
//! [`EngineMetrics::for_stream`] and updates the returned [`StreamMetrics`]
//! handles without further lookups.

mod engine;
mod labels;
mod registry;

pub use engine::{EngineMetrics, StreamMetrics};
pub use labels::{DeliveryLabels, DeliveryOutcome, PolicyLabels, StreamLabels};
pub use registry::{MetricsRegistry, METRICS_REGISTRY};

use thiserror::Error;

/// Errors that can occur in the metrics subsystem
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("metric encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, MetricsError>;
