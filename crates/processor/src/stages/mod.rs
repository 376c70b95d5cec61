//! Per-event pipeline stages
//!
//! Events flow through the [`FilterChain`], the [`TransformPipeline`] and
//! the [`EnrichmentStage`] in that order. A failure in any of them is a
//! [`StageError`](crate::error::StageError) for that one event: the event
//! is dropped, the error is recorded against the job run, and processing
//! continues. Surviving events are checked by the [`AlertEvaluator`].

pub mod alert;
pub mod enrich;
pub mod filter;
pub mod transform;

pub use alert::{
    render_message, AlertChannel, AlertDispatcher, AlertError, AlertEvaluator, LogAlertChannel,
    MemoryAlertChannel,
};
pub use enrich::{
    EnrichmentCache, EnrichmentError, EnrichmentProvider, EnrichmentStage, ProviderRegistry,
    StaticLookupProvider,
};
pub use filter::FilterChain;
pub use transform::{insert_path, remove_path, TransformPipeline};
