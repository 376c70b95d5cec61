//! Engine metric families

use super::labels::{DeliveryLabels, DeliveryOutcome, PolicyLabels, StreamLabels};
use super::registry::MetricsRegistry;
use crate::config::BackpressureKind;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use std::sync::{Arc, OnceLock};
use stream_analytics_types::StreamId;

static ENGINE_METRICS: OnceLock<Arc<EngineMetrics>> = OnceLock::new();

/// Metric families shared by all streams of a registry
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    events_ingested: Family<StreamLabels, Counter>,
    events_processed: Family<StreamLabels, Counter>,
    events_filtered: Family<StreamLabels, Counter>,
    stage_errors: Family<StreamLabels, Counter>,
    events_dropped_late: Family<StreamLabels, Counter>,
    backpressure_affected: Family<PolicyLabels, Counter>,
    windows_emitted: Family<StreamLabels, Counter>,
    checkpoints_written: Family<StreamLabels, Counter>,
    checkpoint_failures: Family<StreamLabels, Counter>,
    sink_deliveries: Family<DeliveryLabels, Counter>,
    alerts_fired: Family<StreamLabels, Counter>,
    alert_failures: Family<StreamLabels, Counter>,
    watermark_stalls: Family<StreamLabels, Counter>,
    watermark_ms: Family<StreamLabels, Gauge>,
    open_windows: Family<StreamLabels, Gauge>,
}

impl EngineMetrics {
    /// Create the families and register them with `registry`
    pub fn new(registry: &MetricsRegistry) -> Self {
        let metrics = Self::default();
        let registry = registry.registry();
        let mut registry = registry.write();

        registry.register(
            "events_ingested",
            "Events handed to the processing loop",
            metrics.events_ingested.clone(),
        );
        registry.register(
            "events_processed",
            "Events that passed every stage",
            metrics.events_processed.clone(),
        );
        registry.register(
            "events_filtered",
            "Events rejected by the filter chain",
            metrics.events_filtered.clone(),
        );
        registry.register(
            "stage_errors",
            "Events dropped by a filter, transform or enrichment failure",
            metrics.stage_errors.clone(),
        );
        registry.register(
            "events_dropped_late",
            "Window assignments rejected because the window had completed",
            metrics.events_dropped_late.clone(),
        );
        registry.register(
            "backpressure_affected",
            "Events affected by the backpressure policy",
            metrics.backpressure_affected.clone(),
        );
        registry.register(
            "windows_emitted",
            "Completed windows handed to the output dispatcher",
            metrics.windows_emitted.clone(),
        );
        registry.register(
            "checkpoints_written",
            "Checkpoints written successfully",
            metrics.checkpoints_written.clone(),
        );
        registry.register(
            "checkpoint_failures",
            "Checkpoint writes that failed",
            metrics.checkpoint_failures.clone(),
        );
        registry.register(
            "sink_deliveries",
            "Sink delivery attempts by outcome",
            metrics.sink_deliveries.clone(),
        );
        registry.register(
            "alerts_fired",
            "Alert rule firings",
            metrics.alerts_fired.clone(),
        );
        registry.register(
            "alert_failures",
            "Alert notifications that failed or were dropped on a full channel queue",
            metrics.alert_failures.clone(),
        );
        registry.register(
            "watermark_stalls",
            "Idle periods in which the watermark stopped advancing",
            metrics.watermark_stalls.clone(),
        );
        registry.register(
            "watermark_ms",
            "Current stream watermark in epoch milliseconds",
            metrics.watermark_ms.clone(),
        );
        registry.register(
            "open_windows",
            "Windows currently held in the window store",
            metrics.open_windows.clone(),
        );

        metrics
    }

    /// Families registered with the global registry
    pub fn global() -> Arc<EngineMetrics> {
        ENGINE_METRICS
            .get_or_init(|| Arc::new(EngineMetrics::new(&MetricsRegistry::global())))
            .clone()
    }

    /// Handles bound to one stream's labels
    pub fn for_stream(&self, stream_id: &StreamId) -> StreamMetrics {
        let labels = StreamLabels {
            stream_id: stream_id.to_string(),
        };
        let delivery = |outcome: DeliveryOutcome| {
            self.sink_deliveries
                .get_or_create(&DeliveryLabels {
                    stream_id: stream_id.to_string(),
                    outcome: outcome.to_string(),
                })
                .clone()
        };

        StreamMetrics {
            stream_id: stream_id.to_string(),
            events_ingested: self.events_ingested.get_or_create(&labels).clone(),
            events_processed: self.events_processed.get_or_create(&labels).clone(),
            events_filtered: self.events_filtered.get_or_create(&labels).clone(),
            stage_errors: self.stage_errors.get_or_create(&labels).clone(),
            events_dropped_late: self.events_dropped_late.get_or_create(&labels).clone(),
            windows_emitted: self.windows_emitted.get_or_create(&labels).clone(),
            checkpoints_written: self.checkpoints_written.get_or_create(&labels).clone(),
            checkpoint_failures: self.checkpoint_failures.get_or_create(&labels).clone(),
            deliveries_ok: delivery(DeliveryOutcome::Delivered),
            deliveries_retried: delivery(DeliveryOutcome::Retried),
            deliveries_failed: delivery(DeliveryOutcome::Failed),
            alerts_fired: self.alerts_fired.get_or_create(&labels).clone(),
            alert_failures: self.alert_failures.get_or_create(&labels).clone(),
            watermark_stalls: self.watermark_stalls.get_or_create(&labels).clone(),
            watermark_ms: self.watermark_ms.get_or_create(&labels).clone(),
            open_windows: self.open_windows.get_or_create(&labels).clone(),
            backpressure: self.backpressure_affected.clone(),
        }
    }
}

/// Metric handles for one stream
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    stream_id: String,
    pub events_ingested: Counter,
    pub events_processed: Counter,
    pub events_filtered: Counter,
    pub stage_errors: Counter,
    pub events_dropped_late: Counter,
    pub windows_emitted: Counter,
    pub checkpoints_written: Counter,
    pub checkpoint_failures: Counter,
    pub deliveries_ok: Counter,
    pub deliveries_retried: Counter,
    pub deliveries_failed: Counter,
    pub alerts_fired: Counter,
    pub alert_failures: Counter,
    pub watermark_stalls: Counter,
    pub watermark_ms: Gauge,
    pub open_windows: Gauge,
    backpressure: Family<PolicyLabels, Counter>,
}

impl StreamMetrics {
    /// Handles on a private registry, for components used standalone
    pub fn detached(stream_id: &StreamId) -> Self {
        EngineMetrics::default().for_stream(stream_id)
    }

    pub fn backpressure_affected(&self, policy: BackpressureKind, count: u64) {
        if count == 0 {
            return;
        }
        self.backpressure
            .get_or_create(&PolicyLabels {
                stream_id: self.stream_id.clone(),
                policy: policy.name().to_string(),
            })
            .inc_by(count);
    }

    pub fn delivery(&self, outcome: DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => self.deliveries_ok.inc(),
            DeliveryOutcome::Retried => self.deliveries_retried.inc(),
            DeliveryOutcome::Failed => self.deliveries_failed.inc(),
        };
    }

    pub fn set_watermark(&self, watermark_ms: i64) {
        if watermark_ms != i64::MIN {
            self.watermark_ms.set(watermark_ms);
        }
    }

    pub fn set_open_windows(&self, open: usize) {
        self.open_windows.set(i64::try_from(open).unwrap_or(i64::MAX));
    }
}
