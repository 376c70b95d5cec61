//! Processing loop of one job
//!
//! The loop runs batch by batch: no two batches of a stream are in flight at
//! once. Checkpoints capture a copy-on-write snapshot between batches and
//! are written on spawned tasks; completed windows leave through the output
//! dispatcher.

use super::poller::PollerHandle;
use super::{JobCommand, SharedRun};
use crate::backpressure::BackpressureController;
use crate::checkpoint::{Checkpoint, CheckpointManager, CheckpointSnapshot};
use crate::config::StreamSpec;
use crate::error::{FatalJobError, StageError};
use crate::metrics::StreamMetrics;
use crate::sink::{DispatcherHandle, SinkRecord};
use crate::source::SourceError;
use crate::stages::{AlertDispatcher, AlertEvaluator, EnrichmentStage, FilterChain, TransformPipeline};
use crate::watermark::{Watermark, WatermarkTracker};
use crate::window::{FiredWindow, WindowOperator};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_analytics_types::{ErrorStage, Event, JobError, JobId, JobStatus, StreamId};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Compiled per-event stages
pub(crate) struct Stages {
    pub filters: FilterChain,
    pub transforms: TransformPipeline,
    pub enrichment: EnrichmentStage,
    pub alerts: AlertEvaluator,
}

pub(crate) struct Job {
    pub job_id: JobId,
    pub stream_id: StreamId,
    pub spec: StreamSpec,
    pub stages: Stages,
    pub operator: WindowOperator,
    pub watermark: WatermarkTracker,
    pub backpressure: Arc<BackpressureController>,
    pub checkpoints: Option<Arc<CheckpointManager>>,
    pub checkpoint_in_flight: Arc<AtomicBool>,
    pub dispatcher: Option<DispatcherHandle>,
    pub alert_dispatcher: Option<AlertDispatcher>,
    pub poller: Option<PollerHandle>,
    pub source_failures: mpsc::Receiver<SourceError>,
    pub commands: mpsc::Receiver<JobCommand>,
    pub run: SharedRun,
    pub status: Arc<watch::Sender<JobStatus>>,
    pub metrics: StreamMetrics,
    pub stop_when_exhausted: bool,
    pub last_offset: Option<u64>,
    pub consecutive_errors: u64,
    pub recovery_attempts: u32,
    pub paused: bool,
}

impl Job {
    pub(crate) async fn run(mut self) {
        if let Err(fatal) = self.restore_on_start().await {
            self.fail(fatal).await;
            return;
        }
        self.transition(JobStatus::Running);

        let mut tick = tokio::time::interval(Duration::from_millis(self.spec.source.poll_interval_ms));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let checkpointing = self.checkpoints.is_some();
        let mut checkpoint_tick = tokio::time::interval(self.spec.checkpoint.interval());
        checkpoint_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        checkpoint_tick.tick().await;

        let mut backlog = false;
        loop {
            let result = tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(JobCommand::Pause) => {
                        self.pause().await;
                        Ok(())
                    }
                    Some(JobCommand::Resume) => {
                        self.resume().await;
                        Ok(())
                    }
                    Some(JobCommand::Stop) | None => {
                        self.stop().await;
                        return;
                    }
                },

                Some(e) = self.source_failures.recv() => {
                    Err(FatalJobError::Source { reason: e.to_string() })
                }

                _ = checkpoint_tick.tick(), if checkpointing && !self.paused => {
                    self.spawn_checkpoint();
                    Ok(())
                }

                _ = tick.tick(), if !self.paused => self.process_tick().await.map(|full| backlog = full),

                _ = std::future::ready(()), if backlog && !self.paused => {
                    self.process_tick().await.map(|full| backlog = full)
                }
            };

            if let Err(fatal) = result {
                backlog = false;
                if !self.recover_or_fail(fatal).await {
                    return;
                }
                continue;
            }

            if self.stop_when_exhausted && self.input_finished() {
                info!(stream_id = %self.stream_id, "Source exhausted, stopping job");
                self.stop().await;
                return;
            }
        }
    }

    fn input_finished(&self) -> bool {
        self.poller.as_ref().is_some_and(PollerHandle::is_exhausted)
            && self.backpressure.depth() == 0
            && self.backpressure.spilled_pending() == 0
    }

    /// Process one batch; `Ok(true)` when the batch was full
    async fn process_tick(&mut self) -> Result<bool, FatalJobError> {
        let now = now_ms();

        if let Err(e) = self.backpressure.replay_spilled().await {
            warn!(stream_id = %self.stream_id, error = %e, "Failed to replay spilled events");
        }
        let batch_size = self.spec.source.batch_size;
        let batch = self.backpressure.drain(batch_size);
        let full = batch.len() == batch_size;

        // Late checks for the whole batch use the watermark it started with
        let watermark_before = self.watermark.current();
        let mut max_event_time: Option<i64> = None;

        if !batch.is_empty() {
            trace!(stream_id = %self.stream_id, events = batch.len(), "Processing batch");
        }
        for event in batch {
            let offset = event.offset;
            self.metrics.events_ingested.inc();
            if let Some(t) = self.process_event(event, watermark_before, now).await? {
                max_event_time = Some(max_event_time.map_or(t, |m| m.max(t)));
            }
            if offset.is_some() {
                self.last_offset = self.last_offset.max(offset);
            }
        }

        if let Some(max) = max_event_time {
            self.watermark.observe_batch(max, now);
        }
        match self.watermark.check_idle(now) {
            Ok(_) => {}
            Err(stall) => {
                self.metrics.watermark_stalls.inc();
                warn!(stream_id = %self.stream_id, error = %stall, "Watermark stalled");
            }
        }

        let watermark = self.watermark.current();
        let mut fired = self.operator.on_watermark(watermark);
        fired.extend(self.operator.on_processing_time(now));
        self.emit_windows(fired).await;

        self.metrics.set_watermark(watermark.timestamp);
        self.metrics.set_open_windows(self.operator.open_windows());
        Ok(full)
    }

    /// Run one event through the pipeline; returns its event time when it survived the stages
    async fn process_event(
        &mut self,
        event: Event,
        watermark: Watermark,
        now: i64,
    ) -> Result<Option<i64>, FatalJobError> {
        let event = match self.apply_stages(event).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                self.consecutive_errors = 0;
                self.metrics.events_filtered.inc();
                return Ok(None);
            }
            Err((event_id, e)) => {
                self.metrics.stage_errors.inc();
                self.record_error(e.stage(), Some(event_id), e.to_string());
                self.consecutive_errors += 1;
                debug!(stream_id = %self.stream_id, event_id = %event_id, error = %e, "Event dropped by stage error");
                let threshold = self.spec.limits.max_consecutive_stage_errors;
                if self.consecutive_errors >= threshold {
                    return Err(FatalJobError::StageErrorThreshold {
                        consecutive: self.consecutive_errors,
                        threshold,
                    });
                }
                return Ok(None);
            }
        };
        self.consecutive_errors = 0;
        let t = event.event_time_ms();

        if self.spec.emit_raw_events {
            self.send(SinkRecord::Event(event.clone())).await;
        }

        for firing in self.stages.alerts.evaluate(&event) {
            self.metrics.alerts_fired.inc();
            if let Some(alerts) = self.alert_dispatcher.as_ref() {
                alerts.notify(firing);
            }
        }

        match self.operator.process(&event, watermark, now) {
            Ok(outcome) => {
                for _ in 0..outcome.dropped_late {
                    self.watermark.record_dropped_late(t);
                }
                for _ in 0..outcome.accepted_late {
                    self.watermark.record_accepted_late(t);
                }
                self.metrics.events_dropped_late.inc_by(outcome.dropped_late);
                self.emit_windows(outcome.fired).await;
            }
            Err(e) => {
                self.record_error(ErrorStage::Aggregation, Some(event.id), e.to_string());
                warn!(stream_id = %self.stream_id, event_id = %event.id, error = %e, "Aggregation update failed");
                return Ok(Some(t));
            }
        }

        self.metrics.events_processed.inc();
        self.run.write().events_processed += 1;
        Ok(Some(t))
    }

    /// Filter, transform and enrich; `Ok(None)` when a filter rejected the event
    async fn apply_stages(&mut self, event: Event) -> Result<Option<Event>, (Uuid, StageError)> {
        let id = event.id;
        if !self.stages.filters.apply(&event).map_err(|e| (id, e))? {
            return Ok(None);
        }
        let mut event = self.stages.transforms.apply(&event).map_err(|e| (id, e))?;
        self.stages
            .enrichment
            .apply(&mut event)
            .await
            .map_err(|e| (id, e))?;
        Ok(Some(event))
    }

    async fn emit_windows(&mut self, fired: Vec<FiredWindow>) {
        for window in fired {
            let result = window.state.to_result(&self.stream_id, window.reason);
            debug!(
                stream_id = %self.stream_id,
                window = %window.state.key,
                reason = window.reason.name(),
                members = result.member_count,
                "Window completed"
            );
            self.metrics.windows_emitted.inc();
            self.send(SinkRecord::Window(result)).await;
        }
    }

    async fn send(&mut self, record: SinkRecord) {
        let Some(dispatcher) = self.dispatcher.as_ref() else {
            return;
        };
        if let Err(e) = dispatcher.send(record).await {
            self.record_error(ErrorStage::Sink, None, e.to_string());
            warn!(stream_id = %self.stream_id, error = %e, "Output record not dispatched");
        }
    }

    fn record_error(&self, stage: ErrorStage, event_id: Option<Uuid>, message: String) {
        let mut run = self.run.write();
        if matches!(
            stage,
            ErrorStage::Filter | ErrorStage::Transform | ErrorStage::Enrichment | ErrorStage::Aggregation
        ) {
            run.events_failed += 1;
        }
        run.record_error(
            JobError {
                at: Utc::now(),
                stage,
                event_id,
                message,
            },
            self.spec.limits.max_recorded_errors,
        );
    }

    fn snapshot(&self) -> CheckpointSnapshot {
        CheckpointSnapshot {
            store: self.operator.snapshot(),
            watermark: self.watermark.current().timestamp,
            max_event_time: self.watermark.max_event_time(),
            last_offset: self.committed_offset(),
        }
    }

    /// Highest offset at or below which every polled event has been applied
    ///
    /// Spilled events are processed after events polled later, so the
    /// highest processed offset is only safe once nothing is pending.
    fn committed_offset(&self) -> Option<u64> {
        match self.backpressure.lowest_pending_offset() {
            Some(pending) => pending.checked_sub(1).min(self.last_offset),
            None => self.last_offset,
        }
    }

    /// Write a checkpoint in the background; skipped while the previous one is in flight
    fn spawn_checkpoint(&self) {
        let Some(manager) = self.checkpoints.as_ref() else {
            return;
        };
        if self.checkpoint_in_flight.swap(true, Ordering::AcqRel) {
            debug!(stream_id = %self.stream_id, "Previous checkpoint still in flight, skipping");
            return;
        }

        let snapshot = self.snapshot();
        let manager = Arc::clone(manager);
        let run = Arc::clone(&self.run);
        let in_flight = Arc::clone(&self.checkpoint_in_flight);
        let max_errors = self.spec.limits.max_recorded_errors;
        tokio::spawn(async move {
            match manager.write(snapshot).await {
                Ok(reference) => run.write().checkpoints.push(reference),
                Err(e) => run.write().record_error(
                    JobError {
                        at: Utc::now(),
                        stage: ErrorStage::Checkpoint,
                        event_id: None,
                        message: e.to_string(),
                    },
                    max_errors,
                ),
            }
            in_flight.store(false, Ordering::Release);
        });
    }

    /// Checkpoint written synchronously while stopping
    async fn final_checkpoint(&self) {
        let Some(manager) = self.checkpoints.as_ref() else {
            return;
        };
        // Let a background write finish so the final one is the newest
        while self.checkpoint_in_flight.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        match manager.write(self.snapshot()).await {
            Ok(reference) => self.run.write().checkpoints.push(reference),
            Err(e) => self.record_error(ErrorStage::Checkpoint, None, e.to_string()),
        }
    }

    async fn restore_on_start(&mut self) -> Result<(), FatalJobError> {
        if !self.spec.checkpoint.restore_on_start {
            return Ok(());
        }
        let Some(manager) = self.checkpoints.clone() else {
            return Ok(());
        };
        match manager.restore_latest().await {
            Ok(Some(checkpoint)) => {
                self.transition(JobStatus::Recovering);
                self.rehydrate(checkpoint).await
            }
            Ok(None) => Ok(()),
            Err(e) => Err(FatalJobError::RecoveryFailed {
                attempts: 0,
                reason: e.to_string(),
            }),
        }
    }

    /// Restore from the latest checkpoint; `false` when the job failed instead
    async fn recover_or_fail(&mut self, fatal: FatalJobError) -> bool {
        error!(stream_id = %self.stream_id, error = %fatal, "Fatal job error");
        self.record_error(ErrorStage::Job, None, fatal.to_string());

        let max_attempts = self.spec.limits.max_recovery_attempts;
        let Some(manager) = self.checkpoints.clone() else {
            self.fail(fatal).await;
            return false;
        };
        if self.recovery_attempts >= max_attempts {
            self.fail(FatalJobError::RecoveryFailed {
                attempts: self.recovery_attempts,
                reason: fatal.to_string(),
            })
            .await;
            return false;
        }

        let checkpoint = match manager.restore_latest().await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => {
                self.fail(fatal).await;
                return false;
            }
            Err(e) => {
                self.fail(FatalJobError::RecoveryFailed {
                    attempts: self.recovery_attempts,
                    reason: e.to_string(),
                })
                .await;
                return false;
            }
        };

        self.recovery_attempts += 1;
        self.run.write().recoveries += 1;
        self.transition(JobStatus::Recovering);

        match self.rehydrate(checkpoint).await {
            Ok(()) => {
                // The poller resumes after a seek
                self.paused = false;
                self.transition(JobStatus::Running);
                true
            }
            Err(e) => {
                self.fail(e).await;
                false
            }
        }
    }

    /// Replace window state and watermark with the checkpoint and reposition the source
    async fn rehydrate(&mut self, checkpoint: Checkpoint) -> Result<(), FatalJobError> {
        let attempts = self.recovery_attempts;
        let failed = |reason: String| FatalJobError::RecoveryFailed { attempts, reason };

        // Releases a poller blocked on the queue before the seek
        if let Err(e) = self.backpressure.clear().await {
            warn!(stream_id = %self.stream_id, error = %e, "Failed to clear ingestion queue");
        }
        if let Some(poller) = self.poller.as_ref() {
            poller
                .seek(checkpoint.resume_offset())
                .await
                .map_err(|e| failed(e.to_string()))?;
        }

        let mut operator =
            WindowOperator::new(&self.spec.aggregations).map_err(|e| failed(e.to_string()))?;
        let tombstones = checkpoint.tombstones.into_iter().collect();
        let windows = checkpoint.windows.len();
        operator.restore(checkpoint.windows, tombstones);
        self.operator = operator;

        let now = now_ms();
        let mut watermark = WatermarkTracker::new(self.spec.watermark.clone(), now);
        watermark.restore(Watermark::new(checkpoint.watermark), checkpoint.max_event_time, now);
        self.watermark = watermark;

        self.last_offset = checkpoint.last_offset;
        self.consecutive_errors = 0;
        self.metrics.set_open_windows(windows);
        self.metrics.set_watermark(checkpoint.watermark);

        info!(
            stream_id = %self.stream_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            windows,
            resume_offset = checkpoint.last_offset.map_or(0, |o| o + 1),
            "Recovered from checkpoint"
        );
        Ok(())
    }

    async fn pause(&mut self) {
        if self.paused {
            return;
        }
        if self.transition(JobStatus::Paused) {
            self.paused = true;
            if let Some(poller) = self.poller.as_ref() {
                poller.pause().await;
            }
        }
    }

    async fn resume(&mut self) {
        if !self.paused {
            return;
        }
        if self.transition(JobStatus::Running) {
            self.paused = false;
            if let Some(poller) = self.poller.as_ref() {
                poller.resume().await;
            }
        }
    }

    /// Cooperative stop between batches
    async fn stop(&mut self) {
        self.transition(JobStatus::Stopping);
        if let Some(poller) = self.poller.take() {
            poller.stop(&self.backpressure).await;
        }

        self.final_checkpoint().await;

        if self.spec.limits.flush_on_stop {
            let remaining = self.operator.flush();
            if !remaining.is_empty() {
                debug!(stream_id = %self.stream_id, windows = remaining.len(), "Flushing open windows");
            }
            self.emit_windows(remaining).await;
        }

        self.shutdown_outputs().await;
        self.transition(JobStatus::Stopped);
    }

    async fn fail(&mut self, fatal: FatalJobError) {
        error!(stream_id = %self.stream_id, job_id = %self.job_id, error = %fatal, "Job failed");
        self.run.write().failure = Some(fatal.to_string());
        if let Some(poller) = self.poller.take() {
            poller.stop(&self.backpressure).await;
        }
        self.shutdown_outputs().await;
        self.transition(JobStatus::Failed);
    }

    async fn shutdown_outputs(&mut self) {
        if let Some(dispatcher) = self.dispatcher.take() {
            let stats = dispatcher.shutdown().await;
            debug!(
                stream_id = %self.stream_id,
                delivered = stats.delivered,
                failed = stats.failed,
                "Output dispatcher stopped"
            );
        }
        if let Some(alerts) = self.alert_dispatcher.take() {
            alerts.shutdown().await;
        }
        self.stages.enrichment.log_cache_stats();
        let late = self.watermark.late_stats();
        let bp = self.backpressure.stats();
        info!(
            stream_id = %self.stream_id,
            dropped_late = late.dropped_late,
            accepted_late = late.accepted_late,
            backpressure_affected = bp.affected(self.backpressure.policy().kind),
            alerts_fired = self.stages.alerts.fired(),
            "Job outputs closed"
        );
    }

    /// Apply a status change if the state machine allows it
    fn transition(&self, next: JobStatus) -> bool {
        let mut run = self.run.write();
        let current = run.status;
        if current == next {
            return true;
        }
        if !current.can_transition_to(next) {
            warn!(
                stream_id = %self.stream_id,
                from = current.name(),
                to = next.name(),
                "Ignoring invalid job transition"
            );
            return false;
        }
        run.status = next;
        if next.is_terminal() {
            run.finished_at = Some(Utc::now());
        }
        drop(run);

        info!(
            stream_id = %self.stream_id,
            job_id = %self.job_id,
            from = current.name(),
            to = next.name(),
            "Job status changed"
        );
        self.status.send_replace(next);
        true
    }
}
