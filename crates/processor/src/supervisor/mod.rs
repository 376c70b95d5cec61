//! Job supervisor
//!
//! A job is one execution of a [`StreamSpec`]. Starting a job validates the
//! spec, compiles its stages and spawns three tasks:
//!
//! - the source poller, feeding the backpressure controller
//! - the processing loop, which owns all window and watermark state
//! - the output dispatcher
//!
//! The returned [`JobHandle`] observes status and statistics and sends
//! control commands. Status changes follow the state machine of
//! [`JobStatus::can_transition_to`].

mod job;
mod poller;

use crate::backpressure::{BackpressureController, FileSpillStore, MemorySpillStore, SpillStore};
use crate::checkpoint::{CheckpointManager, CheckpointStore, MemoryCheckpointStore};
use crate::config::{BackpressureKind, StreamSpec};
use crate::error::Result;
use crate::metrics::EngineMetrics;
use crate::sink::{OutputDispatcher, OutputSink};
use crate::source::Source;
use crate::stages::{
    AlertChannel, AlertDispatcher, AlertEvaluator, EnrichmentProvider, EnrichmentStage, FilterChain,
    LogAlertChannel, ProviderRegistry, TransformPipeline,
};
use crate::watermark::WatermarkTracker;
use crate::window::WindowOperator;
use job::{now_ms, Job, Stages};
use parking_lot::RwLock;
use poller::PollerHandle;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use stream_analytics_types::{JobId, JobRun, JobStatus, StreamId};
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{info, warn};

pub(crate) type SharedRun = Arc<RwLock<JobRun>>;

/// Control commands accepted by a running job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobCommand {
    Pause,
    Resume,
    Stop,
}

/// Runtime collaborators of a job
#[derive(Clone)]
pub struct JobContext {
    pub providers: ProviderRegistry,
    pub sinks: Vec<Arc<dyn OutputSink>>,
    pub alert_channels: Vec<Arc<dyn AlertChannel>>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub metrics: Arc<EngineMetrics>,
    /// Base directory for `spill` backpressure; in memory when unset
    pub spill_dir: Option<PathBuf>,
    /// Capacity of the output dispatcher channel and of each alert channel queue
    pub dispatch_capacity: usize,
    /// Stop the job once a finite source is drained
    pub stop_when_exhausted: bool,
}

impl Default for JobContext {
    fn default() -> Self {
        Self {
            providers: ProviderRegistry::new(),
            sinks: Vec::new(),
            alert_channels: vec![Arc::new(LogAlertChannel)],
            checkpoint_store: Arc::new(MemoryCheckpointStore::new()),
            metrics: EngineMetrics::global(),
            spill_dir: None,
            dispatch_capacity: 1024,
            stop_when_exhausted: true,
        }
    }
}

impl JobContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Add an alert channel; the first call replaces the default log channel
    pub fn with_alert_channel(mut self, channel: Arc<dyn AlertChannel>) -> Self {
        if self.alert_channels.len() == 1 && self.alert_channels[0].name() == "log" {
            self.alert_channels.clear();
        }
        self.alert_channels.push(channel);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn EnrichmentProvider>) -> Self {
        self.providers.register(provider);
        self
    }

    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = store;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.spill_dir = Some(dir.into());
        self
    }

    pub fn stop_when_exhausted(mut self, stop: bool) -> Self {
        self.stop_when_exhausted = stop;
        self
    }
}

/// Starts jobs
pub struct JobSupervisor;

impl JobSupervisor {
    /// Validate `spec`, compile its stages and start processing `source`
    pub async fn start(spec: StreamSpec, source: Box<dyn Source>, ctx: JobContext) -> Result<JobHandle> {
        spec.validate()?;
        let stream_id = spec.stream_id()?;
        let job_id = JobId::new();

        let stages = Stages {
            filters: FilterChain::new(&spec.filters)?,
            transforms: TransformPipeline::new(&spec.transforms)?,
            enrichment: EnrichmentStage::new(&spec.enrichments, &ctx.providers)?,
            alerts: AlertEvaluator::new(stream_id.clone(), &spec.alerts)?,
        };
        let operator = WindowOperator::new(&spec.aggregations)?;
        let metrics = ctx.metrics.for_stream(&stream_id);

        // A directory on the policy wins over the engine-wide one
        let spill_dir = spec
            .backpressure
            .spill_dir
            .clone()
            .or_else(|| ctx.spill_dir.as_ref().map(|dir| dir.join(stream_id.as_str())));
        let spill: Box<dyn SpillStore> = match (spill_dir, spec.backpressure.kind) {
            (Some(dir), BackpressureKind::Spill) => Box::new(FileSpillStore::open(dir).await?),
            _ => Box::new(MemorySpillStore::new()),
        };
        let backpressure = Arc::new(BackpressureController::with_spill_store(
            spec.backpressure.clone(),
            spill,
            metrics.clone(),
        ));

        let checkpoints = spec.checkpoint.enabled.then(|| {
            Arc::new(CheckpointManager::new(
                stream_id.clone(),
                Arc::clone(&ctx.checkpoint_store),
                metrics.clone(),
            ))
        });

        let dispatcher = if ctx.sinks.is_empty() {
            warn!(stream_id = %stream_id, "No output sinks configured, results are discarded");
            None
        } else {
            Some(
                OutputDispatcher::new(ctx.sinks.clone(), spec.delivery.clone(), metrics.clone())
                    .spawn(ctx.dispatch_capacity),
            )
        };

        let (failures_tx, source_failures) = mpsc::channel(4);
        let poller = PollerHandle::spawn(
            stream_id.clone(),
            source,
            Arc::clone(&backpressure),
            spec.source.batch_size,
            Duration::from_millis(spec.source.poll_interval_ms),
            failures_tx,
        );
        let poller_abort = poller.abort_handle();

        let run: SharedRun = Arc::new(RwLock::new(JobRun::new(job_id, stream_id.clone())));
        let (status_tx, status) = watch::channel(JobStatus::Starting);
        let status_tx = Arc::new(status_tx);
        let (commands, command_rx) = mpsc::channel(16);

        info!(
            stream_id = %stream_id,
            job_id = %job_id,
            aggregations = spec.aggregations.len(),
            backpressure = spec.backpressure.kind.name(),
            checkpointing = spec.checkpoint.enabled,
            "Starting job"
        );

        let job = Job {
            job_id,
            stream_id: stream_id.clone(),
            watermark: WatermarkTracker::new(spec.watermark.clone(), now_ms()),
            stop_when_exhausted: ctx.stop_when_exhausted,
            spec,
            stages,
            operator,
            backpressure,
            checkpoints,
            checkpoint_in_flight: Arc::new(AtomicBool::new(false)),
            dispatcher,
            alert_dispatcher: Some(AlertDispatcher::spawn(
                &ctx.alert_channels,
                ctx.dispatch_capacity,
                metrics.clone(),
            )),
            poller: Some(poller),
            source_failures,
            commands: command_rx,
            run: Arc::clone(&run),
            status: Arc::clone(&status_tx),
            metrics,
            last_offset: None,
            consecutive_errors: 0,
            recovery_attempts: 0,
            paused: false,
        };
        let task = tokio::spawn(job.run());

        Ok(JobHandle {
            job_id,
            stream_id,
            run,
            status,
            status_tx,
            commands,
            task: Some(task),
            poller_abort,
        })
    }
}

/// Handle to a started job
pub struct JobHandle {
    job_id: JobId,
    stream_id: StreamId,
    run: SharedRun,
    status: watch::Receiver<JobStatus>,
    status_tx: Arc<watch::Sender<JobStatus>>,
    commands: mpsc::Sender<JobCommand>,
    task: Option<JoinHandle<()>>,
    poller_abort: AbortHandle,
}

impl JobHandle {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Current statistics of the run
    pub fn run(&self) -> JobRun {
        self.run.read().clone()
    }

    pub(crate) fn shared_run(&self) -> SharedRun {
        Arc::clone(&self.run)
    }

    /// Status updates, for callers that want to observe transitions
    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }

    pub async fn pause(&self) {
        let _ = self.commands.send(JobCommand::Pause).await;
    }

    pub async fn resume(&self) {
        let _ = self.commands.send(JobCommand::Resume).await;
    }

    /// Request a cooperative stop and wait for the job to finish
    pub async fn stop(&mut self) -> JobRun {
        let _ = self.commands.send(JobCommand::Stop).await;
        self.wait().await
    }

    /// Wait until the job reaches a terminal status
    pub async fn wait(&mut self) -> JobRun {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(stream_id = %self.stream_id, error = %e, "Job task failed");
                    self.mark_failed(format!("job task panicked: {}", e));
                }
            }
        }
        self.run()
    }

    /// Wait until the job reports `target` or a terminal status
    pub async fn wait_for_status(&mut self, target: JobStatus) -> JobStatus {
        let mut rx = self.status.clone();
        loop {
            let current = *rx.borrow_and_update();
            if current == target || current.is_terminal() {
                return current;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Kill the job without stopping cooperatively; no final checkpoint is written
    pub fn abort(&mut self) {
        self.poller_abort.abort();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.mark_failed("aborted".to_string());
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    fn mark_failed(&self, reason: String) {
        let mut run = self.run.write();
        if run.status.is_terminal() {
            return;
        }
        run.status = JobStatus::Failed;
        run.failure = Some(reason);
        run.finished_at = Some(chrono::Utc::now());
        drop(run);
        self.status_tx.send_replace(JobStatus::Failed);
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                self.poller_abort.abort();
                task.abort();
            }
        }
    }
}
