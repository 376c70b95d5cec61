//! Stream engine
//!
//! Owns every registered [`StreamSpec`] and every job started from one.
//! Streams are keyed by [`StreamId`], jobs by [`JobId`]; at most one job per
//! stream is active (not stopped or failed) at a time.

use crate::config::StreamSpec;
use crate::error::Result;
use crate::source::Source;
use crate::supervisor::{JobContext, JobHandle, JobSupervisor};
use dashmap::DashMap;
use std::sync::Arc;
use parking_lot::RwLock;
use stream_analytics_types::{JobId, JobRun, JobStatus, StreamId};
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::info;

/// Stream and job registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown stream '{0}'")]
    UnknownStream(StreamId),

    #[error("stream '{0}' is already registered")]
    DuplicateStream(StreamId),

    #[error("stream '{stream_id}' already has active job {job_id}")]
    JobActive { stream_id: StreamId, job_id: JobId },

    #[error("unknown job {0}")]
    UnknownJob(JobId),
}

struct JobEntry {
    stream_id: StreamId,
    handle: Mutex<JobHandle>,
    status: watch::Receiver<JobStatus>,
    run: Arc<RwLock<JobRun>>,
}

impl JobEntry {
    fn status(&self) -> JobStatus {
        *self.status.borrow()
    }
}

/// Registry of streams and their jobs
#[derive(Default)]
pub struct StreamEngine {
    streams: DashMap<StreamId, Arc<StreamSpec>>,
    jobs: DashMap<JobId, Arc<JobEntry>>,
    /// Latest job started per stream
    latest: DashMap<StreamId, JobId>,
}

impl StreamEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a stream definition
    pub fn register_stream(&self, spec: StreamSpec) -> Result<StreamId> {
        spec.validate()?;
        let stream_id = spec.stream_id()?;
        match self.streams.entry(stream_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(EngineError::DuplicateStream(stream_id).into())
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(spec));
                info!(stream_id = %stream_id, "Stream registered");
                Ok(stream_id)
            }
        }
    }

    /// Remove a stream; fails while one of its jobs is active
    pub fn remove_stream(&self, stream_id: &StreamId) -> Result<StreamSpec> {
        if let Some(job_id) = self.active_job(stream_id) {
            return Err(EngineError::JobActive {
                stream_id: stream_id.clone(),
                job_id,
            }
            .into());
        }
        let (_, spec) = self
            .streams
            .remove(stream_id)
            .ok_or_else(|| EngineError::UnknownStream(stream_id.clone()))?;
        self.latest.remove(stream_id);
        self.jobs.retain(|_, entry| &entry.stream_id != stream_id);
        info!(stream_id = %stream_id, "Stream removed");
        Ok(Arc::try_unwrap(spec).unwrap_or_else(|shared| (*shared).clone()))
    }

    pub fn stream(&self, stream_id: &StreamId) -> Option<Arc<StreamSpec>> {
        self.streams.get(stream_id).map(|spec| Arc::clone(spec.value()))
    }

    /// Registered stream ids, sorted
    pub fn streams(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// All jobs with their stream and current status
    pub fn jobs(&self) -> Vec<(JobId, StreamId, JobStatus)> {
        let mut jobs: Vec<_> = self
            .jobs
            .iter()
            .map(|e| (*e.key(), e.stream_id.clone(), e.status()))
            .collect();
        jobs.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        jobs
    }

    /// The stream's job that has not reached a terminal status, if any
    pub fn active_job(&self, stream_id: &StreamId) -> Option<JobId> {
        let job_id = *self.latest.get(stream_id)?;
        let entry = self.jobs.get(&job_id)?;
        (!entry.status().is_terminal()).then_some(job_id)
    }

    /// Start a job for a registered stream
    pub async fn start_job(
        &self,
        stream_id: &StreamId,
        source: Box<dyn Source>,
        ctx: JobContext,
    ) -> Result<JobId> {
        let spec = self
            .stream(stream_id)
            .ok_or_else(|| EngineError::UnknownStream(stream_id.clone()))?;
        if let Some(job_id) = self.active_job(stream_id) {
            return Err(EngineError::JobActive {
                stream_id: stream_id.clone(),
                job_id,
            }
            .into());
        }

        let handle = JobSupervisor::start((*spec).clone(), source, ctx).await?;
        let job_id = handle.job_id();
        let entry = JobEntry {
            stream_id: stream_id.clone(),
            status: handle.subscribe(),
            run: handle.shared_run(),
            handle: Mutex::new(handle),
        };
        self.jobs.insert(job_id, Arc::new(entry));
        self.latest.insert(stream_id.clone(), job_id);
        Ok(job_id)
    }

    fn entry(&self, job_id: JobId) -> Result<Arc<JobEntry>> {
        self.jobs
            .get(&job_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::UnknownJob(job_id).into())
    }

    /// Stop a job cooperatively and return its final run
    pub async fn stop_job(&self, job_id: JobId) -> Result<JobRun> {
        let entry = self.entry(job_id)?;
        let mut handle = entry.handle.lock().await;
        Ok(handle.stop().await)
    }

    pub async fn pause_job(&self, job_id: JobId) -> Result<()> {
        let entry = self.entry(job_id)?;
        entry.handle.lock().await.pause().await;
        Ok(())
    }

    pub async fn resume_job(&self, job_id: JobId) -> Result<()> {
        let entry = self.entry(job_id)?;
        entry.handle.lock().await.resume().await;
        Ok(())
    }

    /// Wait for a job to finish on its own
    pub async fn wait_job(&self, job_id: JobId) -> Result<JobRun> {
        let entry = self.entry(job_id)?;
        let mut handle = entry.handle.lock().await;
        Ok(handle.wait().await)
    }

    pub fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        Ok(self.entry(job_id)?.status())
    }

    /// Snapshot of a job's statistics
    pub fn job_run(&self, job_id: JobId) -> Result<JobRun> {
        Ok(self.entry(job_id)?.run.read().clone())
    }

    /// Stop every active job
    pub async fn shutdown(&self) -> Vec<JobRun> {
        let active: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|e| !e.status().is_terminal())
            .map(|e| *e.key())
            .collect();
        let mut runs = Vec::with_capacity(active.len());
        for job_id in active {
            if let Ok(run) = self.stop_job(job_id).await {
                runs.push(run);
            }
        }
        runs
    }
}
