//! Job lifecycle records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{JobId, StreamId};

/// Lifecycle status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
    Recovering,
}

impl JobStatus {
    /// Whether the job has reached a final state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether a transition from `self` to `next` is allowed
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Recovering)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Running, Paused)
                | (Running, Stopping)
                | (Running, Recovering)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Paused, Failed)
                | (Recovering, Running)
                | (Recovering, Failed)
                | (Recovering, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Recovering => "recovering",
        }
    }
}

/// Pipeline stage an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    Filter,
    Transform,
    Enrichment,
    Aggregation,
    Checkpoint,
    Sink,
    Source,
    Job,
}

/// One error recorded against a job run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub at: DateTime<Utc>,
    pub stage: ErrorStage,
    pub event_id: Option<Uuid>,
    pub message: String,
}

/// Reference to a written checkpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRef {
    pub checkpoint_id: String,
    pub created_at: DateTime<Utc>,
    pub watermark: i64,
    pub last_offset: Option<u64>,
    pub window_count: usize,
}

/// Lifecycle record of one job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    pub job_id: JobId,
    pub stream_id: StreamId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub events_processed: u64,
    pub events_failed: u64,
    /// Errors beyond the recording cap are counted but not stored
    pub errors_dropped: u64,
    pub errors: Vec<JobError>,
    pub checkpoints: Vec<CheckpointRef>,
    pub recoveries: u32,
    pub failure: Option<String>,
}

impl JobRun {
    pub fn new(job_id: JobId, stream_id: StreamId) -> Self {
        Self {
            job_id,
            stream_id,
            status: JobStatus::Starting,
            started_at: Utc::now(),
            finished_at: None,
            events_processed: 0,
            events_failed: 0,
            errors_dropped: 0,
            errors: Vec::new(),
            checkpoints: Vec::new(),
            recoveries: 0,
            failure: None,
        }
    }

    /// Record an error, keeping at most `cap` entries
    pub fn record_error(&mut self, error: JobError, cap: usize) {
        if self.errors.len() < cap {
            self.errors.push(error);
        } else {
            self.errors_dropped += 1;
        }
    }

    /// Latest checkpoint reference, if any
    pub fn latest_checkpoint(&self) -> Option<&CheckpointRef> {
        self.checkpoints.last()
    }
}
