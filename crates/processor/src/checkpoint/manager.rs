//! Checkpoint manager
//!
//! The supervisor captures a [`CheckpointSnapshot`] between batches (a copy
//! of `Arc` references, see [`WindowStore::snapshot`](crate::window::WindowStore::snapshot))
//! and hands it to [`CheckpointManager::write`] on a spawned task, so
//! serialization and I/O never hold up ingestion.

use super::{Checkpoint, CheckpointStore};
use crate::error::CheckpointResult;
use crate::metrics::StreamMetrics;
use crate::window::StoreSnapshot;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use stream_analytics_types::{CheckpointRef, StreamId};
use tracing::{debug, info, warn};

/// Point-in-time view of a job's state, cheap to capture
#[derive(Debug, Clone, Default)]
pub struct CheckpointSnapshot {
    pub store: StoreSnapshot,
    pub watermark: i64,
    pub max_event_time: i64,
    pub last_offset: Option<u64>,
}

/// Checkpoint statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub checkpoints_created: u64,
    pub checkpoint_failures: u64,
    pub restores: u64,
    pub restore_failures: u64,
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    pub last_checkpoint_duration_ms: u64,
    pub last_checkpoint_bytes: u64,
    pub total_bytes_checkpointed: u64,
}

/// Writes and restores checkpoints for one stream
pub struct CheckpointManager {
    stream_id: StreamId,
    store: Arc<dyn CheckpointStore>,
    sequence: AtomicU64,
    stats: RwLock<CheckpointStats>,
    metrics: StreamMetrics,
}

impl CheckpointManager {
    pub fn new(stream_id: StreamId, store: Arc<dyn CheckpointStore>, metrics: StreamMetrics) -> Self {
        Self {
            stream_id,
            store,
            sequence: AtomicU64::new(1),
            stats: RwLock::new(CheckpointStats::default()),
            metrics,
        }
    }

    pub fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Serialize and persist a snapshot; failures are counted and returned
    pub async fn write(&self, snapshot: CheckpointSnapshot) -> CheckpointResult<CheckpointRef> {
        let start = Instant::now();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);

        match self.try_write(sequence, snapshot).await {
            Ok((reference, bytes)) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                {
                    let mut stats = self.stats.write();
                    stats.checkpoints_created += 1;
                    stats.last_checkpoint_time = Some(reference.created_at);
                    stats.last_checkpoint_duration_ms = duration_ms;
                    stats.last_checkpoint_bytes = bytes;
                    stats.total_bytes_checkpointed += bytes;
                }
                self.metrics.checkpoints_written.inc();
                debug!(
                    stream_id = %self.stream_id,
                    checkpoint_id = %reference.checkpoint_id,
                    windows = reference.window_count,
                    watermark = reference.watermark,
                    duration_ms,
                    "Checkpoint created"
                );
                Ok(reference)
            }
            Err(e) => {
                self.stats.write().checkpoint_failures += 1;
                self.metrics.checkpoint_failures.inc();
                warn!(
                    stream_id = %self.stream_id,
                    error = %e,
                    "Checkpoint failed, retrying at the next interval"
                );
                Err(e)
            }
        }
    }

    async fn try_write(
        &self,
        sequence: u64,
        snapshot: CheckpointSnapshot,
    ) -> CheckpointResult<(CheckpointRef, u64)> {
        let checkpoint = Checkpoint::new(
            self.stream_id.clone(),
            sequence,
            snapshot.watermark,
            snapshot.max_event_time,
            snapshot.last_offset,
            snapshot.store.states(),
            snapshot.store.tombstones.into_iter().collect(),
        )?;
        let bytes = bincode::serialized_size(&checkpoint)?;
        self.store.put(&self.stream_id, &checkpoint).await?;
        Ok((checkpoint.to_ref(), bytes))
    }

    /// Latest usable checkpoint, if any
    pub async fn restore_latest(&self) -> CheckpointResult<Option<Checkpoint>> {
        match self.store.get_latest(&self.stream_id).await {
            Ok(Some(checkpoint)) => {
                // Keep new checkpoints ordered after the restored one
                self.sequence
                    .fetch_max(checkpoint.sequence + 1, Ordering::SeqCst);
                self.stats.write().restores += 1;
                info!(
                    stream_id = %self.stream_id,
                    checkpoint_id = %checkpoint.checkpoint_id,
                    watermark = checkpoint.watermark,
                    last_offset = ?checkpoint.last_offset,
                    windows = checkpoint.windows.len(),
                    "Restoring from checkpoint"
                );
                Ok(Some(checkpoint))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.stats.write().restore_failures += 1;
                warn!(stream_id = %self.stream_id, error = %e, "Checkpoint restore failed");
                Err(e)
            }
        }
    }

    pub async fn list(&self) -> CheckpointResult<Vec<CheckpointRef>> {
        self.store.list(&self.stream_id).await
    }

    pub fn stats(&self) -> CheckpointStats {
        self.stats.read().clone()
    }
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("stream_id", &self.stream_id)
            .field("stats", &*self.stats.read())
            .finish_non_exhaustive()
    }
}
