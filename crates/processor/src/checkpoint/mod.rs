//! Checkpointing and recovery
//!
//! A [`Checkpoint`] is an immutable, point-in-time copy of one stream's open
//! windows, tombstones, watermark and last processed source offset. It is
//! written by the [`CheckpointManager`] into a [`CheckpointStore`] and read
//! back on recovery, after which the source is replayed from
//! `last_offset + 1` (at-least-once).

mod manager;
mod store;

pub use manager::{CheckpointManager, CheckpointSnapshot, CheckpointStats};
pub use store::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore};

use crate::error::{CheckpointError, CheckpointResult};
use crate::window::{WindowKey, WindowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stream_analytics_types::{CheckpointRef, StreamId};
use uuid::Uuid;

/// Current checkpoint format version
pub const CHECKPOINT_VERSION: u32 = 1;

/// Serialized snapshot of one stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub stream_id: StreamId,
    pub checkpoint_id: String,
    /// Monotonic per-manager sequence number
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub watermark: i64,
    pub max_event_time: i64,
    /// Offset of the last event applied before the snapshot
    pub last_offset: Option<u64>,
    pub windows: Vec<WindowState>,
    pub tombstones: Vec<(WindowKey, i64)>,
    pub checksum: String,
    pub version: u32,
}

impl Checkpoint {
    pub fn new(
        stream_id: StreamId,
        sequence: u64,
        watermark: i64,
        max_event_time: i64,
        last_offset: Option<u64>,
        windows: Vec<WindowState>,
        tombstones: Vec<(WindowKey, i64)>,
    ) -> CheckpointResult<Self> {
        let uuid = Uuid::new_v4().simple().to_string();
        let mut checkpoint = Self {
            stream_id,
            checkpoint_id: format!("{:010}-{}", sequence, &uuid[..8]),
            sequence,
            created_at: Utc::now(),
            watermark,
            max_event_time,
            last_offset,
            windows,
            tombstones,
            checksum: String::new(),
            version: CHECKPOINT_VERSION,
        };
        checkpoint.checksum = checkpoint.calculate_checksum()?;
        Ok(checkpoint)
    }

    /// Hash over the serialized payload (everything except the checksum)
    fn calculate_checksum(&self) -> CheckpointResult<String> {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let payload = bincode::serialize(&(
            &self.stream_id,
            &self.checkpoint_id,
            self.sequence,
            self.watermark,
            self.max_event_time,
            self.last_offset,
            &self.windows,
            &self.tombstones,
            self.version,
        ))?;

        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        Ok(format!("{:x}", hasher.finish()))
    }

    /// Check the stored checksum and format version
    pub fn verify(&self) -> CheckpointResult<()> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::Corrupt {
                checkpoint_id: self.checkpoint_id.clone(),
                reason: format!(
                    "unsupported version {} (expected {})",
                    self.version, CHECKPOINT_VERSION
                ),
            });
        }
        let calculated = self.calculate_checksum()?;
        if calculated != self.checksum {
            return Err(CheckpointError::Corrupt {
                checkpoint_id: self.checkpoint_id.clone(),
                reason: format!(
                    "checksum mismatch: expected {}, got {}",
                    self.checksum, calculated
                ),
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> CheckpointResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize and verify
    pub fn decode(bytes: &[u8]) -> CheckpointResult<Self> {
        let checkpoint: Self = bincode::deserialize(bytes).map_err(|e| CheckpointError::Corrupt {
            checkpoint_id: "<unknown>".to_string(),
            reason: e.to_string(),
        })?;
        checkpoint.verify()?;
        Ok(checkpoint)
    }

    pub fn to_ref(&self) -> CheckpointRef {
        CheckpointRef {
            checkpoint_id: self.checkpoint_id.clone(),
            created_at: self.created_at,
            watermark: self.watermark,
            last_offset: self.last_offset,
            window_count: self.windows.len(),
        }
    }

    /// Offset the source should resume from
    pub fn resume_offset(&self) -> u64 {
        self.last_offset.map_or(0, |offset| offset + 1)
    }
}
