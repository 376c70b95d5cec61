//! Checkpoint storage backends

use super::Checkpoint;
use crate::error::{CheckpointError, CheckpointResult};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use stream_analytics_types::{CheckpointRef, StreamId};
use tracing::{debug, warn};

const CHECKPOINT_EXTENSION: &str = "ckpt";

/// Durable home for checkpoints
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persist a checkpoint; it supersedes earlier ones for the stream
    async fn put(&self, stream_id: &StreamId, checkpoint: &Checkpoint) -> CheckpointResult<()>;

    /// Newest readable checkpoint for the stream
    async fn get_latest(&self, stream_id: &StreamId) -> CheckpointResult<Option<Checkpoint>>;

    /// References to stored checkpoints, oldest first
    async fn list(&self, stream_id: &StreamId) -> CheckpointResult<Vec<CheckpointRef>>;
}

/// In-memory store keeping the newest `max_checkpoints` per stream
#[derive(Debug)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<StreamId, Vec<Checkpoint>>,
    max_checkpoints: usize,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::with_retention(10)
    }

    pub fn with_retention(max_checkpoints: usize) -> Self {
        Self {
            checkpoints: DashMap::new(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    pub fn len(&self, stream_id: &StreamId) -> usize {
        self.checkpoints.get(stream_id).map_or(0, |c| c.len())
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, stream_id: &StreamId, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let mut entry = self.checkpoints.entry(stream_id.clone()).or_default();
        entry.push(checkpoint.clone());
        entry.sort_by_key(|c| c.sequence);
        let excess = entry.len().saturating_sub(self.max_checkpoints);
        entry.drain(..excess);
        Ok(())
    }

    async fn get_latest(&self, stream_id: &StreamId) -> CheckpointResult<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .get(stream_id)
            .and_then(|c| c.last().cloned()))
    }

    async fn list(&self, stream_id: &StreamId) -> CheckpointResult<Vec<CheckpointRef>> {
        Ok(self
            .checkpoints
            .get(stream_id)
            .map(|c| c.iter().map(Checkpoint::to_ref).collect())
            .unwrap_or_default())
    }
}

/// Filesystem store: `<dir>/<stream_id>/<created_ms>-<checkpoint_id>.ckpt`
#[derive(Debug, Clone)]
pub struct FsCheckpointStore {
    dir: PathBuf,
    max_checkpoints: usize,
}

impl FsCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, max_checkpoints: usize) -> Self {
        Self {
            dir: dir.into(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn stream_dir(&self, stream_id: &StreamId) -> PathBuf {
        self.dir.join(stream_id.as_str())
    }

    fn file_name(checkpoint: &Checkpoint) -> String {
        format!(
            "{:013}-{}.{}",
            checkpoint.created_at.timestamp_millis().max(0),
            checkpoint.checkpoint_id,
            CHECKPOINT_EXTENSION
        )
    }

    /// Checkpoint files for a stream, oldest first
    async fn files(&self, stream_id: &StreamId) -> CheckpointResult<Vec<PathBuf>> {
        let dir = self.stream_dir(stream_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(CheckpointError::Read {
                    reason: format!("failed to read {}: {}", dir.display(), e),
                })
            }
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| CheckpointError::Read {
            reason: e.to_string(),
        })? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(CHECKPOINT_EXTENSION) {
                files.push(path);
            }
        }
        // Zero-padded names sort by creation time, then by sequence
        files.sort();
        Ok(files)
    }

    async fn read(path: &Path) -> CheckpointResult<Checkpoint> {
        let bytes = tokio::fs::read(path).await.map_err(|e| CheckpointError::Read {
            reason: format!("failed to read {}: {}", path.display(), e),
        })?;
        Checkpoint::decode(&bytes)
    }

    async fn prune(&self, stream_id: &StreamId) -> CheckpointResult<()> {
        let files = self.files(stream_id).await?;
        let excess = files.len().saturating_sub(self.max_checkpoints);
        for path in files.into_iter().take(excess) {
            debug!(path = %path.display(), "Removing old checkpoint");
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove old checkpoint");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FsCheckpointStore {
    async fn put(&self, stream_id: &StreamId, checkpoint: &Checkpoint) -> CheckpointResult<()> {
        let write_error = |reason: String| CheckpointError::Write {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            reason,
        };

        let dir = self.stream_dir(stream_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| write_error(format!("failed to create {}: {}", dir.display(), e)))?;

        let bytes = checkpoint.encode()?;
        let path = dir.join(Self::file_name(checkpoint));
        let tmp = path.with_extension("tmp");

        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| write_error(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| write_error(format!("failed to rename {}: {}", tmp.display(), e)))?;

        debug!(
            stream_id = %stream_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            bytes = bytes.len(),
            "Checkpoint written"
        );

        self.prune(stream_id).await
    }

    async fn get_latest(&self, stream_id: &StreamId) -> CheckpointResult<Option<Checkpoint>> {
        for path in self.files(stream_id).await?.iter().rev() {
            match Self::read(path).await {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "Skipping unreadable checkpoint"
                ),
            }
        }
        Ok(None)
    }

    async fn list(&self, stream_id: &StreamId) -> CheckpointResult<Vec<CheckpointRef>> {
        let mut refs = Vec::new();
        for path in self.files(stream_id).await? {
            match Self::read(&path).await {
                Ok(checkpoint) => refs.push(checkpoint.to_ref()),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint"),
            }
        }
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stream() -> StreamId {
        StreamId::new("orders").unwrap()
    }

    fn checkpoint(sequence: u64, last_offset: u64) -> Checkpoint {
        Checkpoint::new(stream(), sequence, 1_000, 2_000, Some(last_offset), vec![], vec![]).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_latest_and_retention() {
        let store = MemoryCheckpointStore::with_retention(2);
        assert!(store.get_latest(&stream()).await.unwrap().is_none());

        for seq in 1..=3 {
            store.put(&stream(), &checkpoint(seq, seq * 10)).await.unwrap();
        }
        let latest = store.get_latest(&stream()).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 3);
        assert_eq!(store.len(&stream()), 2);
        assert_eq!(store.list(&stream()).await.unwrap()[0].last_offset, Some(20));
    }

    #[tokio::test]
    async fn test_fs_store_round_trip_and_prune() {
        let dir = TempDir::new().unwrap();
        let store = FsCheckpointStore::new(dir.path(), 2);

        for seq in 1..=3 {
            store.put(&stream(), &checkpoint(seq, seq)).await.unwrap();
        }

        let refs = store.list(&stream()).await.unwrap();
        assert_eq!(refs.len(), 2);
        let latest = store.get_latest(&stream()).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 3);
        assert_eq!(latest.last_offset, Some(3));
    }

    #[tokio::test]
    async fn test_fs_store_skips_corrupt_latest() {
        let dir = TempDir::new().unwrap();
        let store = FsCheckpointStore::new(dir.path(), 10);
        store.put(&stream(), &checkpoint(1, 5)).await.unwrap();

        let garbage = dir
            .path()
            .join("orders")
            .join(format!("9999999999999-garbage.{}", CHECKPOINT_EXTENSION));
        tokio::fs::write(&garbage, b"garbage").await.unwrap();

        let latest = store.get_latest(&stream()).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 1);
    }

    #[tokio::test]
    async fn test_fs_store_missing_stream_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FsCheckpointStore::new(dir.path(), 3);
        assert!(store.get_latest(&stream()).await.unwrap().is_none());
        assert!(store.list(&stream()).await.unwrap().is_empty());
    }
}
