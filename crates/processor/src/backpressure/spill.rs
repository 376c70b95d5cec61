//! Overflow stores for the `spill` policy

use super::BackpressureError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use stream_analytics_types::Event;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Events per on-disk segment before the writer rotates
const SEGMENT_EVENTS: usize = 1_000;

/// Holds events above the backpressure threshold until they are replayed
#[async_trait]
pub trait SpillStore: Send + Sync {
    async fn append(&mut self, event: &Event) -> Result<(), BackpressureError>;

    /// Remove and return up to `max` events, oldest segment first
    async fn take(&mut self, max: usize) -> Result<Vec<Event>, BackpressureError>;

    /// Discard everything
    async fn clear(&mut self) -> Result<(), BackpressureError>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Source offsets of events found when the store was opened
    fn take_recovered_offsets(&mut self) -> Vec<u64> {
        Vec::new()
    }
}

#[derive(Debug, Default)]
pub struct MemorySpillStore {
    events: VecDeque<Event>,
}

impl MemorySpillStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SpillStore for MemorySpillStore {
    async fn append(&mut self, event: &Event) -> Result<(), BackpressureError> {
        self.events.push_back(event.clone());
        Ok(())
    }

    async fn take(&mut self, max: usize) -> Result<Vec<Event>, BackpressureError> {
        let n = max.min(self.events.len());
        Ok(self.events.drain(..n).collect())
    }

    async fn clear(&mut self) -> Result<(), BackpressureError> {
        self.events.clear();
        Ok(())
    }

    fn len(&self) -> usize {
        self.events.len()
    }
}

/// JSON-lines segments under a directory
///
/// The writer appends to the newest segment and rotates every
/// [`SEGMENT_EVENTS`] events. Reads load the oldest segment into memory
/// and delete its file. Segments left over from an earlier run are picked
/// up by [`FileSpillStore::open`].
#[derive(Debug)]
pub struct FileSpillStore {
    dir: PathBuf,
    /// Closed segments, oldest first, with their event counts
    segments: VecDeque<(PathBuf, usize)>,
    writer: Option<(tokio::fs::File, PathBuf, usize)>,
    next_segment: u64,
    buffer: VecDeque<Event>,
    pending: usize,
    recovered_offsets: Vec<u64>,
}

impl FileSpillStore {
    /// Open a spill directory, recovering segments from a previous run
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, BackpressureError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| BackpressureError::spill(&dir, e))?;

        let mut paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| BackpressureError::spill(&dir, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BackpressureError::spill(&dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("jsonl") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut segments = VecDeque::new();
        let mut pending = 0;
        let mut next_segment = 0;
        let mut recovered_offsets = Vec::new();
        for path in paths {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| BackpressureError::spill(&path, e))?;
            let mut count = 0;
            for line in content.lines().filter(|l| !l.trim().is_empty()) {
                count += 1;
                if let Ok(Event { offset: Some(offset), .. }) = serde_json::from_str::<Event>(line) {
                    recovered_offsets.push(offset);
                }
            }
            pending += count;
            if let Some(seq) = segment_sequence(&path) {
                next_segment = next_segment.max(seq + 1);
            }
            segments.push_back((path, count));
        }

        if pending > 0 {
            info!(dir = %dir.display(), events = pending, "Recovered spilled events");
        }

        Ok(Self {
            dir,
            segments,
            writer: None,
            next_segment,
            buffer: VecDeque::new(),
            pending,
            recovered_offsets,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn rotate(&mut self) -> Result<(), BackpressureError> {
        if let Some((mut file, path, count)) = self.writer.take() {
            file.flush()
                .await
                .map_err(|e| BackpressureError::spill(&path, e))?;
            self.segments.push_back((path, count));
        }
        Ok(())
    }

    async fn load_oldest(&mut self) -> Result<(), BackpressureError> {
        if self.segments.is_empty() {
            self.rotate().await?;
        }
        let Some((path, _)) = self.segments.pop_front() else {
            return Ok(());
        };

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BackpressureError::spill(&path, e))?;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<Event>(line) {
                Ok(event) => self.buffer.push_back(event),
                Err(e) => {
                    self.pending = self.pending.saturating_sub(1);
                    warn!(path = %path.display(), error = %e, "Skipping unreadable spilled event");
                }
            }
        }
        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove spill segment");
        }
        debug!(path = %path.display(), events = self.buffer.len(), "Loaded spill segment");
        Ok(())
    }
}

fn segment_sequence(path: &Path) -> Option<u64> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("segment-")?
        .parse()
        .ok()
}

#[async_trait]
impl SpillStore for FileSpillStore {
    async fn append(&mut self, event: &Event) -> Result<(), BackpressureError> {
        if self.writer.is_none() {
            let path = self
                .dir
                .join(format!("segment-{:010}.jsonl", self.next_segment));
            self.next_segment += 1;
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| BackpressureError::spill(&path, e))?;
            self.writer = Some((file, path, 0));
        }

        let mut line = serde_json::to_string(event).map_err(|e| BackpressureError::Spill {
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut rotate = false;
        if let Some((file, path, count)) = self.writer.as_mut() {
            file.write_all(line.as_bytes())
                .await
                .map_err(|e| BackpressureError::spill(path, e))?;
            *count += 1;
            rotate = *count >= SEGMENT_EVENTS;
        }
        self.pending += 1;
        if rotate {
            self.rotate().await?;
        }
        Ok(())
    }

    async fn take(&mut self, max: usize) -> Result<Vec<Event>, BackpressureError> {
        let mut out = Vec::with_capacity(max.min(self.pending));
        while out.len() < max {
            if self.buffer.is_empty() {
                if self.segments.is_empty() && self.writer.is_none() {
                    break;
                }
                self.load_oldest().await?;
                continue;
            }
            if let Some(event) = self.buffer.pop_front() {
                out.push(event);
                self.pending = self.pending.saturating_sub(1);
            }
        }
        Ok(out)
    }

    async fn clear(&mut self) -> Result<(), BackpressureError> {
        self.rotate().await?;
        while let Some((path, _)) = self.segments.pop_front() {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove spill segment");
            }
        }
        self.buffer.clear();
        self.pending = 0;
        Ok(())
    }

    fn len(&self) -> usize {
        self.pending
    }

    fn take_recovered_offsets(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.recovered_offsets)
    }
}
