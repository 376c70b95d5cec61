//! Source adapters
//!
//! A [`Source`] hands out ordered batches of events, each stamped with its
//! offset. The supervisor's poller task owns the source; after recovery it
//! seeks to the offset following the restored checkpoint, so events between
//! that checkpoint and the failure are delivered again (at-least-once).

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use stream_analytics_types::Event;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, warn};

/// Source adapter errors; a failing source is fatal for its job
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("source I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot seek source '{source_name}' to offset {offset}: {reason}")]
    Seek {
        source_name: String,
        offset: u64,
        reason: String,
    },
}

impl SourceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
pub trait Source: Send {
    /// Next batch of at most `max` events, in offset order; may be empty
    async fn poll(&mut self, max: usize) -> Result<Vec<Event>, SourceError>;

    /// Continue from `next_offset`
    async fn seek(&mut self, next_offset: u64) -> Result<(), SourceError>;

    fn name(&self) -> &str;

    /// No more events will ever arrive
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Writer half of an open [`MemorySource`]
#[derive(Debug, Clone)]
pub struct MemorySourceWriter {
    events: Arc<Mutex<Vec<Event>>>,
    closed: Arc<AtomicBool>,
}

impl MemorySourceWriter {
    pub fn push(&self, event: Event) {
        self.events.lock().push(event);
    }

    pub fn extend(&self, events: impl IntoIterator<Item = Event>) {
        self.events.lock().extend(events);
    }

    /// Mark the source finished once everything pushed has been read
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// In-memory source; the offset of an event is its index
#[derive(Debug)]
pub struct MemorySource {
    events: Arc<Mutex<Vec<Event>>>,
    closed: Arc<AtomicBool>,
    position: usize,
}

impl MemorySource {
    /// A finite source over `events`
    pub fn new(events: Vec<Event>) -> Self {
        Self {
            events: Arc::new(Mutex::new(events)),
            closed: Arc::new(AtomicBool::new(true)),
            position: 0,
        }
    }

    /// An open source fed through the returned writer
    pub fn open() -> (Self, MemorySourceWriter) {
        let source = Self {
            events: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(AtomicBool::new(false)),
            position: 0,
        };
        let writer = MemorySourceWriter {
            events: Arc::clone(&source.events),
            closed: Arc::clone(&source.closed),
        };
        (source, writer)
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn poll(&mut self, max: usize) -> Result<Vec<Event>, SourceError> {
        let events = self.events.lock();
        let end = events.len().min(self.position.saturating_add(max));
        let batch: Vec<Event> = events[self.position.min(end)..end]
            .iter()
            .enumerate()
            .map(|(i, event)| event.clone().with_offset((self.position + i) as u64))
            .collect();
        drop(events);
        self.position = end.max(self.position);
        Ok(batch)
    }

    async fn seek(&mut self, next_offset: u64) -> Result<(), SourceError> {
        self.position = usize::try_from(next_offset).map_err(|e| SourceError::Seek {
            source_name: self.name().to_string(),
            offset: next_offset,
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }

    fn is_exhausted(&self) -> bool {
        self.closed.load(Ordering::Acquire) && self.position >= self.events.lock().len()
    }
}

/// JSON-lines file; the offset of an event is its line index
///
/// Blank and undecodable lines are skipped (the latter with a warning) but
/// still consume an offset. With `follow` the source tails the file and only
/// complete, newline-terminated lines are read.
#[derive(Debug)]
pub struct JsonLinesSource {
    path: PathBuf,
    time_field: Option<String>,
    follow: bool,
    reader: Option<BufReader<tokio::fs::File>>,
    next_line: u64,
    partial: String,
    at_eof: bool,
    skipped: u64,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>, time_field: Option<String>) -> Self {
        Self {
            path: path.into(),
            time_field,
            follow: false,
            reader: None,
            next_line: 0,
            partial: String::new(),
            at_eof: false,
            skipped: 0,
        }
    }

    pub fn follow(mut self, follow: bool) -> Self {
        self.follow = follow;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines that could not be decoded
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    async fn reader(&mut self) -> Result<&mut BufReader<tokio::fs::File>, SourceError> {
        if self.reader.is_none() {
            let file = tokio::fs::File::open(&self.path)
                .await
                .map_err(|e| SourceError::io(&self.path, e))?;
            self.reader = Some(BufReader::new(file));
        }
        match self.reader.as_mut() {
            Some(reader) => Ok(reader),
            None => Err(SourceError::io(
                &self.path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "reader unavailable"),
            )),
        }
    }

    /// Next complete line, or `None` at the current end of file
    async fn next_raw_line(&mut self) -> Result<Option<String>, SourceError> {
        let follow = self.follow;
        let path = self.path.clone();
        let mut buf = std::mem::take(&mut self.partial);
        let read = self
            .reader()
            .await?
            .read_line(&mut buf)
            .await
            .map_err(|e| SourceError::io(&path, e))?;

        if read == 0 && buf.is_empty() {
            return Ok(None);
        }
        if !buf.ends_with('\n') && follow {
            // Incomplete line still being written
            self.partial = buf;
            return Ok(None);
        }
        Ok(Some(buf))
    }
}

#[async_trait]
impl Source for JsonLinesSource {
    async fn poll(&mut self, max: usize) -> Result<Vec<Event>, SourceError> {
        let mut batch = Vec::with_capacity(max.min(1024));
        while batch.len() < max {
            let Some(line) = self.next_raw_line().await? else {
                self.at_eof = true;
                break;
            };
            self.at_eof = false;
            let offset = self.next_line;
            self.next_line += 1;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Event::from_json_line(line, self.time_field.as_deref()) {
                Ok(event) => batch.push(event.with_offset(offset)),
                Err(e) => {
                    self.skipped += 1;
                    warn!(path = %self.path.display(), offset, error = %e, "Skipping undecodable line");
                }
            }
        }
        Ok(batch)
    }

    async fn seek(&mut self, next_offset: u64) -> Result<(), SourceError> {
        self.reader = None;
        self.partial.clear();
        self.next_line = 0;
        self.at_eof = false;

        while self.next_line < next_offset {
            if self.next_raw_line().await?.is_none() {
                return Err(SourceError::Seek {
                    source_name: self.path.display().to_string(),
                    offset: next_offset,
                    reason: format!("file has only {} lines", self.next_line),
                });
            }
            self.next_line += 1;
        }
        debug!(path = %self.path.display(), offset = next_offset, "Source repositioned");
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }

    fn is_exhausted(&self) -> bool {
        !self.follow && self.at_eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_memory_source_offsets_and_seek() {
        let events = (0..5).map(|i| Event::at_millis(json!({"i": i}), i)).collect();
        let mut source = MemorySource::new(events);

        let first = source.poll(3).await.unwrap();
        assert_eq!(first.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![Some(0), Some(1), Some(2)]);
        assert_eq!(source.poll(10).await.unwrap().len(), 2);
        assert!(source.is_exhausted());

        source.seek(4).await.unwrap();
        assert_eq!(source.poll(10).await.unwrap()[0].offset, Some(4));
    }

    #[tokio::test]
    async fn test_open_memory_source() {
        let (mut source, writer) = MemorySource::open();
        assert!(source.poll(10).await.unwrap().is_empty());
        assert!(!source.is_exhausted());

        writer.push(Event::at_millis(json!({}), 1));
        writer.close();
        assert_eq!(source.poll(10).await.unwrap().len(), 1);
        assert!(source.is_exhausted());
    }

    #[tokio::test]
    async fn test_json_lines_source_skips_bad_lines_and_seeks() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("in.jsonl");
        tokio::fs::write(
            &path,
            "{\"ts\": 0, \"v\": 1}\n\nnot json\n{\"ts\": 60000, \"v\": 2}\n",
        )
        .await
        .unwrap();

        let mut source = JsonLinesSource::new(&path, Some("ts".to_string()));
        let events = source.poll(100).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].offset, Some(3));
        assert_eq!(events[1].event_time_ms(), 60_000);
        assert_eq!(source.skipped(), 1);
        assert!(source.is_exhausted());

        source.seek(3).await.unwrap();
        let replay = source.poll(100).await.unwrap();
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].field("v"), Some(&json!(2)));

        assert!(source.seek(10).await.is_err());
    }

    #[tokio::test]
    async fn test_follow_reads_appended_complete_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tail.jsonl");
        tokio::fs::write(&path, "{\"a\": 1}\n{\"a\": ").await.unwrap();

        let mut source = JsonLinesSource::new(&path, None).follow(true);
        assert_eq!(source.poll(10).await.unwrap().len(), 1);
        assert!(!source.is_exhausted());

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"2}\n").await.unwrap();
        file.flush().await.unwrap();

        let events = source.poll(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].field("a"), Some(&json!(2)));
        assert_eq!(events[0].offset, Some(1));
    }
}
