//! Output sinks and the output dispatcher
//!
//! Completed windows and (optionally) raw events leave the processing loop
//! as [`SinkRecord`]s on a bounded channel. The [`OutputDispatcher`] task
//! delivers each record to every configured [`OutputSink`], retrying
//! [`SinkError::Retryable`] failures with exponential backoff. Exhausted or
//! fatal deliveries are counted as failed and the stream keeps running.

use crate::config::RetryConfig;
use crate::error::SinkError;
use crate::metrics::{DeliveryOutcome, StreamMetrics};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use stream_analytics_types::{Event, WindowResult};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

/// Record handed to sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkRecord {
    Window(WindowResult),
    Event(Event),
}

impl SinkRecord {
    pub fn as_window(&self) -> Option<&WindowResult> {
        match self {
            Self::Window(result) => Some(result),
            Self::Event(_) => None,
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Self::Event(event) => Some(event),
            Self::Window(_) => None,
        }
    }

    fn to_json_line(&self, sink: &str) -> Result<String, SinkError> {
        let mut line = serde_json::to_string(self).map_err(|e| SinkError::Fatal {
            sink: sink.to_string(),
            reason: format!("failed to encode record: {}", e),
        })?;
        line.push('\n');
        Ok(line)
    }
}

/// Destination for output records; `Ok` acknowledges delivery
#[async_trait]
pub trait OutputSink: Send + Sync {
    async fn deliver(&self, record: &SinkRecord) -> Result<(), SinkError>;

    fn name(&self) -> &str;

    /// Flush buffered output; called once when the dispatcher shuts down
    async fn flush(&self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// JSON lines on standard output
#[derive(Debug, Default)]
pub struct StdoutSink;

#[async_trait]
impl OutputSink for StdoutSink {
    async fn deliver(&self, record: &SinkRecord) -> Result<(), SinkError> {
        let line = record.to_json_line(self.name())?;
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SinkError::Retryable {
                sink: self.name().to_string(),
                reason: e.to_string(),
            })
    }

    fn name(&self) -> &str {
        "stdout"
    }

    async fn flush(&self) -> Result<(), SinkError> {
        tokio::io::stdout()
            .flush()
            .await
            .map_err(|e| SinkError::Fatal {
                sink: self.name().to_string(),
                reason: e.to_string(),
            })
    }
}

/// JSON lines appended to a file
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl FileSink {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::fatal(&path, e))?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Self::fatal(&path, e))?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fatal(path: &Path, err: std::io::Error) -> SinkError {
        SinkError::Fatal {
            sink: "file".to_string(),
            reason: format!("{}: {}", path.display(), err),
        }
    }
}

#[async_trait]
impl OutputSink for FileSink {
    async fn deliver(&self, record: &SinkRecord) -> Result<(), SinkError> {
        let line = record.to_json_line(self.name())?;
        self.file
            .lock()
            .await
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SinkError::Retryable {
                sink: self.name().to_string(),
                reason: format!("{}: {}", self.path.display(), e),
            })
    }

    fn name(&self) -> &str {
        "file"
    }

    async fn flush(&self) -> Result<(), SinkError> {
        let mut file = self.file.lock().await;
        file.flush().await.map_err(|e| Self::fatal(&self.path, e))?;
        file.sync_data().await.map_err(|e| Self::fatal(&self.path, e))
    }
}

/// Keeps records in memory
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<SinkRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records.lock().clone()
    }

    pub fn windows(&self) -> Vec<WindowResult> {
        self.records
            .lock()
            .iter()
            .filter_map(SinkRecord::as_window)
            .cloned()
            .collect()
    }

    pub fn events(&self) -> Vec<Event> {
        self.records
            .lock()
            .iter()
            .filter_map(SinkRecord::as_event)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl OutputSink for MemorySink {
    async fn deliver(&self, record: &SinkRecord) -> Result<(), SinkError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Delivery statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub records: u64,
    pub delivered: u64,
    pub retries: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct DispatchTracker {
    records: AtomicU64,
    delivered: AtomicU64,
    retries: AtomicU64,
    failed: AtomicU64,
}

impl DispatchTracker {
    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            records: self.records.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Delivers records to sinks with bounded retries
pub struct OutputDispatcher {
    sinks: Vec<Arc<dyn OutputSink>>,
    retry: RetryConfig,
    tracker: Arc<DispatchTracker>,
    metrics: StreamMetrics,
}

impl OutputDispatcher {
    pub fn new(sinks: Vec<Arc<dyn OutputSink>>, retry: RetryConfig, metrics: StreamMetrics) -> Self {
        Self {
            sinks,
            retry,
            tracker: Arc::new(DispatchTracker::default()),
            metrics,
        }
    }

    /// Start the dispatcher task behind a channel of `capacity` records
    pub fn spawn(self, capacity: usize) -> DispatcherHandle {
        let (tx, mut rx) = mpsc::channel::<SinkRecord>(capacity.max(1));
        let tracker = Arc::clone(&self.tracker);

        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                self.dispatch(&record).await;
            }
            for sink in &self.sinks {
                if let Err(e) = sink.flush().await {
                    warn!(sink = sink.name(), error = %e, "Sink flush failed");
                }
            }
            debug!("Output dispatcher drained");
            self.tracker.snapshot()
        });

        DispatcherHandle { tx, task, tracker }
    }

    /// Deliver one record to every sink
    pub async fn dispatch(&self, record: &SinkRecord) {
        self.tracker.records.fetch_add(1, Ordering::Relaxed);
        for sink in &self.sinks {
            match self.deliver_with_retry(sink.as_ref(), record).await {
                Ok(()) => {
                    self.tracker.delivered.fetch_add(1, Ordering::Relaxed);
                    self.metrics.delivery(DeliveryOutcome::Delivered);
                }
                Err(e) => {
                    self.tracker.failed.fetch_add(1, Ordering::Relaxed);
                    self.metrics.delivery(DeliveryOutcome::Failed);
                    error!(sink = sink.name(), error = %e, "Delivery failed");
                }
            }
        }
    }

    async fn deliver_with_retry(
        &self,
        sink: &dyn OutputSink,
        record: &SinkRecord,
    ) -> Result<(), SinkError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match sink.deliver(record).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(sink = sink.name(), attempt, "Delivered after retry");
                    }
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    self.tracker.retries.fetch_add(1, Ordering::Relaxed);
                    self.metrics.delivery(DeliveryOutcome::Retried);
                    let backoff = self.retry.delay_for_attempt(attempt);
                    warn!(
                        sink = sink.name(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        self.tracker.snapshot()
    }
}

/// Sending side of a running dispatcher
#[derive(Debug)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<SinkRecord>,
    task: JoinHandle<DispatchStats>,
    tracker: Arc<DispatchTracker>,
}

impl DispatcherHandle {
    /// Queue a record; waits while the channel is full
    pub async fn send(&self, record: SinkRecord) -> Result<(), SinkError> {
        self.tx.send(record).await.map_err(|_| SinkError::Fatal {
            sink: "dispatcher".to_string(),
            reason: "output dispatcher has stopped".to_string(),
        })
    }

    pub fn stats(&self) -> DispatchStats {
        self.tracker.snapshot()
    }

    /// Close the channel and wait until queued records are delivered
    pub async fn shutdown(self) -> DispatchStats {
        let Self { tx, task, tracker } = self;
        drop(tx);
        match task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(error = %e, "Output dispatcher task failed");
                tracker.snapshot()
            }
        }
    }

    /// Stop without draining
    pub fn abort(self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stream_analytics_types::StreamId;
    use tempfile::TempDir;

    /// Fails with a retryable error a fixed number of times, then acks
    struct FlakySink {
        failures_left: Mutex<u32>,
        inner: MemorySink,
    }

    #[async_trait]
    impl OutputSink for FlakySink {
        async fn deliver(&self, record: &SinkRecord) -> Result<(), SinkError> {
            {
                let mut left = self.failures_left.lock();
                if *left > 0 {
                    *left -= 1;
                    return Err(SinkError::Retryable {
                        sink: "flaky".to_string(),
                        reason: "busy".to_string(),
                    });
                }
            }
            self.inner.deliver(record).await
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    struct ClosedSink;

    #[async_trait]
    impl OutputSink for ClosedSink {
        async fn deliver(&self, _: &SinkRecord) -> Result<(), SinkError> {
            Err(SinkError::Fatal {
                sink: "closed".to_string(),
                reason: "gone".to_string(),
            })
        }

        fn name(&self) -> &str {
            "closed"
        }
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    fn metrics() -> StreamMetrics {
        StreamMetrics::detached(&StreamId::new("s").unwrap())
    }

    fn record(i: i64) -> SinkRecord {
        SinkRecord::Event(Event::at_millis(json!({"i": i}), i))
    }

    #[tokio::test]
    async fn test_retryable_errors_are_retried() {
        let flaky = FlakySink {
            failures_left: Mutex::new(2),
            inner: MemorySink::new(),
        };
        let delivered = flaky.inner.clone();
        let dispatcher = OutputDispatcher::new(vec![Arc::new(flaky)], retry(), metrics());

        dispatcher.dispatch(&record(1)).await;
        let stats = dispatcher.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.retries, 2);
        assert_eq!(delivered.len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_and_fatal_errors_are_counted() {
        let flaky = FlakySink {
            failures_left: Mutex::new(10),
            inner: MemorySink::new(),
        };
        let memory = MemorySink::new();
        let metrics = metrics();
        let dispatcher = OutputDispatcher::new(
            vec![Arc::new(flaky), Arc::new(ClosedSink), Arc::new(memory.clone())],
            retry(),
            metrics.clone(),
        );

        dispatcher.dispatch(&record(1)).await;
        let stats = dispatcher.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(metrics.deliveries_failed.get(), 2);
        // Other sinks still receive the record
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test]
    async fn test_spawned_dispatcher_drains_on_shutdown() {
        let memory = MemorySink::new();
        let handle =
            OutputDispatcher::new(vec![Arc::new(memory.clone())], retry(), metrics()).spawn(4);
        for i in 0..10 {
            handle.send(record(i)).await.unwrap();
        }
        let stats = handle.shutdown().await;
        assert_eq!(stats.records, 10);
        assert_eq!(memory.events().len(), 10);
    }

    #[tokio::test]
    async fn test_file_sink_writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out").join("results.jsonl");
        let sink = FileSink::open(&path).await.unwrap();
        sink.deliver(&record(1)).await.unwrap();
        sink.deliver(&record(2)).await.unwrap();
        sink.flush().await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let decoded: SinkRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(decoded.as_event().unwrap().event_time_ms(), 2);
        assert!(lines[0].contains("\"kind\":\"event\""));
    }
}
