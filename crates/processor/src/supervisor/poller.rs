//! Source poller task
//!
//! Owns the job's [`Source`] and feeds the backpressure controller. It is
//! the only task that may stall on ingestion (the `block` policy).

use crate::backpressure::{Admission, BackpressureController, BackpressureError};
use crate::source::{Source, SourceError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stream_analytics_types::StreamId;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

pub(crate) enum PollerCommand {
    Pause,
    Resume,
    /// Reposition the source, then clear the queue
    Seek {
        offset: u64,
        ack: oneshot::Sender<Result<(), SourceError>>,
    },
    Stop,
}

pub(crate) struct PollerHandle {
    commands: mpsc::Sender<PollerCommand>,
    task: JoinHandle<()>,
    exhausted: Arc<AtomicBool>,
}

impl PollerHandle {
    pub(crate) fn spawn(
        stream_id: StreamId,
        source: Box<dyn Source>,
        backpressure: Arc<BackpressureController>,
        batch_size: usize,
        poll_interval: Duration,
        failures: mpsc::Sender<SourceError>,
    ) -> Self {
        let (commands, rx) = mpsc::channel(16);
        let exhausted = Arc::new(AtomicBool::new(false));
        let poller = Poller {
            stream_id,
            source,
            backpressure,
            batch_size,
            poll_interval,
            failures,
            commands: rx,
            exhausted: Arc::clone(&exhausted),
            paused: false,
        };
        let task = tokio::spawn(poller.run());
        Self {
            commands,
            task,
            exhausted,
        }
    }

    /// The source reported that no more events will arrive
    pub(crate) fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub(crate) async fn pause(&self) {
        let _ = self.commands.send(PollerCommand::Pause).await;
    }

    pub(crate) async fn resume(&self) {
        let _ = self.commands.send(PollerCommand::Resume).await;
    }

    pub(crate) async fn seek(&self, offset: u64) -> Result<(), SourceError> {
        let (ack, done) = oneshot::channel();
        let unavailable = || SourceError::Seek {
            source_name: "poller".to_string(),
            offset,
            reason: "poller task has stopped".to_string(),
        };
        self.commands
            .send(PollerCommand::Seek { offset, ack })
            .await
            .map_err(|_| unavailable())?;
        done.await.map_err(|_| unavailable())?
    }

    pub(crate) fn abort_handle(&self) -> tokio::task::AbortHandle {
        self.task.abort_handle()
    }

    /// Stop polling and wait for the task to exit
    pub(crate) async fn stop(self, backpressure: &BackpressureController) {
        let _ = self.commands.send(PollerCommand::Stop).await;
        // Releases an offer blocked on a full queue
        backpressure.close();
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!(error = %e, "Source poller task failed");
            }
        }
    }
}

struct Poller {
    stream_id: StreamId,
    source: Box<dyn Source>,
    backpressure: Arc<BackpressureController>,
    batch_size: usize,
    poll_interval: Duration,
    failures: mpsc::Sender<SourceError>,
    commands: mpsc::Receiver<PollerCommand>,
    exhausted: Arc<AtomicBool>,
    paused: bool,
}

impl Poller {
    async fn run(mut self) {
        debug!(stream_id = %self.stream_id, source = self.source.name(), "Source poller started");
        loop {
            while let Ok(command) = self.commands.try_recv() {
                if !self.handle(command).await {
                    return;
                }
            }

            if self.paused {
                match self.commands.recv().await {
                    Some(command) => {
                        if !self.handle(command).await {
                            return;
                        }
                        continue;
                    }
                    None => return,
                }
            }

            let batch = match self.source.poll(self.batch_size).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(stream_id = %self.stream_id, error = %e, "Source poll failed");
                    // Wait for a seek from recovery, or a stop
                    self.paused = true;
                    let _ = self.failures.send(e).await;
                    continue;
                }
            };

            if batch.is_empty() {
                if self.source.is_exhausted() && !self.exhausted.swap(true, Ordering::AcqRel) {
                    debug!(stream_id = %self.stream_id, "Source exhausted");
                }
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(command) => {
                            if !self.handle(command).await {
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            }

            let epoch = self.backpressure.epoch();
            for event in batch {
                if self.backpressure.epoch() != epoch {
                    // Queue cleared for recovery; the rest of the batch is stale
                    break;
                }
                match self.backpressure.offer(event).await {
                    Ok(Admission::Discarded) => break,
                    Ok(_) => {}
                    Err(BackpressureError::Closed) => return,
                    Err(e) => warn!(
                        stream_id = %self.stream_id,
                        error = %e,
                        "Spill store rejected event, counted as lost"
                    ),
                }
            }
        }
    }

    /// Returns `false` when the poller should exit
    async fn handle(&mut self, command: PollerCommand) -> bool {
        match command {
            PollerCommand::Pause => self.paused = true,
            PollerCommand::Resume => self.paused = false,
            PollerCommand::Seek { offset, ack } => {
                let result = self.source.seek(offset).await;
                match &result {
                    Ok(()) => {
                        if let Err(e) = self.backpressure.clear().await {
                            warn!(stream_id = %self.stream_id, error = %e, "Failed to clear spill store");
                        }
                        self.exhausted.store(false, Ordering::Release);
                        self.paused = false;
                    }
                    Err(e) => {
                        warn!(stream_id = %self.stream_id, offset, error = %e, "Source seek failed")
                    }
                }
                let _ = ack.send(result);
            }
            PollerCommand::Stop => return false,
        }
        true
    }
}
