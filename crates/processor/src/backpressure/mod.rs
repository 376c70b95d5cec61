//! Backpressure controller
//!
//! The controller owns the bounded queue between a job's source poller and
//! its processing loop. [`BackpressureController::offer`] applies the
//! configured policy once the queue depth reaches the threshold:
//!
//! - `drop` discards the newest event
//! - `block` suspends the poller until the loop drains below the threshold
//! - `spill` moves the event to a [`SpillStore`] for later replay
//! - `sample` admits the event with probability `sample_rate`, up to twice
//!   the threshold
//!
//! Every affected event is counted so consumers can reason about
//! completeness.
//!
//! The controller also tracks the source offsets of every event still
//! waiting in the queue or the spill store. Spilled events are processed
//! after events polled later, so checkpoints commit up to
//! [`lowest_pending_offset`](BackpressureController::lowest_pending_offset)
//! rather than the highest offset processed.

mod spill;

pub use spill::{FileSpillStore, MemorySpillStore, SpillStore};

use crate::config::{BackpressureKind, BackpressurePolicy};
use crate::metrics::StreamMetrics;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use stream_analytics_types::Event;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Backpressure errors
#[derive(Error, Debug)]
pub enum BackpressureError {
    #[error("spill store failure: {reason}")]
    Spill { reason: String },

    #[error("ingestion queue is closed")]
    Closed,
}

impl BackpressureError {
    pub(crate) fn spill(path: &Path, err: std::io::Error) -> Self {
        Self::Spill {
            reason: format!("{}: {}", path.display(), err),
        }
    }
}

/// What `offer` did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Queued for processing
    Queued,
    /// Discarded by the drop policy or the sampling ceiling
    Dropped,
    /// Moved to the spill store
    Spilled,
    /// Rejected by sampling
    SampledOut,
    /// The queue was cleared while the offer was waiting
    Discarded,
}

/// Counters of events affected by the policy
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureStats {
    pub queued: u64,
    pub dropped: u64,
    pub blocked: u64,
    pub spilled: u64,
    pub replayed: u64,
    pub sampled_out: u64,
    pub sampled_in: u64,
    /// Events lost because the spill store rejected them
    pub spill_failed: u64,
}

impl BackpressureStats {
    /// Events affected under `kind`
    pub fn affected(&self, kind: BackpressureKind) -> u64 {
        match kind {
            BackpressureKind::Drop => self.dropped,
            BackpressureKind::Block => self.blocked,
            BackpressureKind::Spill => self.spilled + self.spill_failed,
            BackpressureKind::Sample => self.sampled_out + self.dropped,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    dropped: AtomicU64,
    blocked: AtomicU64,
    spilled: AtomicU64,
    replayed: AtomicU64,
    sampled_out: AtomicU64,
    sampled_in: AtomicU64,
    spill_failed: AtomicU64,
}

/// Multiset of source offsets held by the queue and the spill store
#[derive(Debug, Default)]
struct PendingOffsets {
    counts: BTreeMap<u64, usize>,
}

impl PendingOffsets {
    fn insert(&mut self, offset: Option<u64>) {
        if let Some(offset) = offset {
            *self.counts.entry(offset).or_default() += 1;
        }
    }

    fn remove(&mut self, offset: Option<u64>) {
        let Some(offset) = offset else {
            return;
        };
        if let Entry::Occupied(mut entry) = self.counts.entry(offset) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }

    fn lowest(&self) -> Option<u64> {
        self.counts.keys().next().copied()
    }

    fn clear(&mut self) {
        self.counts.clear();
    }
}

/// Bounded ingestion queue with an overload policy
pub struct BackpressureController {
    policy: BackpressurePolicy,
    queue: Mutex<VecDeque<Event>>,
    space: Notify,
    spill: tokio::sync::Mutex<Box<dyn SpillStore>>,
    spill_pending: AtomicUsize,
    pending_offsets: Mutex<PendingOffsets>,
    epoch: AtomicU64,
    closed: AtomicBool,
    counters: Counters,
    metrics: StreamMetrics,
}

impl BackpressureController {
    pub fn new(policy: BackpressurePolicy, metrics: StreamMetrics) -> Self {
        Self::with_spill_store(policy, Box::new(MemorySpillStore::new()), metrics)
    }

    pub fn with_spill_store(
        policy: BackpressurePolicy,
        mut spill: Box<dyn SpillStore>,
        metrics: StreamMetrics,
    ) -> Self {
        let pending = spill.len();
        let mut pending_offsets = PendingOffsets::default();
        for offset in spill.take_recovered_offsets() {
            pending_offsets.insert(Some(offset));
        }
        Self {
            policy,
            queue: Mutex::new(VecDeque::new()),
            space: Notify::new(),
            spill: tokio::sync::Mutex::new(spill),
            spill_pending: AtomicUsize::new(pending),
            pending_offsets: Mutex::new(pending_offsets),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            counters: Counters::default(),
            metrics,
        }
    }

    pub fn policy(&self) -> &BackpressurePolicy {
        &self.policy
    }

    pub fn depth(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn spilled_pending(&self) -> usize {
        self.spill_pending.load(Ordering::Acquire)
    }

    /// Smallest source offset of an event not yet handed to the processing loop
    pub fn lowest_pending_offset(&self) -> Option<u64> {
        self.pending_offsets.lock().lowest()
    }

    /// Incremented by every [`clear`](Self::clear)
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Offer one event from the source
    pub async fn offer(&self, event: Event) -> Result<Admission, BackpressureError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BackpressureError::Closed);
        }
        let threshold = self.policy.threshold;

        match self.policy.kind {
            BackpressureKind::Drop => {
                let mut queue = self.queue.lock();
                if queue.len() >= threshold {
                    drop(queue);
                    trace!(event_id = %event.id, "Dropping event over threshold");
                    return Ok(self.affect(&self.counters.dropped, Admission::Dropped));
                }
                Ok(self.enqueue(&mut queue, event))
            }
            BackpressureKind::Block => self.offer_blocking(event).await,
            BackpressureKind::Spill => {
                {
                    let mut queue = self.queue.lock();
                    if queue.len() < threshold {
                        return Ok(self.enqueue(&mut queue, event));
                    }
                }
                if let Err(e) = self.spill.lock().await.append(&event).await {
                    self.affect(&self.counters.spill_failed, Admission::Dropped);
                    return Err(e);
                }
                self.pending_offsets.lock().insert(event.offset);
                self.spill_pending.fetch_add(1, Ordering::AcqRel);
                Ok(self.affect(&self.counters.spilled, Admission::Spilled))
            }
            BackpressureKind::Sample => {
                let mut queue = self.queue.lock();
                if queue.len() < threshold {
                    return Ok(self.enqueue(&mut queue, event));
                }
                if queue.len() >= threshold.saturating_mul(2) {
                    return Ok(self.affect(&self.counters.dropped, Admission::Dropped));
                }
                if rand::random::<f64>() < self.policy.sample_rate {
                    self.counters.sampled_in.fetch_add(1, Ordering::Relaxed);
                    return Ok(self.enqueue(&mut queue, event));
                }
                Ok(self.affect(&self.counters.sampled_out, Admission::SampledOut))
            }
        }
    }

    async fn offer_blocking(&self, event: Event) -> Result<Admission, BackpressureError> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let mut waited = false;
        loop {
            // Registered before the depth check so a drain in between is not missed
            let notified = self.space.notified();
            {
                if self.closed.load(Ordering::Acquire) {
                    return Err(BackpressureError::Closed);
                }
                if self.epoch.load(Ordering::Acquire) != epoch {
                    return Ok(Admission::Discarded);
                }
                let mut queue = self.queue.lock();
                if queue.len() < self.policy.threshold {
                    return Ok(self.enqueue(&mut queue, event));
                }
            }
            if !waited {
                waited = true;
                self.counters.blocked.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .backpressure_affected(BackpressureKind::Block, 1);
                trace!("Ingestion blocked on a full queue");
            }
            notified.await;
        }
    }

    /// Push under the queue lock so a concurrent drain never sees the event untracked
    fn enqueue(&self, queue: &mut VecDeque<Event>, event: Event) -> Admission {
        self.pending_offsets.lock().insert(event.offset);
        queue.push_back(event);
        self.counters.queued.fetch_add(1, Ordering::Relaxed);
        Admission::Queued
    }

    fn affect(&self, counter: &AtomicU64, admission: Admission) -> Admission {
        counter.fetch_add(1, Ordering::Relaxed);
        self.metrics.backpressure_affected(self.policy.kind, 1);
        admission
    }

    /// Take up to `max` queued events and wake blocked offers
    pub fn drain(&self, max: usize) -> Vec<Event> {
        let batch: Vec<Event> = {
            let mut queue = self.queue.lock();
            let n = max.min(queue.len());
            queue.drain(..n).collect()
        };
        if !batch.is_empty() {
            let mut pending = self.pending_offsets.lock();
            for event in &batch {
                pending.remove(event.offset);
            }
            drop(pending);
            self.space.notify_waiters();
        }
        batch
    }

    /// Move spilled events back while depth is below `threshold * resume_ratio`
    pub async fn replay_spilled(&self) -> Result<usize, BackpressureError> {
        if self.spilled_pending() == 0 {
            return Ok(0);
        }
        let resume_depth = ((self.policy.threshold as f64) * self.policy.resume_ratio) as usize;
        let room = resume_depth.saturating_sub(self.depth());
        if room == 0 {
            return Ok(0);
        }

        let mut spill = self.spill.lock().await;
        let events = spill.take(room).await?;
        self.spill_pending.store(spill.len(), Ordering::Release);
        drop(spill);

        let n = events.len();
        if n > 0 {
            self.queue.lock().extend(events);
            self.counters.replayed.fetch_add(n as u64, Ordering::Relaxed);
            debug!(events = n, pending = self.spilled_pending(), "Replayed spilled events");
        }
        Ok(n)
    }

    /// Drop queued and spilled events, releasing any blocked offer
    pub async fn clear(&self) -> Result<(), BackpressureError> {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let cleared = {
            let mut queue = self.queue.lock();
            let n = queue.len();
            queue.clear();
            self.pending_offsets.lock().clear();
            n
        };
        self.space.notify_waiters();

        let mut spill = self.spill.lock().await;
        spill.clear().await?;
        self.spill_pending.store(0, Ordering::Release);
        debug!(cleared, "Ingestion queue cleared");
        Ok(())
    }

    /// Refuse further offers and release blocked ones
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> BackpressureStats {
        BackpressureStats {
            queued: self.counters.queued.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            blocked: self.counters.blocked.load(Ordering::Relaxed),
            spilled: self.counters.spilled.load(Ordering::Relaxed),
            replayed: self.counters.replayed.load(Ordering::Relaxed),
            sampled_out: self.counters.sampled_out.load(Ordering::Relaxed),
            sampled_in: self.counters.sampled_in.load(Ordering::Relaxed),
            spill_failed: self.counters.spill_failed.load(Ordering::Relaxed),
        }
    }

    /// Events affected under the active policy
    pub fn affected(&self) -> u64 {
        self.stats().affected(self.policy.kind)
    }
}

impl std::fmt::Debug for BackpressureController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureController")
            .field("policy", &self.policy)
            .field("depth", &self.depth())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use stream_analytics_types::StreamId;

    fn controller(kind: BackpressureKind, threshold: usize) -> BackpressureController {
        let policy = BackpressurePolicy {
            kind,
            threshold,
            ..Default::default()
        };
        BackpressureController::new(policy, StreamMetrics::detached(&StreamId::new("s").unwrap()))
    }

    fn event(i: i64) -> Event {
        Event::at_millis(json!({"i": i}), i)
    }

    #[tokio::test]
    async fn test_drop_discards_newest_over_threshold() {
        let bp = controller(BackpressureKind::Drop, 100);
        for i in 0..150 {
            bp.offer(event(i)).await.unwrap();
        }
        assert_eq!(bp.depth(), 100);
        assert_eq!(bp.stats().dropped, 50);
        assert_eq!(bp.affected(), 50);

        let kept = bp.drain(usize::MAX);
        assert_eq!(kept.last().unwrap().event_time_ms(), 99);
    }

    #[tokio::test]
    async fn test_block_suspends_until_drained() {
        let bp = Arc::new(controller(BackpressureKind::Block, 2));
        bp.offer(event(0)).await.unwrap();
        bp.offer(event(1)).await.unwrap();

        let offering = {
            let bp = Arc::clone(&bp);
            tokio::spawn(async move { bp.offer(event(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!offering.is_finished());
        assert_eq!(bp.stats().blocked, 1);

        assert_eq!(bp.drain(1).len(), 1);
        assert_eq!(offering.await.unwrap().unwrap(), Admission::Queued);
        assert_eq!(bp.depth(), 2);
    }

    #[tokio::test]
    async fn test_clear_and_close_release_blocked_offers() {
        let bp = Arc::new(controller(BackpressureKind::Block, 1));
        bp.offer(event(0)).await.unwrap();

        let waiting = {
            let bp = Arc::clone(&bp);
            tokio::spawn(async move { bp.offer(event(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        bp.clear().await.unwrap();
        assert_eq!(waiting.await.unwrap().unwrap(), Admission::Discarded);
        assert_eq!(bp.depth(), 0);

        bp.close();
        assert!(matches!(bp.offer(event(2)).await, Err(BackpressureError::Closed)));
    }

    #[tokio::test]
    async fn test_spill_and_replay() {
        let mut bp = controller(BackpressureKind::Spill, 10);
        bp.policy.resume_ratio = 0.5;
        for i in 0..25 {
            bp.offer(event(i)).await.unwrap();
        }
        assert_eq!(bp.depth(), 10);
        assert_eq!(bp.spilled_pending(), 15);

        // Nothing replays until depth falls below 5
        assert_eq!(bp.replay_spilled().await.unwrap(), 0);
        bp.drain(10);
        assert_eq!(bp.replay_spilled().await.unwrap(), 5);
        assert_eq!(bp.drain(10)[0].event_time_ms(), 10);

        let stats = bp.stats();
        assert_eq!(stats.spilled, 15);
        assert_eq!(stats.replayed, 5);
    }

    #[tokio::test]
    async fn test_lowest_pending_offset_covers_queue_and_spill() {
        let mut bp = controller(BackpressureKind::Spill, 2);
        bp.policy.resume_ratio = 1.0;
        for i in 0..6 {
            bp.offer(event(i).with_offset(i as u64)).await.unwrap();
        }
        assert_eq!(bp.lowest_pending_offset(), Some(0));

        // Offsets 0 and 1 leave; 2..6 wait in the spill store
        bp.drain(2);
        assert_eq!(bp.lowest_pending_offset(), Some(2));

        // A later event overtakes the spilled ones
        bp.offer(event(6).with_offset(6)).await.unwrap();
        assert_eq!(bp.drain(1)[0].offset, Some(6));
        assert_eq!(bp.lowest_pending_offset(), Some(2));

        assert_eq!(bp.replay_spilled().await.unwrap(), 2);
        assert_eq!(bp.lowest_pending_offset(), Some(2));
        bp.drain(2);
        assert_eq!(bp.lowest_pending_offset(), Some(4));

        bp.clear().await.unwrap();
        assert_eq!(bp.lowest_pending_offset(), None);
    }

    struct FailingSpillStore;

    #[async_trait::async_trait]
    impl SpillStore for FailingSpillStore {
        async fn append(&mut self, _event: &Event) -> Result<(), BackpressureError> {
            Err(BackpressureError::Spill {
                reason: "disk full".to_string(),
            })
        }

        async fn take(&mut self, _max: usize) -> Result<Vec<Event>, BackpressureError> {
            Ok(Vec::new())
        }

        async fn clear(&mut self) -> Result<(), BackpressureError> {
            Ok(())
        }

        fn len(&self) -> usize {
            0
        }
    }

    #[tokio::test]
    async fn test_failed_spill_is_counted() {
        let policy = BackpressurePolicy {
            kind: BackpressureKind::Spill,
            threshold: 1,
            ..Default::default()
        };
        let bp = BackpressureController::with_spill_store(
            policy,
            Box::new(FailingSpillStore),
            StreamMetrics::detached(&StreamId::new("s").unwrap()),
        );
        bp.offer(event(0).with_offset(0)).await.unwrap();
        let err = bp.offer(event(1).with_offset(1)).await.unwrap_err();
        assert!(matches!(err, BackpressureError::Spill { .. }));

        let stats = bp.stats();
        assert_eq!(stats.spill_failed, 1);
        assert_eq!(stats.spilled, 0);
        assert_eq!(bp.affected(), 1);
        // The lost event is not waiting anywhere
        assert_eq!(bp.lowest_pending_offset(), Some(0));
    }

    #[tokio::test]
    async fn test_sample_admits_about_sample_rate_over_threshold() {
        let mut bp = controller(BackpressureKind::Sample, 1_000);
        bp.policy.sample_rate = 0.5;
        // 1000 over-threshold offers admit about 500, well below the 2000 cap
        for i in 0..2_000 {
            bp.offer(event(i)).await.unwrap();
        }
        let stats = bp.stats();
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.sampled_in + stats.sampled_out, 1_000);
        assert!(
            (400..=600).contains(&stats.sampled_in),
            "sampled in {} of 1000",
            stats.sampled_in
        );
        assert_eq!(bp.depth() as u64, 1_000 + stats.sampled_in);
    }

    #[tokio::test]
    async fn test_sample_is_capped_at_twice_the_threshold() {
        let bp = controller(BackpressureKind::Sample, 10);
        for i in 0..1_000 {
            bp.offer(event(i)).await.unwrap();
        }
        let stats = bp.stats();
        assert!(bp.depth() <= 20);
        assert_eq!(stats.queued as usize, bp.depth());
        assert_eq!(stats.sampled_in + stats.sampled_out + stats.dropped + 10, 1_000);
    }
}
