use super::trait_::Aggregator;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// A value stamped with the event time it was observed at
///
/// Values are kept as JSON text so the state stays encodable with bincode.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimedValue {
    pub event_time_ms: i64,
    pub json: String,
}

/// Accumulator for first/last aggregation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimedAccumulator {
    value: Option<TimedValue>,
    count: u64,
}

impl TimedAccumulator {
    /// Keep the earlier value, or the later one with `keep_latest`. Ties on
    /// event time fall back to the JSON text so the result does not depend
    /// on arrival order.
    fn offer(&mut self, candidate: TimedValue, keep_latest: bool) {
        let replace = match &self.value {
            None => true,
            Some(current) if keep_latest => candidate > *current,
            Some(current) => candidate < *current,
        };
        if replace {
            self.value = Some(candidate);
        }
    }
}

/// Earliest value by event time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirstAggregator {
    state: TimedAccumulator,
}

/// Latest value by event time
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LastAggregator {
    state: TimedAccumulator,
}

impl FirstAggregator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LastAggregator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for FirstAggregator {
    type Input = TimedValue;
    type Output = String;
    type Accumulator = TimedAccumulator;

    fn new() -> Self {
        Self::new()
    }

    fn update(&mut self, value: TimedValue) -> anyhow::Result<()> {
        self.state.count += 1;
        self.state.offer(value, false);
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<String> {
        self.state
            .value
            .as_ref()
            .map(|v| v.json.clone())
            .ok_or_else(|| anyhow!("No values observed"))
    }

    fn accumulator(&self) -> TimedAccumulator {
        self.state.clone()
    }

    fn merge(&mut self, other: TimedAccumulator) -> anyhow::Result<()> {
        self.state.count += other.count;
        if let Some(value) = other.value {
            self.state.offer(value, false);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.state = TimedAccumulator::default();
    }

    fn count(&self) -> u64 {
        self.state.count
    }
}

impl Aggregator for LastAggregator {
    type Input = TimedValue;
    type Output = String;
    type Accumulator = TimedAccumulator;

    fn new() -> Self {
        Self::new()
    }

    fn update(&mut self, value: TimedValue) -> anyhow::Result<()> {
        self.state.count += 1;
        self.state.offer(value, true);
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<String> {
        self.state
            .value
            .as_ref()
            .map(|v| v.json.clone())
            .ok_or_else(|| anyhow!("No values observed"))
    }

    fn accumulator(&self) -> TimedAccumulator {
        self.state.clone()
    }

    fn merge(&mut self, other: TimedAccumulator) -> anyhow::Result<()> {
        self.state.count += other.count;
        if let Some(value) = other.value {
            self.state.offer(value, true);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.state = TimedAccumulator::default();
    }

    fn count(&self) -> u64 {
        self.state.count
    }
}
