use super::trait_::Aggregator;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Running extreme value shared by min and max
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtremeAccumulator {
    value: Option<f64>,
    count: u64,
}

impl ExtremeAccumulator {
    fn observe(&mut self, value: f64, pick: fn(f64, f64) -> f64) {
        self.value = Some(match self.value {
            Some(current) => pick(current, value),
            None => value,
        });
        self.count += 1;
    }

    fn combine(&mut self, other: ExtremeAccumulator, pick: fn(f64, f64) -> f64) {
        self.value = match (self.value, other.value) {
            (Some(a), Some(b)) => Some(pick(a, b)),
            (a, b) => a.or(b),
        };
        self.count += other.count;
    }
}

/// Min aggregator - tracks the minimum value seen
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, MinAggregator};
///
/// let mut agg = MinAggregator::new();
/// agg.update(30.0).unwrap();
/// agg.update(10.0).unwrap();
///
/// assert_eq!(agg.finalize().unwrap(), 10.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MinAggregator {
    state: ExtremeAccumulator,
}

impl MinAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn min(&self) -> Option<f64> {
        self.state.value
    }
}

impl Aggregator for MinAggregator {
    type Input = f64;
    type Output = f64;
    type Accumulator = ExtremeAccumulator;

    fn new() -> Self {
        Self::new()
    }

    fn update(&mut self, value: f64) -> anyhow::Result<()> {
        self.state.observe(value, f64::min);
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<f64> {
        self.state
            .value
            .ok_or_else(|| anyhow!("Cannot compute minimum of zero values"))
    }

    fn accumulator(&self) -> ExtremeAccumulator {
        self.state
    }

    fn merge(&mut self, other: ExtremeAccumulator) -> anyhow::Result<()> {
        self.state.combine(other, f64::min);
        Ok(())
    }

    fn reset(&mut self) {
        self.state = ExtremeAccumulator::default();
    }

    fn count(&self) -> u64 {
        self.state.count
    }
}

/// Max aggregator - tracks the maximum value seen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaxAggregator {
    state: ExtremeAccumulator,
}

impl MaxAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max(&self) -> Option<f64> {
        self.state.value
    }
}

impl Aggregator for MaxAggregator {
    type Input = f64;
    type Output = f64;
    type Accumulator = ExtremeAccumulator;

    fn new() -> Self {
        Self::new()
    }

    fn update(&mut self, value: f64) -> anyhow::Result<()> {
        self.state.observe(value, f64::max);
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<f64> {
        self.state
            .value
            .ok_or_else(|| anyhow!("Cannot compute maximum of zero values"))
    }

    fn accumulator(&self) -> ExtremeAccumulator {
        self.state
    }

    fn merge(&mut self, other: ExtremeAccumulator) -> anyhow::Result<()> {
        self.state.combine(other, f64::max);
        Ok(())
    }

    fn reset(&mut self) {
        self.state = ExtremeAccumulator::default();
    }

    fn count(&self) -> u64 {
        self.state.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_max_basic() {
        let mut min = MinAggregator::new();
        let mut max = MaxAggregator::new();
        for v in [5.0, -2.0, 9.5, 3.0] {
            min.update(v).unwrap();
            max.update(v).unwrap();
        }
        assert_eq!(min.finalize().unwrap(), -2.0);
        assert_eq!(max.finalize().unwrap(), 9.5);
    }

    #[test]
    fn test_empty_min_max_error() {
        assert!(MinAggregator::new().finalize().is_err());
        assert!(MaxAggregator::new().finalize().is_err());
    }

    #[test]
    fn test_merge_with_empty_side() {
        let mut min = MinAggregator::new();
        min.merge(MinAggregator::new().accumulator()).unwrap();
        assert!(min.min().is_none());

        let mut other = MinAggregator::new();
        other.update(4.0).unwrap();
        min.merge(other.accumulator()).unwrap();
        assert_eq!(min.min(), Some(4.0));

        let mut max = MaxAggregator::new();
        max.update(1.0).unwrap();
        let mut other = MaxAggregator::new();
        other.update(7.0).unwrap();
        max.merge(other.accumulator()).unwrap();
        assert_eq!(max.max(), Some(7.0));
        assert_eq!(max.count(), 2);
    }
}
