use super::trait_::Aggregator;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Accumulator for average aggregation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AverageAccumulator {
    sum: f64,
    count: u64,
}

/// Average aggregator - keeps a running sum and count
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, AverageAggregator};
///
/// let mut agg = AverageAggregator::new();
/// agg.update(10.0).unwrap();
/// agg.update(20.0).unwrap();
/// agg.update(30.0).unwrap();
///
/// assert_eq!(agg.finalize().unwrap(), 20.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AverageAggregator {
    sum: f64,
    count: u64,
}

impl AverageAggregator {
    /// Create a new average aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the current mean value
    pub fn mean(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

impl Aggregator for AverageAggregator {
    type Input = f64;
    type Output = f64;
    type Accumulator = AverageAccumulator;

    fn new() -> Self {
        Self::new()
    }

    fn update(&mut self, value: f64) -> anyhow::Result<()> {
        self.sum += value;
        self.count += 1;
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<f64> {
        self.mean()
            .ok_or_else(|| anyhow!("Cannot compute average of zero values"))
    }

    fn accumulator(&self) -> AverageAccumulator {
        AverageAccumulator {
            sum: self.sum,
            count: self.count,
        }
    }

    fn merge(&mut self, other: AverageAccumulator) -> anyhow::Result<()> {
        self.sum += other.sum;
        self.count += other.count;
        Ok(())
    }

    fn reset(&mut self) {
        self.sum = 0.0;
        self.count = 0;
    }

    fn count(&self) -> u64 {
        self.count
    }
}
