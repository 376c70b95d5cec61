use super::trait_::Aggregator;

use serde::{Deserialize, Serialize};

/// Accumulator for sum aggregation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SumAccumulator {
    sum: f64,
    count: u64,
}

/// Sum aggregator - computes the sum of all values
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, SumAggregator};
///
/// let mut agg = SumAggregator::new();
/// agg.update(1.0).unwrap();
/// agg.update(2.0).unwrap();
/// agg.update(3.0).unwrap();
///
/// assert_eq!(agg.finalize().unwrap(), 6.0);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SumAggregator {
    sum: f64,
    count: u64,
}

impl SumAggregator {
    /// Create a new sum aggregator
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for SumAggregator {
    type Input = f64;
    type Output = f64;
    type Accumulator = SumAccumulator;

    fn new() -> Self {
        Self::new()
    }

    fn update(&mut self, value: f64) -> anyhow::Result<()> {
        self.sum += value;
        self.count += 1;
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<f64> {
        Ok(self.sum)
    }

    fn accumulator(&self) -> SumAccumulator {
        SumAccumulator {
            sum: self.sum,
            count: self.count,
        }
    }

    fn merge(&mut self, other: SumAccumulator) -> anyhow::Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_basic() {
        let mut agg = SumAggregator::new();
        agg.update_batch(&[1.5, 2.5, -1.0]).unwrap();
        assert_eq!(agg.finalize().unwrap(), 3.0);
        assert_eq!(agg.count(), 3);
    }

    #[test]
    fn test_sum_empty_is_zero() {
        let agg = SumAggregator::new();
        assert_eq!(agg.finalize().unwrap(), 0.0);
    }

    #[test]
    fn test_sum_merge() {
        let mut agg1 = SumAggregator::new();
        agg1.update_batch(&[1.0, 2.0]).unwrap();
        let mut agg2 = SumAggregator::new();
        agg2.update_batch(&[3.0, 4.0]).unwrap();

        agg1.merge(agg2.accumulator()).unwrap();
        assert_eq!(agg1.finalize().unwrap(), 10.0);
        assert_eq!(agg1.count(), 4);
    }
}
