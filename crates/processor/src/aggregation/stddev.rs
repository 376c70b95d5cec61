use super::trait_::Aggregator;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};

/// Accumulator for standard deviation aggregation
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StdDevAccumulator {
    count: u64,
    mean: f64,
    /// Sum of squared differences from the mean
    m2: f64,
}

/// Sample standard deviation using Welford's online algorithm
///
/// O(1) memory and update cost. Fewer than two values give no result.
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, StandardDeviationAggregator};
///
/// let mut agg = StandardDeviationAggregator::new();
/// agg.update_batch(&[10.0, 12.0, 14.0, 16.0, 18.0]).unwrap();
///
/// let stddev = agg.finalize().unwrap();
/// assert!((stddev - 3.1622).abs() < 0.01);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StandardDeviationAggregator {
    state: StdDevAccumulator,
}

impl StandardDeviationAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample variance (n - 1)
    pub fn variance(&self) -> Option<f64> {
        if self.state.count < 2 {
            return None;
        }
        Some(self.state.m2 / (self.state.count - 1) as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    pub fn mean(&self) -> Option<f64> {
        (self.state.count > 0).then_some(self.state.mean)
    }
}

impl Aggregator for StandardDeviationAggregator {
    type Input = f64;
    type Output = f64;
    type Accumulator = StdDevAccumulator;

    fn new() -> Self {
        Self::new()
    }

    fn update(&mut self, x: f64) -> anyhow::Result<()> {
        let s = &mut self.state;
        s.count += 1;
        let delta = x - s.mean;
        s.mean += delta / s.count as f64;
        s.m2 += delta * (x - s.mean);
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<f64> {
        self.std_dev()
            .ok_or_else(|| anyhow!("Cannot compute standard deviation with less than 2 values"))
    }

    fn accumulator(&self) -> StdDevAccumulator {
        self.state
    }

    fn merge(&mut self, other: StdDevAccumulator) -> anyhow::Result<()> {
        if other.count == 0 {
            return Ok(());
        }
        if self.state.count == 0 {
            self.state = other;
            return Ok(());
        }

        // Chan et al. parallel combination
        let s = &mut self.state;
        let n1 = s.count as f64;
        let n2 = other.count as f64;
        let total = n1 + n2;
        let delta = other.mean - s.mean;

        s.m2 += other.m2 + delta * delta * n1 * n2 / total;
        s.mean = (n1 * s.mean + n2 * other.mean) / total;
        s.count += other.count;
        Ok(())
    }

    fn reset(&mut self) {
        self.state = StdDevAccumulator::default();
    }

    fn count(&self) -> u64 {
        self.state.count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_stddev_basic() {
        let mut agg = StandardDeviationAggregator::new();
        agg.update_batch(&[10.0, 12.0, 14.0, 16.0, 18.0]).unwrap();

        assert_eq!(agg.count(), 5);
        assert_relative_eq!(agg.mean().unwrap(), 14.0);
        assert_relative_eq!(agg.variance().unwrap(), 10.0, epsilon = 1e-9);
        assert_relative_eq!(agg.finalize().unwrap(), 10f64.sqrt(), epsilon = 1e-9);
    }

    #[test]
    fn test_stddev_needs_two_values() {
        let mut agg = StandardDeviationAggregator::new();
        agg.update(5.0).unwrap();
        assert!(agg.finalize().is_err());
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let data = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];

        let mut whole = StandardDeviationAggregator::new();
        whole.update_batch(&data).unwrap();

        let mut left = StandardDeviationAggregator::new();
        left.update_batch(&data[..3]).unwrap();
        let mut right = StandardDeviationAggregator::new();
        right.update_batch(&data[3..]).unwrap();
        left.merge(right.accumulator()).unwrap();

        assert_relative_eq!(
            left.finalize().unwrap(),
            whole.finalize().unwrap(),
            epsilon = 1e-9
        );
    }
}
