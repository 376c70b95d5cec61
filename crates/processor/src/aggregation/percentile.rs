use super::trait_::Aggregator;
use anyhow::anyhow;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Reservoir capacity per percentile accumulator
pub const RESERVOIR_CAPACITY: usize = 1024;

/// Accumulator for percentile aggregation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PercentileAccumulator {
    samples: Vec<f64>,
    seen: u64,
}

/// Percentile aggregator backed by a bounded uniform reservoir
///
/// Up to [`RESERVOIR_CAPACITY`] values the result is exact (linear
/// interpolation between closest ranks). Beyond that, values are kept with
/// reservoir sampling (Algorithm R), bounding memory at 1024 samples; the
/// returned value is then the percentile of a uniform sample, with a rank
/// error of roughly `1/sqrt(1024)`, about 3 percentage points.
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, PercentileAggregator};
///
/// let mut agg = PercentileAggregator::with_percentile(95.0).unwrap();
/// for i in 1..=100 {
///     agg.update(i as f64).unwrap();
/// }
///
/// let p95 = agg.finalize().unwrap();
/// assert!((p95 - 95.0).abs() < 1.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PercentileAggregator {
    samples: Vec<f64>,
    seen: u64,
    percentile: f64,
}

impl PercentileAggregator {
    /// Create a percentile aggregator; `percentile` must be in (0, 100]
    pub fn with_percentile(percentile: f64) -> anyhow::Result<Self> {
        if !(percentile > 0.0 && percentile <= 100.0) {
            return Err(anyhow!("Percentile must be in (0, 100], got {}", percentile));
        }
        Ok(Self {
            samples: Vec::new(),
            seen: 0,
            percentile,
        })
    }

    /// Median aggregator
    pub fn p50() -> Self {
        Self {
            samples: Vec::new(),
            seen: 0,
            percentile: 50.0,
        }
    }

    pub fn percentile(&self) -> f64 {
        self.percentile
    }

    /// Whether the result is computed from every value seen
    pub fn is_exact(&self) -> bool {
        self.seen as usize == self.samples.len()
    }

    fn interpolate(sorted: &[f64], percentile: f64) -> Option<f64> {
        match sorted.len() {
            0 => None,
            1 => Some(sorted[0]),
            len => {
                let rank = (percentile / 100.0) * (len - 1) as f64;
                let lower = rank.floor() as usize;
                let upper = rank.ceil() as usize;
                let fraction = rank - lower as f64;
                Some(sorted[lower] * (1.0 - fraction) + sorted[upper] * fraction)
            }
        }
    }
}

impl Aggregator for PercentileAggregator {
    type Input = f64;
    type Output = f64;
    type Accumulator = PercentileAccumulator;

    fn new() -> Self {
        Self::p50()
    }

    fn update(&mut self, value: f64) -> anyhow::Result<()> {
        self.seen += 1;
        if self.samples.len() < RESERVOIR_CAPACITY {
            self.samples.push(value);
        } else {
            let slot = rand::thread_rng().gen_range(0..self.seen);
            if (slot as usize) < RESERVOIR_CAPACITY {
                self.samples[slot as usize] = value;
            }
        }
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<f64> {
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Self::interpolate(&sorted, self.percentile)
            .ok_or_else(|| anyhow!("Cannot compute percentile of zero values"))
    }

    fn accumulator(&self) -> PercentileAccumulator {
        PercentileAccumulator {
            samples: self.samples.clone(),
            seen: self.seen,
        }
    }

    fn merge(&mut self, other: PercentileAccumulator) -> anyhow::Result<()> {
        let total = self.seen + other.seen;
        if self.samples.len() + other.samples.len() <= RESERVOIR_CAPACITY {
            self.samples.extend(other.samples);
            self.seen = total;
            return Ok(());
        }

        // Draw from each side in proportion to how many values it represents
        let mut rng = rand::thread_rng();
        let mut mine = std::mem::take(&mut self.samples);
        let mut theirs = other.samples;
        mine.shuffle(&mut rng);
        theirs.shuffle(&mut rng);

        let mut merged = Vec::with_capacity(RESERVOIR_CAPACITY);
        while merged.len() < RESERVOIR_CAPACITY && !(mine.is_empty() && theirs.is_empty()) {
            let take_mine = if theirs.is_empty() {
                true
            } else if mine.is_empty() {
                false
            } else {
                rng.gen_range(0..total) < self.seen
            };
            let next = if take_mine { mine.pop() } else { theirs.pop() };
            merged.extend(next);
        }

        self.samples = merged;
        self.seen = total;
        Ok(())
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.seen = 0;
    }

    fn count(&self) -> u64 {
        self.seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_exact_percentiles() {
        let mut agg = PercentileAggregator::p50();
        agg.update_batch(&[5.0, 1.0, 3.0, 2.0, 4.0]).unwrap();
        assert_eq!(agg.finalize().unwrap(), 3.0);
        assert!(agg.is_exact());

        let mut p100 = PercentileAggregator::with_percentile(100.0).unwrap();
        p100.update_batch(&[5.0, 1.0, 3.0]).unwrap();
        assert_eq!(p100.finalize().unwrap(), 5.0);
    }

    #[test]
    fn test_invalid_percentile() {
        assert!(PercentileAggregator::with_percentile(0.0).is_err());
        assert!(PercentileAggregator::with_percentile(100.5).is_err());
    }

    #[test]
    fn test_reservoir_is_bounded_and_close() {
        let mut agg = PercentileAggregator::with_percentile(90.0).unwrap();
        for i in 0..100_000 {
            agg.update(i as f64).unwrap();
        }
        assert_eq!(agg.accumulator().samples.len(), RESERVOIR_CAPACITY);
        assert!(!agg.is_exact());
        // Rank error bound of the reservoir, with generous slack
        assert_abs_diff_eq!(agg.finalize().unwrap(), 90_000.0, epsilon = 10_000.0);
    }

    #[test]
    fn test_merge_small_is_exact() {
        let mut left = PercentileAggregator::p50();
        left.update_batch(&[1.0, 2.0]).unwrap();
        let mut right = PercentileAggregator::p50();
        right.update_batch(&[3.0, 4.0, 5.0]).unwrap();

        left.merge(right.accumulator()).unwrap();
        assert_eq!(left.count(), 5);
        assert_eq!(left.finalize().unwrap(), 3.0);
    }

    #[test]
    fn test_merge_large_stays_bounded() {
        let mut left = PercentileAggregator::p50();
        let mut right = PercentileAggregator::p50();
        for i in 0..2_000 {
            left.update(i as f64).unwrap();
            right.update((i + 2_000) as f64).unwrap();
        }
        left.merge(right.accumulator()).unwrap();
        assert_eq!(left.count(), 4_000);
        assert_eq!(left.accumulator().samples.len(), RESERVOIR_CAPACITY);
        assert_abs_diff_eq!(left.finalize().unwrap(), 2_000.0, epsilon = 400.0);
    }
}
