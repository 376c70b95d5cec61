use super::trait_::Aggregator;

use serde::{Deserialize, Serialize};

/// Accumulator for count aggregation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CountAccumulator {
    count: u64,
}

/// Count aggregator - counts window members
///
/// With field `*` every member is counted; otherwise only members whose
/// field is present and non-null reach the aggregator.
///
/// # Examples
///
/// ```
/// use processor::aggregation::{Aggregator, CountAggregator};
///
/// let mut agg = CountAggregator::new();
/// agg.update(()).unwrap();
/// agg.update(()).unwrap();
///
/// assert_eq!(agg.finalize().unwrap(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountAggregator {
    count: u64,
}

impl CountAggregator {
    /// Create a new count aggregator
    pub fn new() -> Self {
        Self::default()
    }
}

impl Aggregator for CountAggregator {
    type Input = ();
    type Output = u64;
    type Accumulator = CountAccumulator;

    fn new() -> Self {
        Self::new()
    }

    fn update(&mut self, _value: ()) -> anyhow::Result<()> {
        self.count += 1;
        Ok(())
    }

    fn finalize(&self) -> anyhow::Result<u64> {
        Ok(self.count)
    }

    fn accumulator(&self) -> CountAccumulator {
        CountAccumulator { count: self.count }
    }

    fn merge(&mut self, other: CountAccumulator) -> anyhow::Result<()> {
        self.count += other.count;
        Ok(())
    }

    fn reset(&mut self) {
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
    fn test_count_basic() {
        let mut agg = CountAggregator::new();
        assert!(agg.is_empty());
        agg.update_batch(&[(), (), ()]).unwrap();
        assert_eq!(agg.finalize().unwrap(), 3);
    }

    #[test]
    fn test_count_merge_and_reset() {
        let mut agg1 = CountAggregator::new();
        agg1.update(()).unwrap();
        let mut agg2 = CountAggregator::new();
        agg2.update_batch(&[(), ()]).unwrap();

        agg1.merge(agg2.accumulator()).unwrap();
        assert_eq!(agg1.count(), 3);

        agg1.reset();
        assert_eq!(agg1.finalize().unwrap(), 0);
    }
}
