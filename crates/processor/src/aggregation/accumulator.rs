//! Per-window aggregate state
//!
//! An [`AggregationPlan`] is compiled from the `(field, function, output)`
//! triples of one aggregation. Each open window holds one
//! [`FieldAccumulator`] per output field; the plan feeds events into them and
//! reads the current outputs back.

use super::{
    Aggregator, AverageAggregator, CountAggregator, DistinctAggregator, FirstAggregator,
    LastAggregator, MaxAggregator, MinAggregator, PercentileAggregator,
    StandardDeviationAggregator, SumAggregator, TimedValue,
};
use crate::config::{AggregateFunction, AggregationSpec};
use crate::error::{AggregationError, AggregationResult};
use crate::expr::number;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use stream_analytics_types::Event;

/// Running state of one aggregate function
///
/// Externally tagged so checkpoints can be written with bincode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Accumulator {
    Count(CountAggregator),
    Sum(SumAggregator),
    Avg(AverageAggregator),
    Min(MinAggregator),
    Max(MaxAggregator),
    StdDev(StandardDeviationAggregator),
    Variance(StandardDeviationAggregator),
    Distinct(DistinctAggregator),
    Percentile(PercentileAggregator),
    First(FirstAggregator),
    Last(LastAggregator),
}

impl Accumulator {
    pub fn for_function(
        function: AggregateFunction,
        percentile: Option<f64>,
    ) -> AggregationResult<Self> {
        Ok(match function {
            AggregateFunction::Count => Self::Count(CountAggregator::new()),
            AggregateFunction::Sum => Self::Sum(SumAggregator::new()),
            AggregateFunction::Avg => Self::Avg(AverageAggregator::new()),
            AggregateFunction::Min => Self::Min(MinAggregator::new()),
            AggregateFunction::Max => Self::Max(MaxAggregator::new()),
            AggregateFunction::Stddev => Self::StdDev(StandardDeviationAggregator::new()),
            AggregateFunction::Variance => Self::Variance(StandardDeviationAggregator::new()),
            AggregateFunction::Distinct => Self::Distinct(DistinctAggregator::new()),
            AggregateFunction::Percentile => {
                let p = percentile.unwrap_or(50.0);
                let agg = PercentileAggregator::with_percentile(p)
                    .map_err(|_| AggregationError::InvalidPercentile { percentile: p })?;
                Self::Percentile(agg)
            }
            AggregateFunction::First => Self::First(FirstAggregator::new()),
            AggregateFunction::Last => Self::Last(LastAggregator::new()),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Sum(_) => "sum",
            Self::Avg(_) => "avg",
            Self::Min(_) => "min",
            Self::Max(_) => "max",
            Self::StdDev(_) => "stddev",
            Self::Variance(_) => "variance",
            Self::Distinct(_) => "distinct",
            Self::Percentile(_) => "percentile",
            Self::First(_) => "first",
            Self::Last(_) => "last",
        }
    }

    /// Feed one non-null value; returns `false` when the value was skipped
    /// because a numeric function could not read it as a number
    pub fn update(&mut self, value: &Value, event_time_ms: i64) -> AggregationResult<bool> {
        let kind = self.kind();
        let result = match self {
            Self::Count(agg) => agg.update(()),
            Self::Distinct(agg) => agg.update(distinct_key(value)),
            Self::First(agg) => agg.update(timed(value, event_time_ms)),
            Self::Last(agg) => agg.update(timed(value, event_time_ms)),
            numeric => {
                let Some(x) = numeric_value(value) else {
                    return Ok(false);
                };
                match numeric {
                    Self::Sum(agg) => agg.update(x),
                    Self::Avg(agg) => agg.update(x),
                    Self::Min(agg) => agg.update(x),
                    Self::Max(agg) => agg.update(x),
                    Self::StdDev(agg) | Self::Variance(agg) => agg.update(x),
                    Self::Percentile(agg) => agg.update(x),
                    _ => Ok(()),
                }
            }
        };
        result.map_err(|e| corrupted(kind, e))?;
        Ok(true)
    }

    /// Current output value; `null` when the function has no result yet
    pub fn output(&self) -> Value {
        match self {
            Self::Count(agg) => agg.finalize().map(Value::from).unwrap_or(Value::Null),
            Self::Sum(agg) => agg.finalize().map(number).unwrap_or(Value::Null),
            Self::Avg(agg) => agg.finalize().map(number).unwrap_or(Value::Null),
            Self::Min(agg) => agg.finalize().map(number).unwrap_or(Value::Null),
            Self::Max(agg) => agg.finalize().map(number).unwrap_or(Value::Null),
            Self::StdDev(agg) => agg.finalize().map(number).unwrap_or(Value::Null),
            Self::Variance(agg) => agg.variance().map(number).unwrap_or(Value::Null),
            Self::Distinct(agg) => agg.finalize().map(Value::from).unwrap_or(Value::Null),
            Self::Percentile(agg) => agg.finalize().map(number).unwrap_or(Value::Null),
            Self::First(agg) => json_output(agg.finalize()),
            Self::Last(agg) => json_output(agg.finalize()),
        }
    }

    /// Merge another accumulator of the same kind into this one
    pub fn merge(&mut self, other: &Accumulator) -> AggregationResult<()> {
        let kind = self.kind();
        let result = match (self, other) {
            (Self::Count(a), Self::Count(b)) => a.merge(b.accumulator()),
            (Self::Sum(a), Self::Sum(b)) => a.merge(b.accumulator()),
            (Self::Avg(a), Self::Avg(b)) => a.merge(b.accumulator()),
            (Self::Min(a), Self::Min(b)) => a.merge(b.accumulator()),
            (Self::Max(a), Self::Max(b)) => a.merge(b.accumulator()),
            (Self::StdDev(a), Self::StdDev(b)) => a.merge(b.accumulator()),
            (Self::Variance(a), Self::Variance(b)) => a.merge(b.accumulator()),
            (Self::Distinct(a), Self::Distinct(b)) => a.merge(b.accumulator()),
            (Self::Percentile(a), Self::Percentile(b)) => a.merge(b.accumulator()),
            (Self::First(a), Self::First(b)) => a.merge(b.accumulator()),
            (Self::Last(a), Self::Last(b)) => a.merge(b.accumulator()),
            (_, other) => {
                return Err(AggregationError::IncompatibleMerge {
                    left: kind.to_string(),
                    right: other.kind().to_string(),
                })
            }
        };
        result.map_err(|e| corrupted(kind, e))
    }

    /// Values accepted so far
    pub fn count(&self) -> u64 {
        match self {
            Self::Count(agg) => agg.count(),
            Self::Sum(agg) => agg.count(),
            Self::Avg(agg) => agg.count(),
            Self::Min(agg) => agg.count(),
            Self::Max(agg) => agg.count(),
            Self::StdDev(agg) | Self::Variance(agg) => agg.count(),
            Self::Distinct(agg) => agg.count(),
            Self::Percentile(agg) => agg.count(),
            Self::First(agg) => agg.count(),
            Self::Last(agg) => agg.count(),
        }
    }
}

fn corrupted(kind: &str, err: anyhow::Error) -> AggregationError {
    AggregationError::CorruptedState {
        aggregation_type: kind.to_string(),
        details: err.to_string(),
    }
}

fn distinct_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn timed(value: &Value, event_time_ms: i64) -> TimedValue {
    TimedValue {
        event_time_ms,
        json: value.to_string(),
    }
}

fn json_output(result: anyhow::Result<String>) -> Value {
    result
        .ok()
        .and_then(|json| serde_json::from_str(&json).ok())
        .unwrap_or(Value::Null)
}

/// Numeric reading of a value: numbers, and strings that parse as finite numbers
pub fn numeric_value(value: &Value) -> Option<f64> {
    let x = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    x.is_finite().then_some(x)
}

/// Accumulator for one output field plus the number of values it skipped
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldAccumulator {
    pub accumulator: Accumulator,
    pub skipped: u64,
}

/// Output field name to its accumulator
pub type AccumulatorMap = BTreeMap<String, FieldAccumulator>;

#[derive(Debug, Clone)]
struct AggregateColumn {
    output: String,
    field: String,
    function: AggregateFunction,
    percentile: Option<f64>,
}

/// Compiled `(field, function, output)` triples of one aggregation
#[derive(Debug, Clone)]
pub struct AggregationPlan {
    columns: Vec<AggregateColumn>,
}

impl AggregationPlan {
    pub fn from_spec(spec: &AggregationSpec) -> AggregationResult<Self> {
        let columns = spec
            .functions
            .iter()
            .map(|def| {
                // Fail early on bad parameters rather than on the first event
                Accumulator::for_function(def.function, def.percentile)?;
                Ok(AggregateColumn {
                    output: def.output_field(),
                    field: def.field.clone(),
                    function: def.function,
                    percentile: def.percentile,
                })
            })
            .collect::<AggregationResult<Vec<_>>>()?;
        Ok(Self { columns })
    }

    /// Fresh accumulators for a newly opened window
    pub fn new_state(&self) -> AccumulatorMap {
        self.columns
            .iter()
            .filter_map(|c| {
                Accumulator::for_function(c.function, c.percentile)
                    .ok()
                    .map(|accumulator| {
                        (
                            c.output.clone(),
                            FieldAccumulator {
                                accumulator,
                                skipped: 0,
                            },
                        )
                    })
            })
            .collect()
    }

    /// Apply one event to a window's accumulators
    ///
    /// Null and missing fields are skipped per column; other columns are
    /// unaffected.
    pub fn update(&self, state: &mut AccumulatorMap, event: &Event) -> AggregationResult<()> {
        let event_time_ms = event.event_time_ms();
        for column in &self.columns {
            let Some(slot) = state.get_mut(&column.output) else {
                return Err(AggregationError::CorruptedState {
                    aggregation_type: column.function.name().to_string(),
                    details: format!("no accumulator for output '{}'", column.output),
                });
            };

            if column.field == "*" {
                slot.accumulator.update(&Value::Bool(true), event_time_ms)?;
                continue;
            }

            let Some(value) = event.field(&column.field) else {
                continue;
            };
            if !slot.accumulator.update(value, event_time_ms)? {
                slot.skipped += 1;
            }
        }
        Ok(())
    }

    /// Number of output columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Current output values of a window
pub fn outputs(state: &AccumulatorMap) -> BTreeMap<String, Value> {
    state
        .iter()
        .map(|(output, slot)| (output.clone(), slot.accumulator.output()))
        .collect()
}

/// Merge the accumulators of `from` into `into`
pub fn merge_states(into: &mut AccumulatorMap, from: &AccumulatorMap) -> AggregationResult<()> {
    for (output, other) in from {
        match into.get_mut(output) {
            Some(slot) => {
                slot.accumulator.merge(&other.accumulator)?;
                slot.skipped += other.skipped;
            }
            None => {
                into.insert(output.clone(), other.clone());
            }
        }
    }
    Ok(())
}
