//! Window triggers
//!
//! Early completion strategies evaluated against a window's current state.
//! Watermark completion is not a trigger; the store handles it for every
//! bounded window.

use super::store::WindowState;
use crate::config::TriggerDef;
use crate::expr::{CompiledExpr, ExprResult};
use serde_json::{Map, Value};
use std::fmt;
use stream_analytics_types::CompletionReason;

/// Result of trigger evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    /// Continue processing, don't fire
    Continue,
    /// Complete the window and emit its result
    Fire(CompletionReason),
}

impl TriggerResult {
    pub fn is_fire(&self) -> bool {
        matches!(self, Self::Fire(_))
    }
}

/// Context provided to triggers for evaluation
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext<'a> {
    pub window: &'a WindowState,
    /// Current processing time, epoch ms
    pub now_ms: i64,
}

/// Trait for window triggers
pub trait WindowTrigger: Send + Sync + fmt::Debug {
    /// Evaluate after an element was added to the window
    fn on_element(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        let _ = ctx;
        TriggerResult::Continue
    }

    /// Evaluate on a processing-time tick
    fn on_processing_time(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        let _ = ctx;
        TriggerResult::Continue
    }
}

/// Fires once the window holds `threshold` members
#[derive(Debug, Clone)]
pub struct CountTrigger {
    threshold: u64,
}

impl CountTrigger {
    pub fn new(threshold: u64) -> Self {
        assert!(threshold > 0, "Count threshold must be positive");
        Self { threshold }
    }
}

impl WindowTrigger for CountTrigger {
    fn on_element(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        if ctx.window.member_count >= self.threshold {
            TriggerResult::Fire(CompletionReason::Count)
        } else {
            TriggerResult::Continue
        }
    }
}

/// Fires once member payloads reach `bytes`
#[derive(Debug, Clone)]
pub struct SizeTrigger {
    bytes: u64,
}

impl SizeTrigger {
    pub fn new(bytes: u64) -> Self {
        assert!(bytes > 0, "Size threshold must be positive");
        Self { bytes }
    }
}

impl WindowTrigger for SizeTrigger {
    fn on_element(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        if ctx.window.byte_size >= self.bytes {
            TriggerResult::Fire(CompletionReason::Size)
        } else {
            TriggerResult::Continue
        }
    }
}

/// Fires a fixed processing-time delay after the window opened
#[derive(Debug, Clone)]
pub struct ProcessingTimeTrigger {
    delay_ms: i64,
}

impl ProcessingTimeTrigger {
    pub fn with_delay_ms(delay_ms: u64) -> Self {
        Self {
            delay_ms: i64::try_from(delay_ms).unwrap_or(i64::MAX),
        }
    }

    fn check(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        if ctx.now_ms.saturating_sub(ctx.window.opened_at_ms) >= self.delay_ms {
            TriggerResult::Fire(CompletionReason::Time)
        } else {
            TriggerResult::Continue
        }
    }
}

impl WindowTrigger for ProcessingTimeTrigger {
    fn on_element(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        self.check(ctx)
    }

    fn on_processing_time(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        self.check(ctx)
    }
}

/// Fires when an expression over the window outputs and `member_count` holds
#[derive(Debug, Clone)]
pub struct ExpressionTrigger {
    expression: CompiledExpr,
}

impl ExpressionTrigger {
    pub fn new(expression: CompiledExpr) -> Self {
        Self { expression }
    }

    fn evaluate(&self, window: &WindowState) -> ExprResult<bool> {
        let mut context: Map<String, Value> = window.outputs().into_iter().collect();
        context.insert("member_count".to_string(), Value::from(window.member_count));
        self.expression.evaluate_condition(&context)
    }
}

impl WindowTrigger for ExpressionTrigger {
    fn on_element(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        match self.evaluate(ctx.window) {
            Ok(true) => TriggerResult::Fire(CompletionReason::Custom),
            Ok(false) => TriggerResult::Continue,
            Err(e) => {
                tracing::debug!(
                    window = %ctx.window.key,
                    expression = %self.expression,
                    error = %e,
                    "Custom trigger evaluation failed"
                );
                TriggerResult::Continue
            }
        }
    }
}

/// All triggers of one aggregation; the first to fire wins
#[derive(Debug, Default)]
pub struct TriggerSet {
    triggers: Vec<Box<dyn WindowTrigger>>,
}

impl TriggerSet {
    pub fn new(triggers: Vec<Box<dyn WindowTrigger>>) -> Self {
        Self { triggers }
    }

    /// Build from validated definitions
    pub fn from_defs(defs: &[TriggerDef]) -> ExprResult<Self> {
        let mut triggers: Vec<Box<dyn WindowTrigger>> = Vec::with_capacity(defs.len());
        for def in defs {
            match def {
                TriggerDef::Count { count } => triggers.push(Box::new(CountTrigger::new(*count))),
                TriggerDef::Size { bytes } => triggers.push(Box::new(SizeTrigger::new(*bytes))),
                TriggerDef::Time { after_ms } => {
                    triggers.push(Box::new(ProcessingTimeTrigger::with_delay_ms(*after_ms)))
                }
                TriggerDef::Custom { expression } => triggers.push(Box::new(
                    ExpressionTrigger::new(CompiledExpr::parse(expression)?),
                )),
            }
        }
        Ok(Self { triggers })
    }

    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    pub fn on_element(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        self.first_fire(|t| t.on_element(ctx))
    }

    pub fn on_processing_time(&self, ctx: &TriggerContext<'_>) -> TriggerResult {
        self.first_fire(|t| t.on_processing_time(ctx))
    }

    fn first_fire<F>(&self, f: F) -> TriggerResult
    where
        F: Fn(&dyn WindowTrigger) -> TriggerResult,
    {
        self.triggers
            .iter()
            .map(|t| f(t.as_ref()))
            .find(TriggerResult::is_fire)
            .unwrap_or(TriggerResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::AggregationPlan;
    use crate::config::{AggregateDef, AggregateFunction, AggregationSpec, WindowSpec};
    use crate::window::types::{WindowBounds, WindowKey};
    use serde_json::json;
    use stream_analytics_types::Event;

    fn window_with(values: &[f64]) -> WindowState {
        let plan = AggregationPlan::from_spec(&AggregationSpec {
            id: "a".to_string(),
            group_by: vec![],
            window: WindowSpec::global(),
            functions: vec![AggregateDef::new("v", AggregateFunction::Sum, "total")],
            triggers: vec![TriggerDef::Count { count: 1 }],
        })
        .unwrap();
        let mut state = WindowState::new(
            WindowKey::new("a", "", 0),
            WindowBounds::global(0),
            &Map::new(),
            &plan,
            1_000,
        );
        for v in values {
            let event = Event::at_millis(json!({ "v": v }), 0);
            plan.update(&mut state.accumulators, &event).unwrap();
            state.member_count += 1;
            state.byte_size += event.approx_size() as u64;
        }
        state
    }

    #[test]
    fn test_count_trigger() {
        let trigger = CountTrigger::new(3);
        let two = window_with(&[1.0, 2.0]);
        let three = window_with(&[1.0, 2.0, 3.0]);

        assert_eq!(
            trigger.on_element(&TriggerContext { window: &two, now_ms: 0 }),
            TriggerResult::Continue
        );
        assert_eq!(
            trigger.on_element(&TriggerContext { window: &three, now_ms: 0 }),
            TriggerResult::Fire(CompletionReason::Count)
        );
    }

    #[test]
    fn test_processing_time_trigger() {
        let trigger = ProcessingTimeTrigger::with_delay_ms(500);
        let window = window_with(&[1.0]);

        let early = TriggerContext { window: &window, now_ms: 1_499 };
        let late = TriggerContext { window: &window, now_ms: 1_500 };
        assert_eq!(trigger.on_processing_time(&early), TriggerResult::Continue);
        assert_eq!(
            trigger.on_processing_time(&late),
            TriggerResult::Fire(CompletionReason::Time)
        );
    }

    #[test]
    fn test_expression_trigger_over_outputs() {
        let set = TriggerSet::from_defs(&[TriggerDef::Custom {
            expression: "total > 10 and member_count >= 2".to_string(),
        }])
        .unwrap();

        let low = window_with(&[4.0, 5.0]);
        let high = window_with(&[4.0, 7.0]);
        assert_eq!(set.on_element(&TriggerContext { window: &low, now_ms: 0 }), TriggerResult::Continue);
        assert_eq!(
            set.on_element(&TriggerContext { window: &high, now_ms: 0 }),
            TriggerResult::Fire(CompletionReason::Custom)
        );
    }

    #[test]
    fn test_first_trigger_wins() {
        let set = TriggerSet::from_defs(&[
            TriggerDef::Size { bytes: 1 },
            TriggerDef::Count { count: 1 },
        ])
        .unwrap();
        let window = window_with(&[1.0]);
        assert_eq!(
            set.on_element(&TriggerContext { window: &window, now_ms: 0 }),
            TriggerResult::Fire(CompletionReason::Size)
        );
    }
}
