//! Filter chain

use crate::config::FilterDef;
use crate::error::{StageError, StageResult, ValidationError, ValidationResult};
use crate::expr::CompiledExpr;
use stream_analytics_types::Event;
use tracing::trace;

#[derive(Debug, Clone)]
struct CompiledFilter {
    name: String,
    condition: CompiledExpr,
}

/// Ordered predicates; an event passes only if every condition is true
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<CompiledFilter>,
    passed: u64,
    rejected: u64,
}

impl FilterChain {
    pub fn new(defs: &[FilterDef]) -> ValidationResult<Self> {
        let filters = defs
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let condition = CompiledExpr::parse(&def.condition).map_err(|source| {
                    ValidationError::Expression {
                        path: format!("filters[{}].condition", i),
                        source,
                    }
                })?;
                Ok(CompiledFilter {
                    name: def.name.clone(),
                    condition,
                })
            })
            .collect::<ValidationResult<Vec<_>>>()?;

        Ok(Self {
            filters,
            passed: 0,
            rejected: 0,
        })
    }

    /// `Ok(true)` when the event passes every filter
    pub fn apply(&mut self, event: &Event) -> StageResult<bool> {
        for filter in &self.filters {
            let admitted = filter
                .condition
                .evaluate_condition(event)
                .map_err(|e| StageError::Filter {
                    name: filter.name.clone(),
                    reason: e.to_string(),
                })?;
            if !admitted {
                trace!(event_id = %event.id, filter = %filter.name, "Event rejected by filter");
                self.rejected += 1;
                return Ok(false);
            }
        }
        self.passed += 1;
        Ok(true)
    }

    pub fn passed(&self) -> u64 {
        self.passed
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain(conditions: &[&str]) -> FilterChain {
        let defs: Vec<FilterDef> = conditions
            .iter()
            .enumerate()
            .map(|(i, c)| FilterDef {
                name: format!("f{}", i),
                condition: c.to_string(),
            })
            .collect();
        FilterChain::new(&defs).unwrap()
    }

    #[test]
    fn test_all_filters_must_pass() {
        let mut chain = chain(&["amount > 10", "country in ['DE', 'FR']"]);

        assert!(chain.apply(&Event::at_millis(json!({"amount": 20, "country": "DE"}), 0)).unwrap());
        assert!(!chain.apply(&Event::at_millis(json!({"amount": 20, "country": "US"}), 0)).unwrap());
        assert!(!chain.apply(&Event::at_millis(json!({"amount": 5, "country": "DE"}), 0)).unwrap());
        assert_eq!(chain.passed(), 1);
        assert_eq!(chain.rejected(), 2);
    }

    #[test]
    fn test_null_condition_rejects() {
        let mut chain = chain(&["missing > 1"]);
        assert!(!chain.apply(&Event::at_millis(json!({}), 0)).unwrap());
    }

    #[test]
    fn test_non_boolean_condition_is_stage_error() {
        let mut chain = chain(&["amount * 2"]);
        let err = chain
            .apply(&Event::at_millis(json!({"amount": 3}), 0))
            .unwrap_err();
        assert!(matches!(err, StageError::Filter { ref name, .. } if name == "f0"));
    }

    #[test]
    fn test_invalid_expression_rejected_up_front() {
        let defs = vec![FilterDef {
            name: "bad".to_string(),
            condition: "amount >".to_string(),
        }];
        assert!(matches!(
            FilterChain::new(&defs),
            Err(ValidationError::Expression { .. })
        ));
    }
}
