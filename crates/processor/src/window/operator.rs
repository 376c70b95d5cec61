//! Window operator
//!
//! Applies events to the windows of every aggregation of a stream: late
//! check against the watermark, window assignment, incremental aggregation
//! and early triggers. Completed windows leave the store as
//! [`FiredWindow`]s; nothing here talks to sinks.

use super::assigner::{assigner_for, group_key, WindowAssigner};
use super::store::{StoreSnapshot, Tombstones, WindowState, WindowStore};
use super::trigger::{TriggerContext, TriggerResult, TriggerSet};
use super::types::{WindowBounds, WindowKey};
use crate::aggregation::AggregationPlan;
use crate::config::{AggregationSpec, WindowKind};
use crate::error::{AggregationResult, Result};
use crate::watermark::Watermark;
use std::collections::HashMap;
use stream_analytics_types::{CompletionReason, Event};
use tracing::{debug, trace};

/// A window removed from the store, ready to be emitted
#[derive(Debug, Clone, PartialEq)]
pub struct FiredWindow {
    pub state: WindowState,
    pub reason: CompletionReason,
}

/// What happened to one event across all aggregations
#[derive(Debug, Default)]
pub struct AssignOutcome {
    /// Window updates applied
    pub assigned: u64,
    /// Window assignments rejected because the window had completed
    pub dropped_late: u64,
    /// Window assignments behind the watermark but within lateness
    pub accepted_late: u64,
    /// Windows completed early by a trigger
    pub fired: Vec<FiredWindow>,
}

#[derive(Debug)]
struct CompiledAggregation {
    id: String,
    group_by: Vec<String>,
    kind: WindowKind,
    lateness_ms: i64,
    plan: AggregationPlan,
    assigner: Box<dyn WindowAssigner>,
    triggers: TriggerSet,
}

impl CompiledAggregation {
    fn compile(spec: &AggregationSpec) -> Result<Self> {
        Ok(Self {
            id: spec.id.clone(),
            group_by: spec.group_by.clone(),
            kind: spec.window.kind,
            lateness_ms: i64::try_from(spec.window.allowed_lateness_ms).unwrap_or(i64::MAX),
            plan: AggregationPlan::from_spec(spec)?,
            assigner: assigner_for(&spec.window)?,
            triggers: TriggerSet::from_defs(&spec.triggers)?,
        })
    }

    fn is_late(&self, bounds: &WindowBounds, watermark: Watermark) -> bool {
        !bounds.is_global() && bounds.completion_time(self.lateness_ms) <= watermark.timestamp
    }
}

/// Window assignment and aggregation for one stream
#[derive(Debug)]
pub struct WindowOperator {
    aggregations: Vec<CompiledAggregation>,
    by_id: HashMap<String, usize>,
    store: WindowStore,
}

impl WindowOperator {
    pub fn new(specs: &[AggregationSpec]) -> Result<Self> {
        let aggregations = specs
            .iter()
            .map(CompiledAggregation::compile)
            .collect::<Result<Vec<_>>>()?;
        let by_id = aggregations
            .iter()
            .enumerate()
            .map(|(i, agg)| (agg.id.clone(), i))
            .collect();
        Ok(Self {
            aggregations,
            by_id,
            store: WindowStore::new(),
        })
    }

    pub fn store(&self) -> &WindowStore {
        &self.store
    }

    pub fn open_windows(&self) -> usize {
        self.store.open_windows()
    }

    /// Apply one event; `watermark` is the watermark before its batch
    pub fn process(
        &mut self,
        event: &Event,
        watermark: Watermark,
        now_ms: i64,
    ) -> AggregationResult<AssignOutcome> {
        let mut outcome = AssignOutcome::default();
        let t = event.event_time_ms();

        for agg in &self.aggregations {
            let group = group_key(event, &agg.group_by);

            let targets: Vec<WindowKey> = match agg.kind {
                WindowKind::Tumbling | WindowKind::Sliding => {
                    let mut keys = Vec::with_capacity(agg.assigner.max_windows_per_event());
                    for bounds in agg.assigner.assign_windows(t) {
                        let key = WindowKey::new(&agg.id, &group.encoded, bounds.start);
                        if agg.is_late(&bounds, watermark) || self.store.is_tombstoned(&key) {
                            outcome.dropped_late += 1;
                            continue;
                        }
                        self.store
                            .get_or_open(key.clone(), bounds, &group.values, &agg.plan, now_ms);
                        keys.push(key);
                    }
                    keys
                }
                WindowKind::Session => {
                    let Some(proposed) = agg.assigner.assign_windows(t).into_iter().next() else {
                        continue;
                    };
                    let joins_open = !self
                        .store
                        .touching_sessions(&agg.id, &group.encoded, proposed)
                        .is_empty();
                    if !joins_open && agg.is_late(&proposed, watermark) {
                        outcome.dropped_late += 1;
                        continue;
                    }
                    vec![self.store.merge_sessions(
                        &agg.id,
                        &group.encoded,
                        proposed,
                        &group.values,
                        &agg.plan,
                        now_ms,
                    )?]
                }
                WindowKind::Global => vec![self.store.global_pane(
                    &agg.id,
                    &group.encoded,
                    t,
                    &group.values,
                    &agg.plan,
                    now_ms,
                )],
            };

            for key in targets {
                if watermark.is_after(t) {
                    outcome.accepted_late += 1;
                }
                let state = self.store.update(&key, &agg.plan, event)?;
                outcome.assigned += 1;
                trace!(window = %key, members = state.member_count, "Updated window");

                if agg.triggers.is_empty() {
                    continue;
                }
                let decision = agg.triggers.on_element(&TriggerContext {
                    window: state,
                    now_ms,
                });
                if let TriggerResult::Fire(reason) = decision {
                    if let Some(fired) = Self::fire(&mut self.store, agg, &key, reason) {
                        outcome.fired.push(fired);
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Fire processing-time triggers
    pub fn on_processing_time(&mut self, now_ms: i64) -> Vec<FiredWindow> {
        let due: Vec<(WindowKey, CompletionReason)> = self
            .store
            .keys()
            .filter_map(|key| {
                let agg = self.aggregation(&key.aggregation_id)?;
                if agg.triggers.is_empty() {
                    return None;
                }
                let window = self.store.get(key)?;
                match agg.triggers.on_processing_time(&TriggerContext { window, now_ms }) {
                    TriggerResult::Fire(reason) => Some((key.clone(), reason)),
                    TriggerResult::Continue => None,
                }
            })
            .collect();

        let mut fired = Vec::with_capacity(due.len());
        for (key, reason) in due {
            let Some(&index) = self.by_id.get(&key.aggregation_id) else {
                continue;
            };
            if let Some(window) = Self::fire(&mut self.store, &self.aggregations[index], &key, reason) {
                fired.push(window);
            }
        }
        fired
    }

    /// Complete every bounded window the watermark has passed
    pub fn on_watermark(&mut self, watermark: Watermark) -> Vec<FiredWindow> {
        let lateness: HashMap<&str, i64> = self
            .aggregations
            .iter()
            .map(|agg| (agg.id.as_str(), agg.lateness_ms))
            .collect();
        let completed = self.store.take_completed(watermark.timestamp, |id| {
            lateness.get(id).copied().unwrap_or(0)
        });
        if !completed.is_empty() {
            debug!(
                watermark = %watermark,
                windows = completed.len(),
                "Completed windows on watermark"
            );
        }
        completed
            .into_iter()
            .map(|state| FiredWindow {
                state,
                reason: CompletionReason::Watermark,
            })
            .collect()
    }

    /// Complete every open window, for a stopping job
    pub fn flush(&mut self) -> Vec<FiredWindow> {
        self.store
            .drain_all()
            .into_iter()
            .map(|state| FiredWindow {
                state,
                reason: CompletionReason::Shutdown,
            })
            .collect()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.store.snapshot()
    }

    pub fn restore(&mut self, states: Vec<WindowState>, tombstones: Tombstones) {
        self.store.restore(states, tombstones);
    }

    fn aggregation(&self, id: &str) -> Option<&CompiledAggregation> {
        self.by_id.get(id).map(|&i| &self.aggregations[i])
    }

    fn fire(
        store: &mut WindowStore,
        agg: &CompiledAggregation,
        key: &WindowKey,
        reason: CompletionReason,
    ) -> Option<FiredWindow> {
        let state = store.take(key)?;
        // Session and global windows reopen on the next event; fixed windows
        // stay closed until the watermark passes them
        if matches!(agg.kind, WindowKind::Tumbling | WindowKind::Sliding) {
            store.tombstone(key.clone(), state.bounds.completion_time(agg.lateness_ms));
        }
        debug!(window = %key, reason = reason.name(), "Window fired early");
        Some(FiredWindow { state, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregateDef, AggregateFunction, TriggerDef, WindowSpec};
    use serde_json::json;

    fn count_spec(window: WindowSpec, triggers: Vec<TriggerDef>) -> AggregationSpec {
        AggregationSpec {
            id: "counts".to_string(),
            group_by: vec!["user".to_string()],
            window,
            functions: vec![AggregateDef::new("*", AggregateFunction::Count, "count")],
            triggers,
        }
    }

    fn event(t: i64) -> Event {
        Event::at_millis(json!({ "user": "a" }), t)
    }

    #[test]
    fn test_tumbling_counts_complete_on_watermark() {
        let mut op = WindowOperator::new(&[count_spec(WindowSpec::tumbling(60_000), vec![])]).unwrap();
        for t in [0, 10_000, 30_000, 59_000, 61_000] {
            op.process(&event(t), Watermark::min(), 0).unwrap();
        }
        assert_eq!(op.open_windows(), 2);

        let fired = op.on_watermark(Watermark::new(60_000));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state.member_count, 4);
        assert_eq!(fired[0].reason, CompletionReason::Watermark);

        let rest = op.flush();
        assert_eq!(rest[0].state.outputs()["count"], json!(1));
        assert_eq!(rest[0].reason, CompletionReason::Shutdown);
    }

    #[test]
    fn test_late_event_never_reopens_completed_window() {
        let window = WindowSpec::tumbling(60_000).with_allowed_lateness(5_000);
        let mut op = WindowOperator::new(&[count_spec(window, vec![])]).unwrap();

        op.process(&event(59_000), Watermark::min(), 0).unwrap();
        assert_eq!(op.on_watermark(Watermark::new(66_000)).len(), 1);

        let outcome = op.process(&event(58_000), Watermark::new(66_000), 0).unwrap();
        assert_eq!(outcome.dropped_late, 1);
        assert_eq!(outcome.assigned, 0);
        assert_eq!(op.open_windows(), 0);
    }

    #[test]
    fn test_event_within_lateness_is_accepted() {
        let window = WindowSpec::tumbling(60_000).with_allowed_lateness(5_000);
        let mut op = WindowOperator::new(&[count_spec(window, vec![])]).unwrap();

        let outcome = op.process(&event(58_000), Watermark::new(62_000), 0).unwrap();
        assert_eq!(outcome.accepted_late, 1);
        assert_eq!(outcome.assigned, 1);
    }

    #[test]
    fn test_count_trigger_fires_and_tombstones() {
        let spec = count_spec(WindowSpec::tumbling(60_000), vec![TriggerDef::Count { count: 2 }]);
        let mut op = WindowOperator::new(&[spec]).unwrap();

        assert!(op.process(&event(1_000), Watermark::min(), 0).unwrap().fired.is_empty());
        let outcome = op.process(&event(2_000), Watermark::min(), 0).unwrap();
        assert_eq!(outcome.fired.len(), 1);
        assert_eq!(outcome.fired[0].reason, CompletionReason::Count);

        // Same window again: counted late, not reopened
        let outcome = op.process(&event(3_000), Watermark::min(), 0).unwrap();
        assert_eq!(outcome.dropped_late, 1);
        assert_eq!(op.open_windows(), 0);
    }

    #[test]
    fn test_global_pane_reopens_after_trigger() {
        let spec = count_spec(WindowSpec::global(), vec![TriggerDef::Count { count: 3 }]);
        let mut op = WindowOperator::new(&[spec]).unwrap();

        let mut fired = Vec::new();
        for t in 0..7 {
            fired.extend(op.process(&event(t), Watermark::min(), 0).unwrap().fired);
        }
        assert_eq!(fired.len(), 2);
        assert!(fired.iter().all(|w| w.state.member_count == 3));
        assert_eq!(op.open_windows(), 1);
        assert!(op.on_watermark(Watermark::new(i64::MAX - 1)).is_empty());
    }

    #[test]
    fn test_processing_time_trigger() {
        let spec = count_spec(WindowSpec::global(), vec![TriggerDef::Time { after_ms: 1_000 }]);
        let mut op = WindowOperator::new(&[spec]).unwrap();
        op.process(&event(5), Watermark::min(), 10_000).unwrap();

        assert!(op.on_processing_time(10_999).is_empty());
        let fired = op.on_processing_time(11_000);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].reason, CompletionReason::Time);
    }

    #[test]
    fn test_session_joins_open_session_behind_watermark() {
        let mut op = WindowOperator::new(&[count_spec(WindowSpec::session(10_000), vec![])]).unwrap();
        op.process(&event(0), Watermark::min(), 0).unwrap();
        op.process(&event(8_000), Watermark::min(), 0).unwrap();

        // Proposal [2000, 12000) is behind the watermark but the session [0, 18000) is open
        let outcome = op.process(&event(2_000), Watermark::new(15_000), 0).unwrap();
        assert_eq!(outcome.assigned, 1);
        assert_eq!(outcome.dropped_late, 0);

        let fired = op.on_watermark(Watermark::new(18_000));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].state.member_count, 3);
        assert_eq!(fired[0].state.bounds, WindowBounds::new(0, 18_000));
    }
}
