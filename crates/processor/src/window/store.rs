//! Window store
//!
//! In-flight window state keyed by [`WindowKey`]. States are held behind
//! `Arc` and mutated through `Arc::make_mut`, so [`WindowStore::snapshot`]
//! only copies references: a state touched after the snapshot is cloned on
//! first write and the snapshot keeps the old version.

use super::types::{WindowBounds, WindowKey};
use crate::aggregation::{merge_states, outputs, AccumulatorMap, AggregationPlan};
use crate::error::{AggregationError, AggregationResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use stream_analytics_types::{CompletionReason, Event, StreamId, WindowResult};

/// State of one in-flight window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowState {
    pub key: WindowKey,
    pub bounds: WindowBounds,
    /// Group-by values as JSON text, by field name
    pub group: BTreeMap<String, String>,
    pub member_count: u64,
    /// Approximate payload bytes of all members
    pub byte_size: u64,
    pub accumulators: AccumulatorMap,
    /// Processing time the window was opened at, epoch ms
    pub opened_at_ms: i64,
    pub completed: bool,
}

impl WindowState {
    pub fn new(
        key: WindowKey,
        bounds: WindowBounds,
        group: &Map<String, Value>,
        plan: &AggregationPlan,
        now_ms: i64,
    ) -> Self {
        Self {
            key,
            bounds,
            group: group
                .iter()
                .map(|(field, value)| (field.clone(), value.to_string()))
                .collect(),
            member_count: 0,
            byte_size: 0,
            accumulators: plan.new_state(),
            opened_at_ms: now_ms,
            completed: false,
        }
    }

    pub fn window_end(&self) -> i64 {
        self.bounds.end
    }

    /// Current aggregate outputs
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        outputs(&self.accumulators)
    }

    /// Group-by values decoded back to JSON
    pub fn group_values(&self) -> Map<String, Value> {
        self.group
            .iter()
            .map(|(field, json)| {
                let value = serde_json::from_str(json).unwrap_or(Value::Null);
                (field.clone(), value)
            })
            .collect()
    }

    /// Immutable result handed to the output dispatcher
    pub fn to_result(&self, stream_id: &StreamId, reason: CompletionReason) -> WindowResult {
        WindowResult {
            stream_id: stream_id.clone(),
            aggregation_id: self.key.aggregation_id.clone(),
            group_key: self.key.group_key.clone(),
            group: self.group_values(),
            window_start: self.bounds.start_time(),
            window_end: self.bounds.end_time(),
            member_count: self.member_count,
            values: self.outputs(),
            reason,
            emitted_at: chrono::Utc::now(),
        }
    }

    fn absorb(&mut self, other: &WindowState) -> AggregationResult<()> {
        merge_states(&mut self.accumulators, &other.accumulators)?;
        self.member_count += other.member_count;
        self.byte_size += other.byte_size;
        self.opened_at_ms = self.opened_at_ms.min(other.opened_at_ms);
        self.bounds = self.bounds.merge(&other.bounds);
        Ok(())
    }
}

/// Keys completed early, remembered until the watermark passes this time
pub type Tombstones = BTreeMap<WindowKey, i64>;

/// Point-in-time view of a store
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub windows: BTreeMap<WindowKey, Arc<WindowState>>,
    pub tombstones: Tombstones,
}

impl StoreSnapshot {
    /// Owned copies of the captured states
    pub fn states(&self) -> Vec<WindowState> {
        self.windows.values().map(|s| s.as_ref().clone()).collect()
    }
}

#[derive(Debug, Default)]
pub struct WindowStore {
    windows: BTreeMap<WindowKey, Arc<WindowState>>,
    tombstones: Tombstones,
}

impl WindowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open state for a tumbling or sliding window, or return the open one
    pub fn get_or_open(
        &mut self,
        key: WindowKey,
        bounds: WindowBounds,
        group: &Map<String, Value>,
        plan: &AggregationPlan,
        now_ms: i64,
    ) -> &mut WindowState {
        let state = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| Arc::new(WindowState::new(key, bounds, group, plan, now_ms)));
        Arc::make_mut(state)
    }

    /// Apply one member to an open window
    pub fn update(
        &mut self,
        key: &WindowKey,
        plan: &AggregationPlan,
        event: &Event,
    ) -> AggregationResult<&WindowState> {
        let state = self
            .windows
            .get_mut(key)
            .ok_or_else(|| AggregationError::CorruptedState {
                aggregation_type: "window".to_string(),
                details: format!("no open window {}", key),
            })?;
        let state = Arc::make_mut(state);
        if state.completed {
            return Err(AggregationError::CorruptedState {
                aggregation_type: "window".to_string(),
                details: format!("window {} is already completed", key),
            });
        }
        plan.update(&mut state.accumulators, event)?;
        state.member_count += 1;
        state.byte_size += event.approx_size() as u64;
        Ok(state)
    }

    /// Find or create the session for an event at `proposed.start`
    ///
    /// Every open session of the group with `start - gap <= t < end` is
    /// merged with the proposal `[t, t + gap)` into a single state, keyed by
    /// the merged start.
    pub fn merge_sessions(
        &mut self,
        aggregation_id: &str,
        group_key: &str,
        proposed: WindowBounds,
        group: &Map<String, Value>,
        plan: &AggregationPlan,
        now_ms: i64,
    ) -> AggregationResult<WindowKey> {
        let t = proposed.start;
        let touching = self.touching_sessions(aggregation_id, group_key, proposed);

        let mut merged = WindowState::new(
            WindowKey::new(aggregation_id, group_key, t),
            proposed,
            group,
            plan,
            now_ms,
        );
        for key in &touching {
            if let Some(state) = self.windows.remove(key) {
                merged.absorb(&state)?;
            }
        }
        merged.key.window_start = merged.bounds.start;

        let key = merged.key.clone();
        if touching.len() > 1 {
            tracing::debug!(
                window = %key,
                merged = touching.len(),
                "Merged session windows"
            );
        }
        self.windows.insert(key.clone(), Arc::new(merged));
        Ok(key)
    }

    /// Open sessions of the group that an event proposing `proposed` joins
    pub fn touching_sessions(
        &self,
        aggregation_id: &str,
        group_key: &str,
        proposed: WindowBounds,
    ) -> Vec<WindowKey> {
        let t = proposed.start;
        let gap = proposed.duration_ms();
        self.group_range(aggregation_id, group_key)
            .filter(|(_, state)| {
                !state.completed
                    && !state.bounds.is_global()
                    && t >= state.bounds.start.saturating_sub(gap)
                    && t < state.bounds.end
            })
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Open pane of a global window for the group, opening one at `start`
    pub fn global_pane(
        &mut self,
        aggregation_id: &str,
        group_key: &str,
        start: i64,
        group: &Map<String, Value>,
        plan: &AggregationPlan,
        now_ms: i64,
    ) -> WindowKey {
        let open = self
            .group_range(aggregation_id, group_key)
            .find(|(_, state)| state.bounds.is_global() && !state.completed)
            .map(|(key, _)| key.clone());
        match open {
            Some(key) => key,
            None => {
                let key = WindowKey::new(aggregation_id, group_key, start);
                self.get_or_open(key.clone(), WindowBounds::global(start), group, plan, now_ms);
                key
            }
        }
    }

    fn group_range<'a>(
        &'a self,
        aggregation_id: &str,
        group_key: &str,
    ) -> impl Iterator<Item = (&'a WindowKey, &'a Arc<WindowState>)> + 'a {
        let low = WindowKey::new(aggregation_id, group_key, i64::MIN);
        let high = WindowKey::new(aggregation_id, group_key, i64::MAX);
        self.windows.range(low..=high)
    }

    pub fn get(&self, key: &WindowKey) -> Option<&WindowState> {
        self.windows.get(key).map(|s| s.as_ref())
    }

    pub fn contains(&self, key: &WindowKey) -> bool {
        self.windows.contains_key(key)
    }

    /// Remove and return every bounded window whose end plus lateness is at
    /// or behind the watermark, and forget expired tombstones
    pub fn take_completed<F>(&mut self, watermark: i64, lateness: F) -> Vec<WindowState>
    where
        F: Fn(&str) -> i64,
    {
        let due: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(key, state)| {
                !state.bounds.is_global()
                    && state.bounds.completion_time(lateness(&key.aggregation_id)) <= watermark
            })
            .map(|(key, _)| key.clone())
            .collect();

        self.tombstones.retain(|_, until| *until > watermark);

        due.iter().filter_map(|key| self.take(key)).collect()
    }

    /// Remove one window and mark it completed
    pub fn take(&mut self, key: &WindowKey) -> Option<WindowState> {
        self.windows.remove(key).map(|state| {
            let mut state = Arc::try_unwrap(state).unwrap_or_else(|shared| (*shared).clone());
            state.completed = true;
            state
        })
    }

    /// Remember an early-completed key until the watermark passes `until`
    pub fn tombstone(&mut self, key: WindowKey, until: i64) {
        self.tombstones.insert(key, until);
    }

    pub fn is_tombstoned(&self, key: &WindowKey) -> bool {
        self.tombstones.contains_key(key)
    }

    /// Copy-on-write view of all open windows and tombstones
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            windows: self.windows.clone(),
            tombstones: self.tombstones.clone(),
        }
    }

    /// Replace the store contents with restored states
    pub fn restore(&mut self, states: Vec<WindowState>, tombstones: Tombstones) {
        self.windows = states
            .into_iter()
            .map(|state| (state.key.clone(), Arc::new(state)))
            .collect();
        self.tombstones = tombstones;
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &WindowKey> {
        self.windows.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Remove every open window, in key order
    pub fn drain_all(&mut self) -> Vec<WindowState> {
        let keys: Vec<WindowKey> = self.windows.keys().cloned().collect();
        keys.iter().filter_map(|key| self.take(key)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregateDef, AggregateFunction, AggregationSpec, WindowSpec};
    use serde_json::json;

    fn count_plan() -> AggregationPlan {
        AggregationPlan::from_spec(&AggregationSpec {
            id: "a".to_string(),
            group_by: vec![],
            window: WindowSpec::session(10),
            functions: vec![AggregateDef::new("*", AggregateFunction::Count, "n")],
            triggers: vec![],
        })
        .unwrap()
    }

    fn session_event(store: &mut WindowStore, plan: &AggregationPlan, t: i64) -> WindowKey {
        let key = store
            .merge_sessions("a", "g", WindowBounds::new(t, t + 10), &Map::new(), plan, 0)
            .unwrap();
        store
            .update(&key, plan, &Event::at_millis(json!({}), t))
            .unwrap();
        key
    }

    #[test]
    fn test_session_extend_and_bridge() {
        let plan = count_plan();
        let mut store = WindowStore::new();

        session_event(&mut store, &plan, 0);
        session_event(&mut store, &plan, 5);
        session_event(&mut store, &plan, 22);
        assert_eq!(store.open_windows(), 2);

        // 14 is inside [0, 15) and within one gap of the session at 22
        let key = session_event(&mut store, &plan, 14);
        assert_eq!(store.open_windows(), 1);
        let state = store.get(&key).unwrap();
        assert_eq!(state.bounds, WindowBounds::new(0, 32));
        assert_eq!(state.member_count, 4);
        assert_eq!(state.outputs()["n"], json!(4));
    }

    #[test]
    fn test_take_completed_respects_lateness() {
        let plan = count_plan();
        let mut store = WindowStore::new();
        let key = WindowKey::new("a", "", 0);
        store.get_or_open(key.clone(), WindowBounds::new(0, 60), &Map::new(), &plan, 0);

        assert!(store.take_completed(64, |_| 5).is_empty());
        let done = store.take_completed(65, |_| 5);
        assert_eq!(done.len(), 1);
        assert!(done[0].completed);
        assert!(store.is_empty());
    }

    #[test]
    fn test_snapshot_is_copy_on_write() {
        let plan = count_plan();
        let mut store = WindowStore::new();
        let key = WindowKey::new("a", "", 0);
        store.get_or_open(key.clone(), WindowBounds::new(0, 60), &Map::new(), &plan, 0);
        store.update(&key, &plan, &Event::at_millis(json!({}), 1)).unwrap();

        let snapshot = store.snapshot();
        store.update(&key, &plan, &Event::at_millis(json!({}), 2)).unwrap();

        assert_eq!(snapshot.windows[&key].member_count, 1);
        assert_eq!(store.get(&key).unwrap().member_count, 2);
    }

    #[test]
    fn test_tombstones_expire_with_watermark() {
        let mut store = WindowStore::new();
        let key = WindowKey::new("a", "", 0);
        store.tombstone(key.clone(), 65);
        store.take_completed(64, |_| 0);
        assert!(store.is_tombstoned(&key));
        store.take_completed(65, |_| 0);
        assert!(!store.is_tombstoned(&key));
    }

    #[test]
    fn test_state_roundtrips_through_bincode() {
        let plan = count_plan();
        let mut group = Map::new();
        group.insert("country".to_string(), json!("DE"));
        let state = WindowState::new(
            WindowKey::new("a", "DE", 0),
            WindowBounds::new(0, 60),
            &group,
            &plan,
            7,
        );
        let bytes = bincode::serialize(&state).unwrap();
        let restored: WindowState = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.group_values()["country"], json!("DE"));
    }
}
