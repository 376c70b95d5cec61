//! Transformation pipeline
//!
//! Transforms run in order over a copy of the event; the first failure
//! aborts the pipeline and the original event is left untouched.

use crate::config::{ParseKind, TransformDef};
use crate::error::{StageError, StageResult, ValidationError, ValidationResult};
use crate::expr::{self, CompiledExpr};
use serde_json::{Map, Value};
use stream_analytics_types::events::{lookup, parse_timestamp};
use stream_analytics_types::Event;

#[derive(Debug, Clone)]
enum Step {
    Map { field: String, to: String },
    Project { fields: Vec<String> },
    Compute { field: String, expression: CompiledExpr },
    Parse { field: String, kind: ParseKind },
    Drop { fields: Vec<String> },
    SetEventTime { field: String },
}

#[derive(Debug, Clone)]
struct CompiledTransform {
    name: String,
    step: Step,
}

/// Ordered, pure payload transformations
#[derive(Debug, Clone, Default)]
pub struct TransformPipeline {
    steps: Vec<CompiledTransform>,
}

impl TransformPipeline {
    pub fn new(defs: &[TransformDef]) -> ValidationResult<Self> {
        let steps = defs
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let step = match def.clone() {
                    TransformDef::Map { field, to } => Step::Map { field, to },
                    TransformDef::Project { fields } => Step::Project { fields },
                    TransformDef::Compute { field, expression } => Step::Compute {
                        field,
                        expression: CompiledExpr::parse(&expression).map_err(|source| {
                            ValidationError::Expression {
                                path: format!("transforms[{}].expression", i),
                                source,
                            }
                        })?,
                    },
                    TransformDef::Parse { field, kind } => Step::Parse { field, kind },
                    TransformDef::Drop { fields } => Step::Drop { fields },
                    TransformDef::SetEventTime { field } => Step::SetEventTime { field },
                };
                Ok(CompiledTransform {
                    name: format!("{}[{}]", def.kind(), i),
                    step,
                })
            })
            .collect::<ValidationResult<Vec<_>>>()?;
        Ok(Self { steps })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Apply every transform to a copy of `event`
    pub fn apply(&self, event: &Event) -> StageResult<Event> {
        let mut out = event.clone();
        for transform in &self.steps {
            apply_step(&transform.step, &mut out).map_err(|reason| StageError::Transform {
                name: transform.name.clone(),
                reason,
            })?;
        }
        Ok(out)
    }
}

fn apply_step(step: &Step, event: &mut Event) -> Result<(), String> {
    match step {
        Step::Map { field, to } => {
            if let Some(value) = remove_path(&mut event.payload, field) {
                insert_path(&mut event.payload, to, value)?;
            }
        }
        Step::Project { fields } => {
            let mut projected = Map::new();
            for field in fields {
                if let Some(value) = lookup(&event.payload, field) {
                    insert_path(&mut projected, field, value.clone())?;
                }
            }
            event.payload = projected;
        }
        Step::Compute { field, expression } => {
            let value = expression.evaluate(&*event).map_err(|e| e.to_string())?;
            insert_path(&mut event.payload, field, value)?;
        }
        Step::Parse { field, kind } => {
            let Some(current) = lookup(&event.payload, field).cloned() else {
                return Ok(());
            };
            let parsed = parse_value(&current, *kind)
                .ok_or_else(|| format!("cannot parse field '{}' value {} as {:?}", field, current, kind))?;
            insert_path(&mut event.payload, field, parsed)?;
        }
        Step::Drop { fields } => {
            for field in fields {
                remove_path(&mut event.payload, field);
            }
        }
        Step::SetEventTime { field } => {
            let value = lookup(&event.payload, field)
                .ok_or_else(|| format!("event time field '{}' is missing", field))?;
            event.event_time = parse_timestamp(value)
                .ok_or_else(|| format!("field '{}' value {} is not a timestamp", field, value))?;
        }
    }
    Ok(())
}

fn parse_value(value: &Value, kind: ParseKind) -> Option<Value> {
    let text = match value {
        Value::String(s) => s.trim(),
        // Already in the target representation
        Value::Number(_) if kind == ParseKind::Number => return Some(value.clone()),
        Value::Bool(_) if kind == ParseKind::Boolean => return Some(value.clone()),
        Value::Number(_) if kind == ParseKind::Timestamp => {
            return parse_timestamp(value).map(|dt| Value::from(dt.timestamp_millis()))
        }
        _ => return None,
    };

    match kind {
        ParseKind::Number => text
            .parse::<f64>()
            .ok()
            .filter(|n| n.is_finite())
            .map(expr::number),
        ParseKind::Boolean => match text.to_ascii_lowercase().as_str() {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            _ => None,
        },
        ParseKind::Json => serde_json::from_str(text).ok(),
        ParseKind::Timestamp => {
            parse_timestamp(&Value::String(text.to_string())).map(|dt| Value::from(dt.timestamp_millis()))
        }
    }
}

/// Remove the value at a dotted path
pub fn remove_path(map: &mut Map<String, Value>, path: &str) -> Option<Value> {
    if map.contains_key(path) {
        return map.remove(path);
    }
    let (parent, leaf) = path.rsplit_once('.')?;
    let mut current = map;
    for part in parent.split('.') {
        current = current.get_mut(part)?.as_object_mut()?;
    }
    current.remove(leaf)
}

/// Insert a value at a dotted path, creating intermediate objects
pub fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) -> Result<(), String> {
    let mut parts: Vec<&str> = path.split('.').collect();
    let Some(leaf) = parts.pop() else {
        return Err("empty field path".to_string());
    };

    let mut current = map;
    for part in parts {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if slot.is_null() {
            *slot = Value::Object(Map::new());
        }
        current = slot
            .as_object_mut()
            .ok_or_else(|| format!("'{}' in path '{}' is not an object", part, path))?;
    }
    current.insert(leaf.to_string(), value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline(defs: Vec<TransformDef>) -> TransformPipeline {
        TransformPipeline::new(&defs).unwrap()
    }

    #[test]
    fn test_map_project_and_drop() {
        let p = pipeline(vec![
            TransformDef::Map {
                field: "user.name".to_string(),
                to: "name".to_string(),
            },
            TransformDef::Drop {
                fields: vec!["secret".to_string()],
            },
        ]);
        let event = Event::at_millis(json!({"user": {"name": "ada", "id": 1}, "secret": "x"}), 0);
        let out = p.apply(&event).unwrap();
        assert_eq!(out.payload, *json!({"user": {"id": 1}, "name": "ada"}).as_object().unwrap());

        let p = pipeline(vec![TransformDef::Project {
            fields: vec!["user.id".to_string(), "absent".to_string()],
        }]);
        let out = p.apply(&event).unwrap();
        assert_eq!(out.payload, *json!({"user": {"id": 1}}).as_object().unwrap());
    }

    #[test]
    fn test_compute_and_parse() {
        let p = pipeline(vec![
            TransformDef::Parse {
                field: "amount".to_string(),
                kind: ParseKind::Number,
            },
            TransformDef::Compute {
                field: "total".to_string(),
                expression: "amount * qty".to_string(),
            },
        ]);
        let out = p
            .apply(&Event::at_millis(json!({"amount": " 2.5 ", "qty": 4}), 0))
            .unwrap();
        assert_eq!(out.field("amount"), Some(&json!(2.5)));
        assert_eq!(out.field("total"), Some(&json!(10)));
    }

    #[test]
    fn test_failed_transform_leaves_original_untouched() {
        let p = pipeline(vec![
            TransformDef::Drop {
                fields: vec!["a".to_string()],
            },
            TransformDef::Parse {
                field: "flag".to_string(),
                kind: ParseKind::Boolean,
            },
        ]);
        let event = Event::at_millis(json!({"a": 1, "flag": "maybe"}), 0);
        let err = p.apply(&event).unwrap_err();
        assert!(matches!(err, StageError::Transform { ref name, .. } if name == "parse[1]"));
        assert_eq!(event.field("a"), Some(&json!(1)));
    }

    #[test]
    fn test_set_event_time() {
        let p = pipeline(vec![TransformDef::SetEventTime {
            field: "ts".to_string(),
        }]);
        let out = p
            .apply(&Event::at_millis(json!({"ts": "1970-01-01T00:01:00Z"}), 0))
            .unwrap();
        assert_eq!(out.event_time_ms(), 60_000);

        assert!(p.apply(&Event::at_millis(json!({}), 0)).is_err());
    }
}
