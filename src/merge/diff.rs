use std::collections::BTreeMap;

use serde_json::{Map, Value};

/// Flattens a payload into dotted leaf paths. Arrays count as leaves: merges
/// treat a reordered list as one changed field, not element-wise edits.
pub fn flatten_fields(payload: &Value) -> BTreeMap<String, Value> {
    let mut fields = BTreeMap::new();
    match payload {
        Value::Object(map) => flatten_into(&mut fields, String::new(), map),
        Value::Null => {}
        other => {
            fields.insert(String::new(), other.clone());
        }
    }
    fields
}

fn flatten_into(fields: &mut BTreeMap<String, Value>, prefix: String, map: &Map<String, Value>) {
    for (key, value) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            Value::Object(inner) if !inner.is_empty() => {
                flatten_into(fields, path, inner);
            }
            other => {
                fields.insert(path, other.clone());
            }
        }
    }
}

/// Writes a dotted-path leaf back into a payload, creating intermediate
/// objects as needed. `None` removes the leaf.
pub fn set_field(payload: &mut Value, path: &str, value: Option<Value>) {
    let parts: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = parts.split_last() else {
        return;
    };

    let mut current = payload;
    for part in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current
            .as_object_mut()
            .unwrap_or_else(|| unreachable!("just coerced to an object"));
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        match value {
            Some(value) => {
                map.insert(last.to_string(), value);
            }
            None => {
                map.remove(*last);
            }
        }
    }
}

/// How one field fared across the three-way comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldClass {
    /// Only one side changed; the merge takes that side silently.
    Clean {
        field: String,
        value: Option<Value>,
        from_source: bool,
    },
    /// Both sides changed to the same value; nothing to decide.
    Identical { field: String, value: Option<Value> },
    /// Both sides changed to different values; the caller must decide.
    Conflict {
        field: String,
        base: Option<Value>,
        source: Option<Value>,
        target: Option<Value>,
    },
}

impl FieldClass {
    pub fn field(&self) -> &str {
        match self {
            FieldClass::Clean { field, .. }
            | FieldClass::Identical { field, .. }
            | FieldClass::Conflict { field, .. } => field,
        }
    }
}

/// Field-level three-way diff of one entity. `base` is the payload at the
/// common ancestor; a missing base (entity born after the fork) diffs every
/// field against nothing.
pub fn classify_fields(
    base: Option<&Value>,
    source: &Value,
    target: &Value,
) -> Vec<FieldClass> {
    let base_fields = base.map(flatten_fields).unwrap_or_default();
    let source_fields = flatten_fields(source);
    let target_fields = flatten_fields(target);

    let mut all_fields: Vec<&String> = base_fields
        .keys()
        .chain(source_fields.keys())
        .chain(target_fields.keys())
        .collect();
    all_fields.sort();
    all_fields.dedup();

    let mut classes = Vec::new();
    for field in all_fields {
        let in_base = base_fields.get(field);
        let in_source = source_fields.get(field);
        let in_target = target_fields.get(field);

        let source_changed = in_source != in_base;
        let target_changed = in_target != in_base;

        match (source_changed, target_changed) {
            (false, false) => {}
            (true, false) => classes.push(FieldClass::Clean {
                field: field.clone(),
                value: in_source.cloned(),
                from_source: true,
            }),
            (false, true) => classes.push(FieldClass::Clean {
                field: field.clone(),
                value: in_target.cloned(),
                from_source: false,
            }),
            (true, true) if in_source == in_target => classes.push(FieldClass::Identical {
                field: field.clone(),
                value: in_source.cloned(),
            }),
            (true, true) => classes.push(FieldClass::Conflict {
                field: field.clone(),
                base: in_base.cloned(),
                source: in_source.cloned(),
                target: in_target.cloned(),
            }),
        }
    }
    classes
}

/// Field-by-field difference of two payloads, used for audit records.
/// Produces `{field: {"from": ..., "to": ...}}` for each changed leaf.
pub fn payload_diff(before: &Value, after: &Value) -> Value {
    let before_fields = flatten_fields(before);
    let after_fields = flatten_fields(after);

    let mut all_fields: Vec<&String> = before_fields.keys().chain(after_fields.keys()).collect();
    all_fields.sort();
    all_fields.dedup();

    let mut diff = Map::new();
    for field in all_fields {
        let from = before_fields.get(field);
        let to = after_fields.get(field);
        if from != to {
            let mut change = Map::new();
            change.insert("from".to_string(), from.cloned().unwrap_or(Value::Null));
            change.insert("to".to_string(), to.cloned().unwrap_or(Value::Null));
            diff.insert(field.clone(), Value::Object(change));
        }
    }
    Value::Object(diff)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn flatten_reaches_nested_variables() {
        let payload = json!({
            "name": "Sandpoint",
            "level": 3,
            "variables": {"morale": 5, "festival": false},
            "tags": ["coastal"],
        });
        let fields = flatten_fields(&payload);
        assert_eq!(fields.get("variables.morale"), Some(&json!(5)));
        assert_eq!(fields.get("tags"), Some(&json!(["coastal"])));
        assert_eq!(fields.get("level"), Some(&json!(3)));
    }

    #[test]
    fn set_field_writes_and_removes_leaves() {
        let mut payload = json!({"variables": {"morale": 5}});
        set_field(&mut payload, "variables.morale", Some(json!(7)));
        set_field(&mut payload, "variables.festival", Some(json!(true)));
        set_field(&mut payload, "name", Some(json!("Sandpoint")));
        assert_eq!(
            payload,
            json!({"variables": {"morale": 7, "festival": true}, "name": "Sandpoint"})
        );

        set_field(&mut payload, "variables.festival", None);
        assert_eq!(payload["variables"], json!({"morale": 7}));
    }

    #[test]
    fn one_sided_changes_are_clean() {
        let base = json!({"level": 3, "variables": {"morale": 5}});
        let source = json!({"level": 4, "variables": {"morale": 5}});
        let target = json!({"level": 3, "variables": {"morale": 5}});
        let classes = classify_fields(Some(&base), &source, &target);
        assert_eq!(
            classes,
            vec![FieldClass::Clean {
                field: "level".to_string(),
                value: Some(json!(4)),
                from_source: true,
            }]
        );
    }

    #[test]
    fn same_change_on_both_sides_is_identical() {
        let base = json!({"variables": {"morale": 5}});
        let source = json!({"variables": {"morale": 7}});
        let target = json!({"variables": {"morale": 7}});
        let classes = classify_fields(Some(&base), &source, &target);
        assert_eq!(
            classes,
            vec![FieldClass::Identical {
                field: "variables.morale".to_string(),
                value: Some(json!(7)),
            }]
        );
    }

    #[test]
    fn diverging_changes_conflict_with_the_base_attached() {
        let base = json!({"variables": {"morale": 5}});
        let source = json!({"variables": {"morale": 7}});
        let target = json!({"variables": {"morale": 3}});
        let classes = classify_fields(Some(&base), &source, &target);
        assert_eq!(
            classes,
            vec![FieldClass::Conflict {
                field: "variables.morale".to_string(),
                base: Some(json!(5)),
                source: Some(json!(7)),
                target: Some(json!(3)),
            }]
        );
    }

    #[test]
    fn removals_participate_like_values() {
        let base = json!({"level": 3, "note": "old"});
        let source = json!({"level": 3});
        let target = json!({"level": 3, "note": "rewritten"});
        let classes = classify_fields(Some(&base), &source, &target);
        assert_eq!(
            classes,
            vec![FieldClass::Conflict {
                field: "note".to_string(),
                base: Some(json!("old")),
                source: None,
                target: Some(json!("rewritten")),
            }]
        );
    }

    #[test]
    fn missing_base_treats_everything_as_new() {
        let source = json!({"name": "New Fort"});
        let target = json!({"name": "New Fort"});
        let classes = classify_fields(None, &source, &target);
        assert_eq!(
            classes,
            vec![FieldClass::Identical {
                field: "name".to_string(),
                value: Some(json!("New Fort")),
            }]
        );
    }

    #[test]
    fn audit_diff_lists_changed_leaves_only() {
        let before = json!({"level": 3, "variables": {"morale": 5}});
        let after = json!({"level": 4, "variables": {"morale": 5}, "note": "x"});
        assert_eq!(
            payload_diff(&before, &after),
            json!({
                "level": {"from": 3, "to": 4},
                "note": {"from": null, "to": "x"},
            })
        );
    }
}
