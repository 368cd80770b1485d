use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::entity::EntityType;
use crate::rules::logic::EvalInput;
use crate::rules::vars::VariableSchema;

/// Assembles the data tree a condition evaluates against.
///
/// Layout, all keys optional except `entity`:
/// - `entity`: the target's resolved payload
/// - one key per ancestor entity type (`settlement`, `kingdom`, ...)
/// - `worldTime`: the campaign clock, ISO 8601
/// - `params`: explicit caller parameters
/// - `variables`: merged variable values, schema defaults first, then each
///   scope from most general to most specific so the specific value wins
pub fn assemble_context(
    target_payload: &Value,
    ancestors: &[(EntityType, Value)],
    world_time: Option<DateTime<Utc>>,
    params: &Map<String, Value>,
    schemas: &[VariableSchema],
) -> EvalInput {
    let mut data = Map::new();
    data.insert("entity".to_string(), target_payload.clone());

    for (ty, payload) in ancestors {
        data.insert(ty.as_str().to_string(), payload.clone());
    }

    if let Some(world_time) = world_time {
        data.insert(
            "worldTime".to_string(),
            Value::String(world_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        );
    }

    if !params.is_empty() {
        data.insert("params".to_string(), Value::Object(params.clone()));
    }

    let mut variables = Map::new();
    for schema in schemas {
        if let Some(default) = &schema.default_value {
            variables.insert(schema.name.clone(), default.clone());
        }
    }
    // ancestors are ordered nearest first; apply farthest first so nearer
    // scopes overwrite
    for (_, payload) in ancestors.iter().rev() {
        merge_payload_variables(&mut variables, payload);
    }
    merge_payload_variables(&mut variables, target_payload);
    data.insert("variables".to_string(), Value::Object(variables));

    EvalInput::new(Value::Object(data))
}

fn merge_payload_variables(into: &mut Map<String, Value>, payload: &Value) {
    if let Some(Value::Object(vars)) = payload.get("variables") {
        for (name, value) in vars {
            into.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    use crate::rules::vars::{ScopeType, VariableType};

    use super::*;

    fn schema_with_default(name: &str, default: Value) -> VariableSchema {
        VariableSchema {
            name: name.to_string(),
            scope_type: ScopeType::Campaign,
            scope_id: Uuid::new_v4(),
            var_type: VariableType::Number,
            enum_values: None,
            default_value: Some(default),
            description: None,
        }
    }

    #[test]
    fn nearer_scopes_shadow_farther_ones_and_defaults() {
        let target = json!({"name": "Cathedral", "variables": {"candles": 40}});
        let ancestors = vec![
            (
                EntityType::Settlement,
                json!({"name": "Sandpoint", "variables": {"morale": 5, "candles": 10}}),
            ),
            (
                EntityType::Kingdom,
                json!({"name": "Varisia", "variables": {"morale": 2, "tax": 0.1}}),
            ),
        ];
        let schemas = vec![
            schema_with_default("morale", json!(1)),
            schema_with_default("garrison", json!(0)),
        ];
        let input = assemble_context(&target, &ancestors, None, &Map::new(), &schemas);

        let vars = input.data.get("variables").unwrap();
        assert_eq!(vars.get("candles"), Some(&json!(40))); // target shadows settlement
        assert_eq!(vars.get("morale"), Some(&json!(5))); // settlement shadows kingdom
        assert_eq!(vars.get("tax"), Some(&json!(0.1))); // kingdom only
        assert_eq!(vars.get("garrison"), Some(&json!(0))); // schema default

        assert_eq!(
            input.data.get("settlement").and_then(|s| s.get("name")),
            Some(&json!("Sandpoint"))
        );
        assert_eq!(
            input.data.get("entity").and_then(|e| e.get("name")),
            Some(&json!("Cathedral"))
        );
    }

    #[test]
    fn world_time_and_params_ride_along() {
        let at = Utc.with_ymd_and_hms(4707, 3, 15, 12, 0, 0).unwrap();
        let mut params = Map::new();
        params.insert("attacker".to_string(), json!("goblins"));
        let input = assemble_context(&json!({}), &[], Some(at), &params, &[]);
        assert_eq!(
            input.data.get("worldTime"),
            Some(&json!("4707-03-15T12:00:00Z"))
        );
        assert_eq!(
            input.data.get("params").and_then(|p| p.get("attacker")),
            Some(&json!("goblins"))
        );
    }
}
