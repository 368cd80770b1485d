use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::entity::{EntityType, Variables};

/// Levels a variable schema can be declared at, most general first. Reads
/// walk the chain from the most specific scope upward.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScopeType {
    World,
    Campaign,
    Party,
    Kingdom,
    Settlement,
    Character,
    Structure,
}

impl ScopeType {
    /// The next more-general scope, or `None` at the world level.
    pub fn parent(&self) -> Option<ScopeType> {
        match self {
            ScopeType::World => None,
            ScopeType::Campaign => Some(ScopeType::World),
            ScopeType::Party | ScopeType::Kingdom => Some(ScopeType::Campaign),
            ScopeType::Settlement => Some(ScopeType::Kingdom),
            ScopeType::Character => Some(ScopeType::Party),
            ScopeType::Structure => Some(ScopeType::Settlement),
        }
    }

    pub fn for_entity(ty: EntityType) -> Option<ScopeType> {
        match ty {
            EntityType::Party => Some(ScopeType::Party),
            EntityType::Kingdom => Some(ScopeType::Kingdom),
            EntityType::Settlement => Some(ScopeType::Settlement),
            EntityType::Character => Some(ScopeType::Character),
            EntityType::Structure => Some(ScopeType::Structure),
            EntityType::Location | EntityType::Encounter | EntityType::Event => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, Serialize, Deserialize, strum::Display)]
#[ExistingTypePath = "crate::schema::sql_types::VariableKind"]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Boolean,
    Enum,
    Array,
}

/// A named, scoped variable definition. Values are stored inside entity
/// payloads; the schema only constrains them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableSchema {
    pub name: String,
    pub scope_type: ScopeType,
    pub scope_id: Uuid,
    pub var_type: VariableType,
    #[serde(default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl VariableSchema {
    /// Structural soundness of the definition itself.
    pub fn check_definition(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("variable name cannot be empty".to_string());
        }
        match self.var_type {
            VariableType::Enum => match &self.enum_values {
                Some(values) if !values.is_empty() => {}
                _ => return Err(format!("enum variable '{}' lists no values", self.name)),
            },
            _ if self.enum_values.is_some() => {
                return Err(format!(
                    "variable '{}' is {} but lists enum values",
                    self.name, self.var_type
                ))
            }
            _ => {}
        }
        if let Some(default) = &self.default_value {
            self.check_value(default)?;
        }
        Ok(())
    }

    /// Type-checks a stored value against this schema.
    pub fn check_value(&self, value: &Value) -> Result<(), String> {
        match self.var_type {
            VariableType::String => {
                if !value.is_string() {
                    return Err(self.mismatch("a string", value));
                }
            }
            VariableType::Number => {
                if !value.is_number() {
                    return Err(self.mismatch("a number", value));
                }
            }
            VariableType::Boolean => {
                if !value.is_boolean() {
                    return Err(self.mismatch("a boolean", value));
                }
            }
            VariableType::Enum => {
                let text = value
                    .as_str()
                    .ok_or_else(|| self.mismatch("an enum string", value))?;
                let allowed = self.enum_values.as_deref().unwrap_or(&[]);
                if !allowed.iter().any(|candidate| candidate == text) {
                    return Err(format!(
                        "'{text}' is not one of {allowed:?} for variable '{}'",
                        self.name
                    ));
                }
            }
            VariableType::Array => {
                let items = value
                    .as_array()
                    .ok_or_else(|| self.mismatch("an array", value))?;
                // Elements must be scalars of one consistent type.
                let mut kinds = items.iter().map(scalar_kind);
                if let Some(first) = kinds.next() {
                    let first = first.ok_or_else(|| {
                        format!("array variable '{}' holds a non-scalar element", self.name)
                    })?;
                    for kind in kinds {
                        match kind {
                            Some(kind) if kind == first => {}
                            _ => {
                                return Err(format!(
                                    "array variable '{}' mixes element types",
                                    self.name
                                ))
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn mismatch(&self, expected: &str, got: &Value) -> String {
        format!(
            "variable '{}' expects {expected}, got {got}",
            self.name
        )
    }
}

fn scalar_kind(value: &Value) -> Option<&'static str> {
    match value {
        Value::String(_) => Some("string"),
        Value::Number(_) => Some("number"),
        Value::Bool(_) => Some("boolean"),
        _ => None,
    }
}

/// Scope-inherited read: `chain` is ordered most specific first. The first
/// defined value wins; the schema default applies when nothing is set.
pub fn resolve_variable(
    name: &str,
    chain: &[&Variables],
    schema: Option<&VariableSchema>,
) -> Option<Value> {
    for variables in chain {
        if let Some(value) = variables.get(name) {
            return Some(value.clone());
        }
    }
    schema.and_then(|schema| schema.default_value.clone())
}

/// Gate for schema changes: every stored value must remain valid under the
/// new definition, else the change is `SchemaIncompatible`.
pub fn check_schema_change<'a>(
    schema: &VariableSchema,
    stored_values: impl IntoIterator<Item = &'a Value>,
) -> Result<(), String> {
    schema.check_definition()?;
    for value in stored_values {
        schema.check_value(value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema(var_type: VariableType) -> VariableSchema {
        VariableSchema {
            name: "morale".to_string(),
            scope_type: ScopeType::Settlement,
            scope_id: Uuid::new_v4(),
            var_type,
            enum_values: None,
            default_value: None,
            description: None,
        }
    }

    #[test]
    fn primitive_types_are_enforced() {
        assert!(schema(VariableType::Number).check_value(&json!(5)).is_ok());
        assert!(schema(VariableType::Number).check_value(&json!("5")).is_err());
        assert!(schema(VariableType::String).check_value(&json!("hi")).is_ok());
        assert!(schema(VariableType::Boolean).check_value(&json!(true)).is_ok());
        assert!(schema(VariableType::Boolean).check_value(&json!(0)).is_err());
    }

    #[test]
    fn enum_membership_is_enforced() {
        let mut s = schema(VariableType::Enum);
        s.enum_values = Some(vec!["calm".into(), "uneasy".into(), "rioting".into()]);
        assert!(s.check_value(&json!("calm")).is_ok());
        assert!(s.check_value(&json!("panicking")).is_err());
        assert!(s.check_value(&json!(2)).is_err());
    }

    #[test]
    fn arrays_must_be_homogeneous_scalars() {
        let s = schema(VariableType::Array);
        assert!(s.check_value(&json!([1, 2, 3])).is_ok());
        assert!(s.check_value(&json!(["a", "b"])).is_ok());
        assert!(s.check_value(&json!([])).is_ok());
        assert!(s.check_value(&json!([1, "b"])).is_err());
        assert!(s.check_value(&json!([{"nested": 1}])).is_err());
    }

    #[test]
    fn enum_schemas_need_values_and_others_reject_them() {
        let bare_enum = schema(VariableType::Enum);
        assert!(bare_enum.check_definition().is_err());

        let mut number_with_values = schema(VariableType::Number);
        number_with_values.enum_values = Some(vec!["a".into()]);
        assert!(number_with_values.check_definition().is_err());
    }

    #[test]
    fn resolution_walks_most_specific_first() {
        let mut structure_vars = Variables::new();
        let mut settlement_vars = Variables::new();
        settlement_vars.insert("morale".to_string(), json!(5));

        let mut s = schema(VariableType::Number);
        s.default_value = Some(json!(1));

        // unset at the structure level -> settlement value wins
        let chain = [&structure_vars, &settlement_vars];
        assert_eq!(resolve_variable("morale", &chain, Some(&s)), Some(json!(5)));

        // set locally -> local value shadows the parent
        structure_vars.insert("morale".to_string(), json!(7));
        let chain = [&structure_vars, &settlement_vars];
        assert_eq!(resolve_variable("morale", &chain, Some(&s)), Some(json!(7)));

        // unset everywhere -> schema default
        assert_eq!(resolve_variable("morale", &[], Some(&s)), Some(json!(1)));
        assert_eq!(resolve_variable("morale", &[], None), None);
    }

    #[test]
    fn schema_change_rejects_newly_invalid_stored_values() {
        let narrowed = VariableSchema {
            name: "mood".to_string(),
            scope_type: ScopeType::Settlement,
            scope_id: Uuid::new_v4(),
            var_type: VariableType::Enum,
            enum_values: Some(vec!["calm".into(), "uneasy".into()]),
            default_value: None,
            description: None,
        };
        let stored = [json!("calm"), json!("rioting")];
        let err = check_schema_change(&narrowed, stored.iter()).unwrap_err();
        assert!(err.contains("rioting"));

        let compatible = [json!("calm"), json!("uneasy")];
        assert!(check_schema_change(&narrowed, compatible.iter()).is_ok());
    }

    #[test]
    fn scope_chain_terminates_at_world() {
        let mut scope = ScopeType::Structure;
        let mut seen = vec![scope];
        while let Some(parent) = scope.parent() {
            scope = parent;
            seen.push(scope);
        }
        assert_eq!(
            seen,
            vec![
                ScopeType::Structure,
                ScopeType::Settlement,
                ScopeType::Kingdom,
                ScopeType::Campaign,
                ScopeType::World,
            ]
        );
    }
}
