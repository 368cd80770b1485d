use std::collections::BTreeSet;

use serde_json::Value;
use uuid::Uuid;

use crate::entity::EntityRef;
use crate::error::{CoreError, CoreResult};
use crate::rules::logic::{referenced_paths, EvalInput, OperatorTable};

/// A priority-ordered rule producing a computed field value for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldCondition {
    pub id: Uuid,
    pub target: EntityRef,
    pub field: String,
    pub expression: Value,
    pub priority: i32,
    pub description: Option<String>,
}

impl FieldCondition {
    /// Variable paths the expression reads; these become dependency-graph
    /// edges pointing at `(target, field)`.
    pub fn dependencies(&self) -> BTreeSet<String> {
        referenced_paths(&self.expression)
    }
}

/// Deterministic evaluation order: priority ascending, then id.
pub fn sort_conditions(conditions: &mut Vec<FieldCondition>) {
    conditions.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
    });
}

/// Evaluates the conditions for one `(entity, field)` until one produces a
/// defined (non-null) result. Falls back to the schema default, then null.
/// The first evaluation failure aborts, naming the offending condition.
pub fn evaluate_conditions(
    conditions: &[FieldCondition],
    table: &OperatorTable,
    input: &EvalInput,
    default: Option<&Value>,
) -> CoreResult<Value> {
    for condition in conditions {
        let result = table
            .evaluate(&condition.expression, input)
            .map_err(|err| CoreError::ConditionFailed {
                condition_id: condition.id,
                cause: err.to_string(),
            })?;
        if !result.is_null() {
            return Ok(result);
        }
    }
    Ok(default.cloned().unwrap_or(Value::Null))
}
