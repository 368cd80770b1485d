mod diff;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::EntityRef;
use crate::error::{CoreError, CoreResult};

pub use diff::{classify_fields, flatten_fields, payload_diff, set_field, FieldClass};

/// Caller's answer to one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    AcceptSource,
    AcceptTarget,
    Custom { value: Value },
}

/// One unresolved conflict as shown to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub entity: EntityRef,
    pub field: String,
    pub base: Option<Value>,
    pub source: Option<Value>,
    pub target: Option<Value>,
}

/// One change the merge takes without asking.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanChange {
    pub entity: EntityRef,
    pub field: String,
    pub value: Option<Value>,
    pub from_source: bool,
}

/// What `previewMerge` returns for one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMergePlan {
    pub entity: EntityRef,
    pub clean: Vec<CleanChange>,
    pub conflicts: Vec<FieldConflict>,
    /// The target payload with every clean source change applied; conflicts
    /// still hold the target's value until resolved.
    pub merged_payload: Value,
}

impl EntityMergePlan {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Builds the merge plan for one entity from the three payloads.
pub fn plan_entity_merge(
    entity: EntityRef,
    base: Option<&Value>,
    source: &Value,
    target: &Value,
) -> EntityMergePlan {
    let mut merged = target.clone();
    let mut clean = Vec::new();
    let mut conflicts = Vec::new();

    for class in classify_fields(base, source, target) {
        match class {
            FieldClass::Clean {
                field,
                value,
                from_source,
            } => {
                if from_source {
                    set_field(&mut merged, &field, value.clone());
                }
                clean.push(CleanChange {
                    entity,
                    field,
                    value,
                    from_source,
                });
            }
            FieldClass::Identical { .. } => {
                // both sides agree and the target already holds the value
            }
            FieldClass::Conflict {
                field,
                base,
                source,
                target,
            } => conflicts.push(FieldConflict {
                entity,
                field,
                base,
                source,
                target,
            }),
        }
    }

    EntityMergePlan {
        entity,
        clean,
        conflicts,
        merged_payload: merged,
    }
}

/// Conflict keys are `"{entity_type}/{entity_id}/{field}"` on the wire.
pub fn conflict_key(conflict: &FieldConflict) -> String {
    format!(
        "{}/{}/{}",
        conflict.entity.ty, conflict.entity.id, conflict.field
    )
}

/// Applies resolutions to a plan, producing the final payload for the
/// target branch. Every conflict must be answered or the whole merge fails
/// with `UnresolvedConflicts`; no partial merge is observable.
pub fn resolve_entity_merge(
    plan: &EntityMergePlan,
    resolutions: &HashMap<String, Resolution>,
) -> CoreResult<Value> {
    let unresolved = plan
        .conflicts
        .iter()
        .filter(|conflict| !resolutions.contains_key(&conflict_key(conflict)))
        .count();
    if unresolved > 0 {
        return Err(CoreError::UnresolvedConflicts(unresolved));
    }

    let mut merged = plan.merged_payload.clone();
    for conflict in &plan.conflicts {
        let resolution = &resolutions[&conflict_key(conflict)];
        match resolution {
            Resolution::AcceptSource => {
                set_field(&mut merged, &conflict.field, conflict.source.clone());
            }
            Resolution::AcceptTarget => {
                set_field(&mut merged, &conflict.field, conflict.target.clone());
            }
            Resolution::Custom { value } => {
                set_field(&mut merged, &conflict.field, Some(value.clone()));
            }
        }
    }
    Ok(merged)
}

/// Cherry-pick classification: the target's current payload stands in for
/// the base, so every differing field is surfaced. Unanswered fields follow
/// the source, since applying that version is the point of the operation.
pub fn plan_cherry_pick(entity: EntityRef, source: &Value, target: &Value) -> EntityMergePlan {
    let mut conflicts = Vec::new();
    let source_fields = flatten_fields(source);
    let target_fields = flatten_fields(target);

    let mut all_fields: Vec<&String> = source_fields.keys().chain(target_fields.keys()).collect();
    all_fields.sort();
    all_fields.dedup();

    for field in all_fields {
        let in_source = source_fields.get(field);
        let in_target = target_fields.get(field);
        if in_source != in_target {
            conflicts.push(FieldConflict {
                entity,
                field: field.clone(),
                base: in_target.cloned(),
                source: in_source.cloned(),
                target: in_target.cloned(),
            });
        }
    }

    EntityMergePlan {
        entity,
        clean: Vec::new(),
        conflicts,
        merged_payload: target.clone(),
    }
}

/// Resolves a cherry-pick plan; unanswered conflicts accept the source.
pub fn resolve_cherry_pick(
    plan: &EntityMergePlan,
    resolutions: &HashMap<String, Resolution>,
) -> Value {
    let mut merged = plan.merged_payload.clone();
    for conflict in &plan.conflicts {
        match resolutions.get(&conflict_key(conflict)) {
            None | Some(Resolution::AcceptSource) => {
                set_field(&mut merged, &conflict.field, conflict.source.clone());
            }
            Some(Resolution::AcceptTarget) => {}
            Some(Resolution::Custom { value }) => {
                set_field(&mut merged, &conflict.field, Some(value.clone()));
            }
        }
    }
    merged
}
