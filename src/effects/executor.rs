use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::effects::patch::{apply_patch, PatchOp};
use crate::entity::EntityRef;
use crate::error::{CoreError, CoreResult};
use crate::rules::{EvalInput, OperatorTable};

/// Execution phases, applied in declaration order for every trigger.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, DbEnum, Serialize, Deserialize, strum::Display,
)]
#[ExistingTypePath = "crate::schema::sql_types::EffectPhase"]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EffectPhase {
    Pre,
    OnResolve,
    Post,
}

pub const PHASE_ORDER: [EffectPhase; 3] =
    [EffectPhase::Pre, EffectPhase::OnResolve, EffectPhase::Post];

/// An executable mutation definition. Patch-op values may be JSONLogic
/// expressions; they are materialized against the evaluation context right
/// before application.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectDef {
    pub id: Uuid,
    pub trigger: String,
    pub phase: EffectPhase,
    pub priority: i32,
    /// Explicit target; `None` means "the entity the trigger fired for".
    pub target: Option<EntityRef>,
    pub patch_ops: Vec<PatchOp>,
    pub description: Option<String>,
}

impl EffectDef {
    /// Parse-time gate: every embedded expression must clear the operator
    /// table before the effect is accepted into storage.
    pub fn check_expressions(&self, table: &OperatorTable) -> CoreResult<()> {
        for op in &self.patch_ops {
            if let PatchOp::Add { value, .. }
            | PatchOp::Replace { value, .. }
            | PatchOp::Test { value, .. } = op
            {
                table
                    .check_expression(value)
                    .map_err(|err| CoreError::validation(err.to_string()))?;
            }
        }
        Ok(())
    }

    /// Resolves embedded JSONLogic values to concrete ones.
    pub fn materialize(
        &self,
        table: &OperatorTable,
        input: &EvalInput,
    ) -> Result<Vec<PatchOp>, String> {
        self.patch_ops
            .iter()
            .map(|op| {
                Ok(match op {
                    PatchOp::Add { path, value } => PatchOp::Add {
                        path: path.clone(),
                        value: eval_value(table, input, value)?,
                    },
                    PatchOp::Replace { path, value } => PatchOp::Replace {
                        path: path.clone(),
                        value: eval_value(table, input, value)?,
                    },
                    PatchOp::Test { path, value } => PatchOp::Test {
                        path: path.clone(),
                        value: eval_value(table, input, value)?,
                    },
                    passthrough => passthrough.clone(),
                })
            })
            .collect()
    }
}

fn eval_value(table: &OperatorTable, input: &EvalInput, value: &Value) -> Result<Value, String> {
    table.evaluate(value, input).map_err(|err| err.to_string())
}

/// Result of one execution: state before and after, the concrete ops that
/// were applied, and the causes when the run failed. A run with errors
/// applied nothing; `after_state == before_state`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectRun {
    pub before_state: Value,
    pub after_state: Value,
    pub patches_applied: Vec<PatchOp>,
    pub errors: Vec<String>,
}

impl EffectRun {
    pub fn succeeded(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn changed(&self) -> bool {
        self.succeeded() && self.before_state != self.after_state
    }
}

/// Runs every effect matching `trigger` over a working copy of `before`:
/// phases PRE, ON_RESOLVE, POST, priority ascending within each (ties by
/// id). Any failure voids the whole run; persistence is the caller's call
/// (dry-run returns the same report without a write).
pub fn run_effects_for_trigger(
    effects: &[EffectDef],
    trigger: &str,
    table: &OperatorTable,
    input: &EvalInput,
    before: &Value,
) -> EffectRun {
    let mut working = before.clone();
    let mut applied = Vec::new();

    for phase in PHASE_ORDER {
        let mut batch: Vec<&EffectDef> = effects
            .iter()
            .filter(|effect| effect.trigger == trigger && effect.phase == phase)
            .collect();
        batch.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });

        for effect in batch {
            let ops = match effect.materialize(table, input) {
                Ok(ops) => ops,
                Err(cause) => {
                    return failed_run(before, format!("effect {}: {cause}", effect.id));
                }
            };
            if let Err(err) = apply_patch(&mut working, &ops) {
                return failed_run(before, format!("effect {}: {err}", effect.id));
            }
            applied.extend(ops);
        }
    }

    EffectRun {
        before_state: before.clone(),
        after_state: working,
        patches_applied: applied,
        errors: Vec::new(),
    }
}

fn failed_run(before: &Value, cause: String) -> EffectRun {
    EffectRun {
        before_state: before.clone(),
        after_state: before.clone(),
        patches_applied: Vec::new(),
        errors: vec![cause],
    }
}
