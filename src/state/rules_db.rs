use std::str::FromStr;

use chrono::Utc;
use diesel::prelude::*;
use uuid::Uuid;

use crate::effects::{EffectDef, EffectPhase};
use crate::entity::{EntityRef, EntityType};
use crate::error::{CoreError, CoreResult};
use crate::rules::{FieldCondition, ScopeType, VariableSchema, VariableType};
use crate::schema::{effects, field_conditions, links, variable_schemas};

#[derive(Identifiable, Queryable, Debug, Clone)]
#[diesel(table_name = field_conditions)]
struct DbFieldCondition {
    id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    field: String,
    expression: serde_json::Value,
    priority: i32,
    description: Option<String>,
    #[allow(dead_code)]
    deleted_at: Option<chrono::DateTime<Utc>>,
}

impl DbFieldCondition {
    fn parse(self) -> CoreResult<FieldCondition> {
        let ty = EntityType::parse(&self.entity_type).ok_or_else(|| {
            CoreError::integrity(format!(
                "condition {} targets unknown entity type '{}'",
                self.id, self.entity_type
            ))
        })?;
        Ok(FieldCondition {
            id: self.id,
            target: EntityRef::new(ty, self.entity_id),
            field: self.field,
            expression: self.expression,
            priority: self.priority,
            description: self.description,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = field_conditions)]
struct NewFieldCondition {
    id: Uuid,
    entity_type: String,
    entity_id: Uuid,
    field: String,
    expression: serde_json::Value,
    priority: i32,
    description: Option<String>,
}

pub fn insert_condition(conn: &mut PgConnection, condition: &FieldCondition) -> CoreResult<()> {
    use crate::schema::field_conditions::dsl as conditions;

    diesel::insert_into(conditions::field_conditions)
        .values(NewFieldCondition {
            id: condition.id,
            entity_type: condition.target.ty.as_str().to_string(),
            entity_id: condition.target.id,
            field: condition.field.clone(),
            expression: condition.expression.clone(),
            priority: condition.priority,
            description: condition.description.clone(),
        })
        .execute(conn)?;
    Ok(())
}

pub fn update_condition(conn: &mut PgConnection, condition: &FieldCondition) -> CoreResult<()> {
    use crate::schema::field_conditions::dsl as conditions;

    let updated = diesel::update(
        conditions::field_conditions
            .find(condition.id)
            .filter(conditions::deleted_at.is_null()),
    )
    .set((
        conditions::expression.eq(condition.expression.clone()),
        conditions::priority.eq(condition.priority),
        conditions::description.eq(condition.description.clone()),
    ))
    .execute(conn)?;
    if updated == 0 {
        return Err(CoreError::validation(format!(
            "condition {} does not exist",
            condition.id
        )));
    }
    Ok(())
}

pub fn delete_condition(conn: &mut PgConnection, id: Uuid) -> CoreResult<FieldCondition> {
    use crate::schema::field_conditions::dsl as conditions;

    let row: DbFieldCondition = diesel::update(
        conditions::field_conditions
            .find(id)
            .filter(conditions::deleted_at.is_null()),
    )
    .set(conditions::deleted_at.eq(Some(Utc::now())))
    .get_result(conn)
    .optional()?
    .ok_or_else(|| CoreError::validation(format!("condition {id} does not exist")))?;
    row.parse()
}

pub fn get_condition(conn: &mut PgConnection, id: Uuid) -> CoreResult<FieldCondition> {
    use crate::schema::field_conditions::dsl as conditions;

    let row: DbFieldCondition = conditions::field_conditions
        .find(id)
        .filter(conditions::deleted_at.is_null())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::validation(format!("condition {id} does not exist")))?;
    row.parse()
}

/// Live conditions for one `(entity, field)`, in evaluation order.
pub fn conditions_for_field(
    conn: &mut PgConnection,
    entity: EntityRef,
    field: &str,
) -> CoreResult<Vec<FieldCondition>> {
    use crate::schema::field_conditions::dsl as conditions;

    let rows: Vec<DbFieldCondition> = conditions::field_conditions
        .filter(conditions::entity_type.eq(entity.ty.as_str()))
        .filter(conditions::entity_id.eq(entity.id))
        .filter(conditions::field.eq(field))
        .filter(conditions::deleted_at.is_null())
        .load(conn)?;
    let mut parsed = rows
        .into_iter()
        .map(DbFieldCondition::parse)
        .collect::<CoreResult<Vec<_>>>()?;
    crate::rules::sort_conditions(&mut parsed);
    Ok(parsed)
}

pub fn conditions_for_entity(
    conn: &mut PgConnection,
    entity: EntityRef,
) -> CoreResult<Vec<FieldCondition>> {
    use crate::schema::field_conditions::dsl as conditions;

    let rows: Vec<DbFieldCondition> = conditions::field_conditions
        .filter(conditions::entity_type.eq(entity.ty.as_str()))
        .filter(conditions::entity_id.eq(entity.id))
        .filter(conditions::deleted_at.is_null())
        .load(conn)?;
    rows.into_iter().map(DbFieldCondition::parse).collect()
}

#[derive(Identifiable, Queryable, Debug, Clone)]
#[diesel(table_name = variable_schemas)]
struct DbVariableSchema {
    id: i32,
    scope_type: String,
    scope_id: Uuid,
    name: String,
    var_type: VariableType,
    enum_values: Option<serde_json::Value>,
    default_value: Option<serde_json::Value>,
    description: Option<String>,
    #[allow(dead_code)]
    deleted_at: Option<chrono::DateTime<Utc>>,
}

impl DbVariableSchema {
    fn parse(self) -> CoreResult<VariableSchema> {
        let scope_type = ScopeType::from_str(&self.scope_type).map_err(|_| {
            CoreError::integrity(format!(
                "variable schema {} has unknown scope '{}'",
                self.id, self.scope_type
            ))
        })?;
        let enum_values = self
            .enum_values
            .map(serde_json::from_value)
            .transpose()
            .map_err(|err| {
                CoreError::integrity(format!("variable schema {} enum list: {err}", self.id))
            })?;
        Ok(VariableSchema {
            name: self.name,
            scope_type,
            scope_id: self.scope_id,
            var_type: self.var_type,
            enum_values,
            default_value: self.default_value,
            description: self.description,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = variable_schemas)]
struct NewVariableSchema {
    scope_type: String,
    scope_id: Uuid,
    name: String,
    var_type: VariableType,
    enum_values: Option<serde_json::Value>,
    default_value: Option<serde_json::Value>,
    description: Option<String>,
}

pub fn upsert_schema(conn: &mut PgConnection, schema: &VariableSchema) -> CoreResult<()> {
    use crate::schema::variable_schemas::dsl as schemas;

    conn.transaction(|conn| {
        // a redefinition replaces the previous one for the same scope + name
        diesel::update(
            schemas::variable_schemas
                .filter(schemas::scope_type.eq(schema.scope_type.to_string()))
                .filter(schemas::scope_id.eq(schema.scope_id))
                .filter(schemas::name.eq(&schema.name))
                .filter(schemas::deleted_at.is_null()),
        )
        .set(schemas::deleted_at.eq(Some(Utc::now())))
        .execute(conn)?;

        let enum_values = schema
            .enum_values
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|err| CoreError::integrity(format!("unserializable enum list: {err}")))?;
        diesel::insert_into(schemas::variable_schemas)
            .values(NewVariableSchema {
                scope_type: schema.scope_type.to_string(),
                scope_id: schema.scope_id,
                name: schema.name.clone(),
                var_type: schema.var_type,
                enum_values,
                default_value: schema.default_value.clone(),
                description: schema.description.clone(),
            })
            .execute(conn)?;
        Ok(())
    })
}

/// Live schemas for the given `(scope, id)` pairs, e.g. a structure's whole
/// inheritance chain.
pub fn schemas_for_scopes(
    conn: &mut PgConnection,
    scopes: &[(ScopeType, Uuid)],
) -> CoreResult<Vec<VariableSchema>> {
    use crate::schema::variable_schemas::dsl as schemas;

    let mut out = Vec::new();
    for (scope_type, scope_id) in scopes {
        let rows: Vec<DbVariableSchema> = schemas::variable_schemas
            .filter(schemas::scope_type.eq(scope_type.to_string()))
            .filter(schemas::scope_id.eq(scope_id))
            .filter(schemas::deleted_at.is_null())
            .load(conn)?;
        for row in rows {
            out.push(row.parse()?);
        }
    }
    Ok(out)
}

#[derive(Identifiable, Queryable, Debug, Clone)]
#[diesel(table_name = effects)]
struct DbEffect {
    id: Uuid,
    #[allow(dead_code)]
    campaign_id: Uuid,
    trigger: String,
    phase: EffectPhase,
    priority: i32,
    patch_ops: serde_json::Value,
    entity_type: Option<String>,
    entity_id: Option<Uuid>,
    description: Option<String>,
    #[allow(dead_code)]
    deleted_at: Option<chrono::DateTime<Utc>>,
}

impl DbEffect {
    fn parse(self) -> CoreResult<EffectDef> {
        let target = match (self.entity_type.as_deref(), self.entity_id) {
            (Some(raw), Some(id)) => {
                let ty = EntityType::parse(raw).ok_or_else(|| {
                    CoreError::integrity(format!(
                        "effect {} targets unknown entity type '{raw}'",
                        self.id
                    ))
                })?;
                Some(EntityRef::new(ty, id))
            }
            _ => None,
        };
        let patch_ops = serde_json::from_value(self.patch_ops).map_err(|err| {
            CoreError::integrity(format!("effect {} has bad patch ops: {err}", self.id))
        })?;
        Ok(EffectDef {
            id: self.id,
            trigger: self.trigger,
            phase: self.phase,
            priority: self.priority,
            target,
            patch_ops,
            description: self.description,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = effects)]
struct NewEffect {
    id: Uuid,
    campaign_id: Uuid,
    trigger: String,
    phase: EffectPhase,
    priority: i32,
    patch_ops: serde_json::Value,
    entity_type: Option<String>,
    entity_id: Option<Uuid>,
    description: Option<String>,
}

pub fn insert_effect(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    effect: &EffectDef,
) -> CoreResult<()> {
    use crate::schema::effects::dsl as effects;

    let patch_ops = serde_json::to_value(&effect.patch_ops)
        .map_err(|err| CoreError::integrity(format!("unserializable patch ops: {err}")))?;
    diesel::insert_into(effects::effects)
        .values(NewEffect {
            id: effect.id,
            campaign_id,
            trigger: effect.trigger.clone(),
            phase: effect.phase,
            priority: effect.priority,
            patch_ops,
            entity_type: effect.target.map(|t| t.ty.as_str().to_string()),
            entity_id: effect.target.map(|t| t.id),
            description: effect.description.clone(),
        })
        .execute(conn)?;
    Ok(())
}

pub fn update_effect(conn: &mut PgConnection, effect: &EffectDef) -> CoreResult<()> {
    use crate::schema::effects::dsl as effects;

    let patch_ops = serde_json::to_value(&effect.patch_ops)
        .map_err(|err| CoreError::integrity(format!("unserializable patch ops: {err}")))?;
    let updated = diesel::update(
        effects::effects
            .find(effect.id)
            .filter(effects::deleted_at.is_null()),
    )
    .set((
        effects::trigger.eq(effect.trigger.clone()),
        effects::phase.eq(effect.phase),
        effects::priority.eq(effect.priority),
        effects::patch_ops.eq(patch_ops),
        effects::description.eq(effect.description.clone()),
    ))
    .execute(conn)?;
    if updated == 0 {
        return Err(CoreError::validation(format!(
            "effect {} does not exist",
            effect.id
        )));
    }
    Ok(())
}

pub fn delete_effect(conn: &mut PgConnection, id: Uuid) -> CoreResult<()> {
    use crate::schema::effects::dsl as effects;

    let updated = diesel::update(
        effects::effects
            .find(id)
            .filter(effects::deleted_at.is_null()),
    )
    .set(effects::deleted_at.eq(Some(Utc::now())))
    .execute(conn)?;
    if updated == 0 {
        return Err(CoreError::validation(format!("effect {id} does not exist")));
    }
    Ok(())
}

pub fn get_effect(conn: &mut PgConnection, id: Uuid) -> CoreResult<EffectDef> {
    use crate::schema::effects::dsl as effects;

    let row: DbEffect = effects::effects
        .find(id)
        .filter(effects::deleted_at.is_null())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::validation(format!("effect {id} does not exist")))?;
    row.parse()
}

/// Live effects of a campaign matching a trigger, unordered; the executor
/// handles phase and priority ordering.
pub fn effects_for_trigger(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    trigger: &str,
) -> CoreResult<Vec<EffectDef>> {
    use crate::schema::effects::dsl as effects;

    let rows: Vec<DbEffect> = effects::effects
        .filter(effects::campaign_id.eq(campaign_id))
        .filter(effects::trigger.eq(trigger))
        .filter(effects::deleted_at.is_null())
        .load(conn)?;
    rows.into_iter().map(DbEffect::parse).collect()
}

/// A directed relationship between two entities; dependency-graph fodder.
#[derive(Identifiable, Queryable, Debug, Clone, PartialEq)]
#[diesel(table_name = links)]
pub struct LinkRow {
    pub id: i32,
    pub from_type: String,
    pub from_id: Uuid,
    pub to_type: String,
    pub to_id: Uuid,
    pub kind: String,
}

#[derive(Insertable)]
#[diesel(table_name = links)]
struct NewLink {
    from_type: String,
    from_id: Uuid,
    to_type: String,
    to_id: Uuid,
    kind: String,
}

pub fn add_link(
    conn: &mut PgConnection,
    from: EntityRef,
    to: EntityRef,
    kind: &str,
) -> CoreResult<()> {
    use crate::schema::links::dsl as links;

    diesel::insert_into(links::links)
        .values(NewLink {
            from_type: from.ty.as_str().to_string(),
            from_id: from.id,
            to_type: to.ty.as_str().to_string(),
            to_id: to.id,
            kind: kind.to_string(),
        })
        .execute(conn)?;
    Ok(())
}

pub fn links_from(conn: &mut PgConnection, from: EntityRef) -> CoreResult<Vec<LinkRow>> {
    use crate::schema::links::dsl as links;

    Ok(links::links
        .filter(links::from_type.eq(from.ty.as_str()))
        .filter(links::from_id.eq(from.id))
        .load(conn)?)
}

/// Links whose target is `to`: the referrers that must hear about a change
/// to it.
pub fn links_to(conn: &mut PgConnection, to: EntityRef) -> CoreResult<Vec<LinkRow>> {
    use crate::schema::links::dsl as links;

    Ok(links::links
        .filter(links::to_type.eq(to.ty.as_str()))
        .filter(links::to_id.eq(to.id))
        .load(conn)?)
}

pub fn remove_link(conn: &mut PgConnection, id: i32) -> CoreResult<()> {
    use crate::schema::links::dsl as links;

    diesel::delete(links::links.find(id)).execute(conn)?;
    Ok(())
}
