use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::auth::{self, Permission, Role};
use crate::context::RequestContext;
use crate::effects::{run_effects_for_trigger, EffectDef, EffectRun};
use crate::entity::{AnyEntity, Entity, EntityRef, EntityType};
use crate::error::{CoreError, CoreResult};
use crate::events::{EventType, OutboundEvent, Room, WireEvent};
use crate::graph::FieldNode;
use crate::merge::{
    conflict_key, plan_cherry_pick, plan_entity_merge, resolve_cherry_pick,
    resolve_entity_merge, EntityMergePlan, Resolution,
};
use crate::rules::{
    assemble_context, check_schema_change, evaluate_conditions, resolve_variable,
    FieldCondition, OperatorTable, ScopeType, VariableSchema,
};
use crate::spatial::{
    geometry_from_geojson, locations_in_bounds, locations_in_region, locations_near,
    region_overlap, Bbox, Geometry,
};
use crate::state::audit_db::{self, AuditFilter, AuditOperation, AuditPage, AuditRecord, ExportFormat};
use crate::state::branches_db::{self, AncestryBranch, BranchInput, BranchNode, BranchUpdate, ForkOutcome};
use crate::state::campaigns_db::{self, CampaignRow};
use crate::state::entities_db::{self, EntityRow};
use crate::state::rules_db;
use crate::state::versions_db::{self, StoredVersion};

/// Per-request facade over one connection: every operation checks the
/// actor's role, works the version store, audits, and buffers the events to
/// publish once the surrounding transaction commits.
pub struct StateInterface<'conn> {
    conn: &'conn mut PgConnection,
    ctx: RequestContext,
    ops: OperatorTable,
    pending_events: Vec<OutboundEvent>,
}

/// What a mutation left behind for the engine: the dependency-graph nodes to
/// invalidate.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changed_nodes: Vec<FieldNode>,
}

/// Result shape for `previewMerge`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergePreview {
    pub plans: Vec<EntityMergePlan>,
}

impl MergePreview {
    pub fn conflicts(&self) -> Vec<&crate::merge::FieldConflict> {
        self.plans.iter().flat_map(|plan| &plan.conflicts).collect()
    }
}

/// Result shape for `executeMerge`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub entities_merged: usize,
    pub versions_written: Vec<i64>,
}

impl<'conn> StateInterface<'conn> {
    pub fn new(conn: &'conn mut PgConnection, ctx: RequestContext) -> StateInterface<'conn> {
        StateInterface {
            conn,
            ctx,
            ops: OperatorTable::with_domain_ops(),
            pending_events: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &RequestContext {
        &self.ctx
    }

    /// Events buffered by the operations so far. The engine publishes them
    /// after commit; nothing is emitted for rolled-back work.
    pub fn take_pending_events(&mut self) -> Vec<OutboundEvent> {
        std::mem::take(&mut self.pending_events)
    }

    fn require(&mut self, campaign_id: Uuid, permission: Permission) -> CoreResult<Role> {
        if self.ctx.is_system() {
            return Ok(Role::Owner);
        }
        let role = campaigns_db::membership_role(self.conn, campaign_id, self.ctx.actor)?;
        auth::require(role, permission, self.ctx.actor, campaign_id)
    }

    fn push_event(&mut self, room: Room, event_type: EventType, payload: Value) {
        let event = WireEvent::new(event_type, payload, &self.ctx);
        self.pending_events.push(OutboundEvent { room, event });
    }

    fn push_entity_events(&mut self, campaign_id: Uuid, entity: EntityRef, payload: Value) {
        self.push_event(
            Room::Campaign(campaign_id),
            EventType::EntityUpdated,
            payload.clone(),
        );
        match entity.ty {
            EntityType::Settlement => self.push_event(
                Room::Settlement(entity.id),
                EventType::SettlementUpdated,
                payload,
            ),
            EntityType::Structure => self.push_event(
                Room::Structure(entity.id),
                EventType::StructureUpdated,
                payload,
            ),
            _ => {}
        }
    }

    // ------------------------------------------------------------------
    // Branch ancestry helpers

    fn chain_for(&mut self, branch_id: Uuid) -> CoreResult<Vec<AncestryBranch>> {
        branches_db::ancestry(self.conn, branch_id)
    }

    // ------------------------------------------------------------------
    // Entities

    pub fn get_entity(&mut self, entity: EntityRef) -> CoreResult<AnyEntity> {
        self.get_entity_as_of(entity, self.ctx.branch_id, self.ctx.world_time)
    }

    pub fn get_entity_as_of(
        &mut self,
        entity: EntityRef,
        branch_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> CoreResult<AnyEntity> {
        let row = entities_db::get_live_row(self.conn, entity)?;
        self.require(row.campaign_id, Permission::CampaignRead)?;
        let chain = self.chain_for(branch_id)?;
        let version = versions_db::resolve_version(self.conn, entity, &chain, as_of)?
            .ok_or(CoreError::EntityNotFound {
                ty: entity.ty,
                id: entity.id,
            })?;
        version.entity_state()
    }

    pub fn list_entities(
        &mut self,
        campaign_id: Uuid,
        ty: Option<EntityType>,
    ) -> CoreResult<Vec<EntityRow>> {
        self.require(campaign_id, Permission::CampaignRead)?;
        entities_db::list(self.conn, campaign_id, ty, false)
    }

    pub fn create_entity(
        &mut self,
        campaign_id: Uuid,
        entity: AnyEntity,
    ) -> CoreResult<StoredVersion> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        entity.validate().map_err(CoreError::Validation)?;
        self.check_entity_variables(campaign_id, &entity)?;

        let payload = entity.to_payload();
        let entity_ref = entity.entity_ref();
        let ctx = self.ctx.clone();
        let version = self.conn.transaction(|conn| {
            entities_db::register(conn, campaign_id, &entity, 1)?;
            let version = versions_db::create_version(
                conn,
                entity_ref,
                ctx.branch_id,
                &payload,
                ctx.world_time,
                ctx.actor,
                None,
            )?;
            audit_db::record(
                conn,
                AuditRecord::new(
                    entity_ref.ty.as_str(),
                    entity_ref.id,
                    AuditOperation::Create,
                    ctx.actor,
                )
                .with_states(None, Some(payload.clone()))
                .with_reason(entity.description()),
            )?;
            Ok::<_, CoreError>(version)
        })?;

        self.push_entity_events(campaign_id, entity_ref, payload);
        Ok(version)
    }

    pub fn update_entity(
        &mut self,
        campaign_id: Uuid,
        entity: AnyEntity,
        expected_version: i32,
    ) -> CoreResult<(StoredVersion, ChangeSet)> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        entity.validate().map_err(CoreError::Validation)?;
        self.check_entity_variables(campaign_id, &entity)?;

        let entity_ref = entity.entity_ref();
        let previous = self.get_entity(entity_ref)?.to_payload();
        let payload = entity.to_payload();
        let ctx = self.ctx.clone();
        let version = self.conn.transaction(|conn| {
            let version = versions_db::create_version(
                conn,
                entity_ref,
                ctx.branch_id,
                &payload,
                ctx.world_time,
                ctx.actor,
                Some(expected_version),
            )?;
            entities_db::touch(conn, &entity, version.version)?;
            audit_db::record(
                conn,
                AuditRecord::new(
                    entity_ref.ty.as_str(),
                    entity_ref.id,
                    AuditOperation::Update,
                    ctx.actor,
                )
                .with_states(Some(previous.clone()), Some(payload.clone())),
            )?;
            Ok::<_, CoreError>(version)
        })?;

        self.push_entity_events(campaign_id, entity_ref, payload.clone());
        let mut changes = changed_nodes(entity_ref, &previous, &payload);
        self.extend_with_link_referrers(entity_ref, &mut changes)?;
        Ok((version, changes))
    }

    /// Entities linked *to* the changed one depend on it through the link;
    /// their `links.<kind>` nodes join the invalidation set.
    fn extend_with_link_referrers(
        &mut self,
        entity: EntityRef,
        changes: &mut ChangeSet,
    ) -> CoreResult<()> {
        for link in rules_db::links_to(self.conn, entity)? {
            let Some(ty) = EntityType::parse(&link.from_type) else {
                continue;
            };
            changes.changed_nodes.push(FieldNode::new(
                EntityRef::new(ty, link.from_id),
                format!("links.{}", link.kind),
            ));
        }
        Ok(())
    }

    pub fn add_link(
        &mut self,
        campaign_id: Uuid,
        from: EntityRef,
        to: EntityRef,
        kind: &str,
    ) -> CoreResult<()> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        rules_db::add_link(self.conn, from, to, kind)
    }

    pub fn links_from(
        &mut self,
        campaign_id: Uuid,
        from: EntityRef,
    ) -> CoreResult<Vec<rules_db::LinkRow>> {
        self.require(campaign_id, Permission::CampaignRead)?;
        rules_db::links_from(self.conn, from)
    }

    pub fn remove_link(&mut self, campaign_id: Uuid, id: i32) -> CoreResult<()> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        rules_db::remove_link(self.conn, id)
    }

    /// Archive is soft-delete; ownership cascades so a kingdom takes its
    /// settlements and their structures with it.
    pub fn archive_entity(&mut self, campaign_id: Uuid, entity: EntityRef) -> CoreResult<usize> {
        self.set_entities_deleted(campaign_id, entity, true, AuditOperation::Archive)
    }

    pub fn restore_entity(&mut self, campaign_id: Uuid, entity: EntityRef) -> CoreResult<usize> {
        self.set_entities_deleted(campaign_id, entity, false, AuditOperation::Restore)
    }

    pub fn delete_entity(&mut self, campaign_id: Uuid, entity: EntityRef) -> CoreResult<usize> {
        self.set_entities_deleted(campaign_id, entity, true, AuditOperation::Delete)
    }

    fn set_entities_deleted(
        &mut self,
        campaign_id: Uuid,
        root: EntityRef,
        deleted: bool,
        operation: AuditOperation,
    ) -> CoreResult<usize> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        let ctx = self.ctx.clone();
        let cascade = self.conn.transaction(|conn| {
            let cascade = entities_db::ownership_cascade(conn, campaign_id, root)?;
            let stamp = deleted.then(Utc::now);
            for entity in &cascade {
                entities_db::set_deleted(conn, *entity, stamp)?;
                audit_db::record(
                    conn,
                    AuditRecord::new(entity.ty.as_str(), entity.id, operation, ctx.actor)
                        .with_reason(format!("cascade from {root}")),
                )?;
            }
            Ok::<_, CoreError>(cascade)
        })?;

        for entity in &cascade {
            self.push_entity_events(
                campaign_id,
                *entity,
                serde_json::json!({
                    "entityType": entity.ty,
                    "entityId": entity.id,
                    "deleted": deleted,
                }),
            );
        }
        Ok(cascade.len())
    }

    /// Validates an entity's variable values against every schema visible
    /// from its scope chain. Unknown variables pass; typed ones must fit.
    fn check_entity_variables(
        &mut self,
        campaign_id: Uuid,
        entity: &AnyEntity,
    ) -> CoreResult<()> {
        let schemas = self.schemas_for_entity(campaign_id, entity.entity_ref())?;
        for (name, value) in entity.variables() {
            if let Some(schema) = schemas.iter().find(|schema| &schema.name == name) {
                schema
                    .check_value(value)
                    .map_err(CoreError::Validation)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Variables

    fn scope_chain_for(
        &mut self,
        campaign_id: Uuid,
        entity: EntityRef,
    ) -> CoreResult<Vec<(ScopeType, Uuid)>> {
        let campaign = campaigns_db::get_campaign(self.conn, campaign_id)?;
        let mut scopes = Vec::new();
        if let Some(scope) = ScopeType::for_entity(entity.ty) {
            scopes.push((scope, entity.id));
        }

        // walk entity parents through the registry
        let mut current = entities_db::get_row(self.conn, entity).ok();
        while let Some(row) = current {
            let parent = match (&row.parent_type, row.parent_id) {
                (Some(raw), Some(id)) => EntityType::parse(raw).map(|ty| EntityRef::new(ty, id)),
                _ => None,
            };
            current = None;
            if let Some(parent) = parent {
                if let Some(scope) = ScopeType::for_entity(parent.ty) {
                    scopes.push((scope, parent.id));
                }
                current = entities_db::get_row(self.conn, parent).ok();
            }
        }

        scopes.push((ScopeType::Campaign, campaign.id));
        scopes.push((ScopeType::World, campaign.world_id));
        Ok(scopes)
    }

    fn schemas_for_entity(
        &mut self,
        campaign_id: Uuid,
        entity: EntityRef,
    ) -> CoreResult<Vec<VariableSchema>> {
        let scopes = self.scope_chain_for(campaign_id, entity)?;
        rules_db::schemas_for_scopes(self.conn, &scopes)
    }

    /// Declares or redefines a schema. Every stored value in the scope (the
    /// scope entity and everything it owns) must stay valid.
    pub fn define_schema(
        &mut self,
        campaign_id: Uuid,
        schema: VariableSchema,
    ) -> CoreResult<()> {
        self.require(campaign_id, Permission::CampaignWrite)?;

        let mut stored_values = Vec::new();
        for row in entities_db::list(self.conn, campaign_id, None, false)? {
            let entity = row.entity_ref()?;
            let in_scope = match ScopeType::for_entity(entity.ty) {
                Some(scope) if scope == schema.scope_type => entity.id == schema.scope_id,
                // broader scopes cover every entity in the campaign
                _ => matches!(schema.scope_type, ScopeType::World | ScopeType::Campaign),
            };
            if !in_scope {
                continue;
            }
            if let Ok(state) = self.get_entity(entity) {
                if let Some(value) = state.variables().get(&schema.name) {
                    stored_values.push(value.clone());
                }
            }
        }
        check_schema_change(&schema, stored_values.iter())
            .map_err(CoreError::SchemaIncompatible)?;

        rules_db::upsert_schema(self.conn, &schema)
    }

    pub fn list_schemas(
        &mut self,
        campaign_id: Uuid,
        entity: EntityRef,
    ) -> CoreResult<Vec<VariableSchema>> {
        self.require(campaign_id, Permission::CampaignRead)?;
        self.schemas_for_entity(campaign_id, entity)
    }

    /// Scope-inherited read of one variable.
    pub fn get_value(
        &mut self,
        campaign_id: Uuid,
        entity: EntityRef,
        name: &str,
    ) -> CoreResult<Option<Value>> {
        self.require(campaign_id, Permission::CampaignRead)?;
        let (target, ancestors) = self.resolve_with_ancestors(entity)?;
        let schemas = self.schemas_for_entity(campaign_id, entity)?;

        let mut chain_vars = vec![variables_of(&target)];
        for (_, payload) in &ancestors {
            chain_vars.push(variables_of(payload));
        }
        let chain_refs: Vec<&crate::entity::Variables> = chain_vars.iter().collect();
        let schema = schemas.iter().find(|schema| schema.name == name);
        Ok(resolve_variable(name, &chain_refs, schema))
    }

    /// Writes one variable through the version store.
    pub fn set_value(
        &mut self,
        campaign_id: Uuid,
        entity: EntityRef,
        name: &str,
        value: Value,
        expected_version: i32,
    ) -> CoreResult<(StoredVersion, ChangeSet)> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        let mut state = self.get_entity(entity)?;
        state
            .variables_mut()
            .insert(name.to_string(), value);
        self.update_entity(campaign_id, state, expected_version)
    }

    // ------------------------------------------------------------------
    // Conditions & computed fields

    pub fn create_condition(
        &mut self,
        campaign_id: Uuid,
        condition: FieldCondition,
    ) -> CoreResult<FieldCondition> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        self.ops
            .check_expression(&condition.expression)
            .map_err(|err| CoreError::validation(err.to_string()))?;
        rules_db::insert_condition(self.conn, &condition)?;
        Ok(condition)
    }

    pub fn update_condition(
        &mut self,
        campaign_id: Uuid,
        condition: FieldCondition,
    ) -> CoreResult<FieldCondition> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        self.ops
            .check_expression(&condition.expression)
            .map_err(|err| CoreError::validation(err.to_string()))?;
        rules_db::update_condition(self.conn, &condition)?;
        Ok(condition)
    }

    pub fn delete_condition(
        &mut self,
        campaign_id: Uuid,
        id: Uuid,
    ) -> CoreResult<FieldCondition> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        rules_db::delete_condition(self.conn, id)
    }

    /// Resolves the target and its scope ancestors at the request's read
    /// point. Ancestors that fail to resolve are skipped rather than fatal.
    fn resolve_with_ancestors(
        &mut self,
        entity: EntityRef,
    ) -> CoreResult<(Value, Vec<(EntityType, Value)>)> {
        let target = self.get_entity(entity)?;
        let mut ancestors = Vec::new();
        let mut cursor = target.scope_parent();
        while let Some(parent) = cursor {
            match self.get_entity(parent) {
                Ok(state) => {
                    cursor = state.scope_parent();
                    ancestors.push((parent.ty, state.to_payload()));
                }
                Err(_) => break,
            }
        }
        Ok((target.to_payload(), ancestors))
    }

    /// `evaluateField`: conditions in `(priority, id)` order, first defined
    /// result, schema default fallback.
    pub fn evaluate_field(
        &mut self,
        entity: EntityRef,
        field: &str,
        branch_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> CoreResult<Value> {
        let row = entities_db::get_live_row(self.conn, entity)?;
        self.require(row.campaign_id, Permission::CampaignRead)?;

        let conditions = rules_db::conditions_for_field(self.conn, entity, field)?;
        let previous_branch = self.ctx.branch_id;
        let previous_time = self.ctx.world_time;
        self.ctx.branch_id = branch_id;
        self.ctx.world_time = as_of;
        let outcome = self.evaluate_conditions_now(row.campaign_id, entity, field, &conditions);
        self.ctx.branch_id = previous_branch;
        self.ctx.world_time = previous_time;
        outcome
    }

    fn evaluate_conditions_now(
        &mut self,
        campaign_id: Uuid,
        entity: EntityRef,
        field: &str,
        conditions: &[FieldCondition],
    ) -> CoreResult<Value> {
        let (target, ancestors) = self.resolve_with_ancestors(entity)?;
        let schemas = self.schemas_for_entity(campaign_id, entity)?;
        let campaign = campaigns_db::get_campaign(self.conn, campaign_id)?;

        let input = assemble_context(
            &target,
            &ancestors,
            campaign.current_world_time,
            &Map::new(),
            &schemas,
        );
        let default = schemas
            .iter()
            .find(|schema| schema.name == field)
            .and_then(|schema| schema.default_value.clone());
        evaluate_conditions(conditions, &self.ops, &input, default.as_ref())
    }

    // ------------------------------------------------------------------
    // Effects

    pub fn create_effect(
        &mut self,
        campaign_id: Uuid,
        effect: EffectDef,
    ) -> CoreResult<EffectDef> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        effect.check_expressions(&self.ops)?;
        rules_db::insert_effect(self.conn, campaign_id, &effect)?;
        Ok(effect)
    }

    pub fn update_effect(
        &mut self,
        campaign_id: Uuid,
        effect: EffectDef,
    ) -> CoreResult<EffectDef> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        effect.check_expressions(&self.ops)?;
        rules_db::update_effect(self.conn, &effect)?;
        Ok(effect)
    }

    pub fn delete_effect(&mut self, campaign_id: Uuid, id: Uuid) -> CoreResult<()> {
        self.require(campaign_id, Permission::CampaignWrite)?;
        rules_db::delete_effect(self.conn, id)
    }

    /// `execute(effectId, context, dryRun)`: runs the effect's whole trigger
    /// cohort against its target entity.
    pub fn execute_effect(
        &mut self,
        campaign_id: Uuid,
        effect_id: Uuid,
        params: Map<String, Value>,
        dry_run: bool,
    ) -> CoreResult<(EffectRun, ChangeSet)> {
        self.require(campaign_id, Permission::EffectExecute)?;
        let effect = rules_db::get_effect(self.conn, effect_id)?;
        let target = effect.target.ok_or_else(|| {
            CoreError::validation(format!("effect {effect_id} has no target entity"))
        })?;
        self.execute_trigger(campaign_id, &effect.trigger.clone(), target, params, dry_run)
    }

    /// `executeForEntity`: runs every effect of a trigger against one
    /// entity.
    pub fn execute_trigger(
        &mut self,
        campaign_id: Uuid,
        trigger: &str,
        target: EntityRef,
        params: Map<String, Value>,
        dry_run: bool,
    ) -> CoreResult<(EffectRun, ChangeSet)> {
        self.require(campaign_id, Permission::EffectExecute)?;
        let effects = rules_db::effects_for_trigger(self.conn, campaign_id, trigger)?;
        let cohort: Vec<EffectDef> = effects
            .into_iter()
            .filter(|effect| effect.target.is_none() || effect.target == Some(target))
            .collect();

        let (before, ancestors) = self.resolve_with_ancestors(target)?;
        let schemas = self.schemas_for_entity(campaign_id, target)?;
        let campaign = campaigns_db::get_campaign(self.conn, campaign_id)?;
        let input = assemble_context(
            &before,
            &ancestors,
            campaign.current_world_time,
            &params,
            &schemas,
        );

        let run = run_effects_for_trigger(&cohort, trigger, &self.ops, &input, &before);
        if dry_run || !run.succeeded() || !run.changed() {
            return Ok((run, ChangeSet::default()));
        }

        let after_entity =
            AnyEntity::from_payload(target.ty, run.after_state.clone()).map_err(|err| {
                CoreError::validation(format!("effects produced an invalid payload: {err}"))
            })?;
        after_entity.validate().map_err(CoreError::Validation)?;

        let row = entities_db::get_live_row(self.conn, target)?;
        let ctx = self.ctx.clone();
        let run_for_txn = run.clone();
        self.conn.transaction(|conn| {
            let version = versions_db::create_version(
                conn,
                target,
                ctx.branch_id,
                &run_for_txn.after_state,
                ctx.world_time,
                ctx.actor,
                Some(row.version),
            )?;
            entities_db::touch(conn, &after_entity, version.version)?;
            audit_db::record(
                conn,
                AuditRecord::new(target.ty.as_str(), target.id, AuditOperation::Update, ctx.actor)
                    .with_states(
                        Some(run_for_txn.before_state.clone()),
                        Some(run_for_txn.after_state.clone()),
                    )
                    .with_reason(format!("effects for trigger '{trigger}'")),
            )?;
            Ok::<_, CoreError>(())
        })?;

        self.push_entity_events(campaign_id, target, run.after_state.clone());
        let changes = changed_nodes(target, &run.before_state, &run.after_state);
        Ok((run, changes))
    }

    // ------------------------------------------------------------------
    // Branches & versions

    pub fn create_branch(
        &mut self,
        campaign_id: Uuid,
        input: BranchInput,
    ) -> CoreResult<branches_db::BranchRow> {
        self.require(campaign_id, Permission::BranchCreate)?;
        branches_db::create(self.conn, campaign_id, input, self.ctx.actor)
    }

    pub fn update_branch(
        &mut self,
        campaign_id: Uuid,
        id: Uuid,
        changes: BranchUpdate,
    ) -> CoreResult<branches_db::BranchRow> {
        self.require(campaign_id, Permission::BranchWrite)?;
        branches_db::update(self.conn, id, changes, self.ctx.actor)
    }

    pub fn delete_branch(&mut self, campaign_id: Uuid, id: Uuid) -> CoreResult<()> {
        self.require(campaign_id, Permission::BranchDelete)?;
        branches_db::delete(self.conn, id, self.ctx.actor)
    }

    pub fn get_hierarchy(&mut self, campaign_id: Uuid) -> CoreResult<Vec<BranchNode>> {
        self.require(campaign_id, Permission::BranchRead)?;
        branches_db::hierarchy(self.conn, campaign_id)
    }

    pub fn get_ancestry(&mut self, campaign_id: Uuid, branch_id: Uuid) -> CoreResult<Vec<Uuid>> {
        self.require(campaign_id, Permission::BranchRead)?;
        Ok(self
            .chain_for(branch_id)?
            .into_iter()
            .map(|link| link.branch_id)
            .collect())
    }

    pub fn fork_branch(
        &mut self,
        campaign_id: Uuid,
        source_branch_id: Uuid,
        name: String,
        description: Option<String>,
    ) -> CoreResult<ForkOutcome> {
        self.require(campaign_id, Permission::BranchCreate)?;
        let outcome = branches_db::fork(
            self.conn,
            source_branch_id,
            name,
            description,
            self.ctx.world_time,
            self.ctx.actor,
        )?;
        self.push_event(
            Room::Campaign(campaign_id),
            EventType::StateInvalidated,
            serde_json::json!({
                "branchId": outcome.branch.id,
                "versionsCopied": outcome.versions_copied,
            }),
        );
        Ok(outcome)
    }

    pub fn resolve_version(
        &mut self,
        entity: EntityRef,
        branch_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> CoreResult<Option<StoredVersion>> {
        let row = entities_db::get_row(self.conn, entity)?;
        self.require(row.campaign_id, Permission::BranchRead)?;
        let chain = self.chain_for(branch_id)?;
        versions_db::resolve_version(self.conn, entity, &chain, as_of)
    }

    pub fn latest_version(
        &mut self,
        entity: EntityRef,
        branch_id: Uuid,
    ) -> CoreResult<Option<StoredVersion>> {
        self.resolve_version(entity, branch_id, self.ctx.world_time)
    }

    pub fn list_versions(
        &mut self,
        entity: EntityRef,
        branch_id: Uuid,
    ) -> CoreResult<Vec<StoredVersion>> {
        let row = entities_db::get_row(self.conn, entity)?;
        self.require(row.campaign_id, Permission::BranchRead)?;
        versions_db::list_versions(self.conn, entity, branch_id)
    }

    // ------------------------------------------------------------------
    // World time

    pub fn get_current_world_time(
        &mut self,
        campaign_id: Uuid,
    ) -> CoreResult<Option<DateTime<Utc>>> {
        self.require(campaign_id, Permission::CampaignRead)?;
        Ok(campaigns_db::get_campaign(self.conn, campaign_id)?.current_world_time)
    }

    pub fn advance_world_time(
        &mut self,
        campaign_id: Uuid,
        to: DateTime<Utc>,
        expected_version: i32,
    ) -> CoreResult<CampaignRow> {
        let updated = campaigns_db::advance_world_time(
            self.conn,
            campaign_id,
            to,
            self.ctx.actor,
            expected_version,
        )?;
        self.push_event(
            Room::Campaign(campaign_id),
            EventType::WorldTimeChanged,
            serde_json::json!({
                "campaignId": campaign_id,
                "worldTime": to,
            }),
        );
        Ok(updated)
    }

    // ------------------------------------------------------------------
    // Spatial

    pub fn update_location_geometry(
        &mut self,
        campaign_id: Uuid,
        location_id: Uuid,
        geojson: Value,
        srid: Option<i32>,
        expected_version: i32,
    ) -> CoreResult<(StoredVersion, ChangeSet)> {
        self.require(campaign_id, Permission::SpatialWrite)?;
        let campaign = campaigns_db::get_campaign(self.conn, campaign_id)?;
        let geometry = geometry_from_geojson(geojson, srid.or(Some(campaign.srid)))
            .map_err(|err| CoreError::Validation(err.to_string()))?;

        let entity = EntityRef::new(EntityType::Location, location_id);
        let mut state = self.get_entity(entity)?;
        let location = state
            .as_location_mut()
            .ok_or_else(|| CoreError::integrity(format!("{entity} is not a location")))?;
        location.geom = Some(geometry);
        self.update_entity(campaign_id, state, expected_version)
    }

    fn campaign_locations(&mut self, campaign_id: Uuid) -> CoreResult<Vec<(Uuid, Geometry)>> {
        self.require(campaign_id, Permission::SpatialRead)?;
        entities_db::live_locations(self.conn, campaign_id)
    }

    pub fn locations_in_bounds(
        &mut self,
        campaign_id: Uuid,
        bounds: Bbox,
    ) -> CoreResult<Vec<Uuid>> {
        let locations = self.campaign_locations(campaign_id)?;
        Ok(locations_in_bounds(&locations, &bounds))
    }

    pub fn locations_near(
        &mut self,
        campaign_id: Uuid,
        center: &Geometry,
        radius: f64,
    ) -> CoreResult<Vec<(Uuid, f64)>> {
        let locations = self.campaign_locations(campaign_id)?;
        locations_near(&locations, center, radius)
    }

    pub fn locations_in_region(
        &mut self,
        campaign_id: Uuid,
        region: &Geometry,
    ) -> CoreResult<Vec<Uuid>> {
        let locations = self.campaign_locations(campaign_id)?;
        locations_in_region(&locations, region)
    }

    pub fn check_region_overlap(
        &mut self,
        campaign_id: Uuid,
        a: &Geometry,
        b: &Geometry,
    ) -> CoreResult<bool> {
        self.require(campaign_id, Permission::SpatialRead)?;
        region_overlap(a, b)
    }

    /// Settlements inherit their location's geometry for every spatial
    /// query.
    pub fn settlements_in_region(
        &mut self,
        campaign_id: Uuid,
        region: &Geometry,
    ) -> CoreResult<Vec<Uuid>> {
        let hits = self.locations_in_region(campaign_id, region)?;
        self.settlements_at_locations(campaign_id, &hits)
    }

    pub fn settlement_at_location(
        &mut self,
        campaign_id: Uuid,
        location_id: Uuid,
    ) -> CoreResult<Option<Uuid>> {
        self.require(campaign_id, Permission::SpatialRead)?;
        Ok(entities_db::live_settlements(self.conn, campaign_id)?
            .into_iter()
            .find(|row| row.location_id == Some(location_id))
            .map(|row| row.id))
    }

    pub fn settlements_near(
        &mut self,
        campaign_id: Uuid,
        center: &Geometry,
        radius: f64,
    ) -> CoreResult<Vec<(Uuid, f64)>> {
        let location_hits = self.locations_near(campaign_id, center, radius)?;
        let settlements = entities_db::live_settlements(self.conn, campaign_id)?;
        let mut out = Vec::new();
        for (location_id, distance) in location_hits {
            if let Some(row) = settlements
                .iter()
                .find(|row| row.location_id == Some(location_id))
            {
                out.push((row.id, distance));
            }
        }
        Ok(out)
    }

    fn settlements_at_locations(
        &mut self,
        campaign_id: Uuid,
        location_ids: &[Uuid],
    ) -> CoreResult<Vec<Uuid>> {
        let settlements = entities_db::live_settlements(self.conn, campaign_id)?;
        Ok(location_ids
            .iter()
            .filter_map(|location_id| {
                settlements
                    .iter()
                    .find(|row| row.location_id == Some(*location_id))
                    .map(|row| row.id)
            })
            .collect())
    }

    // ------------------------------------------------------------------
    // Merge

    /// The youngest branch present in both ancestries.
    fn common_ancestor(
        &mut self,
        source: Uuid,
        target: Uuid,
    ) -> CoreResult<Option<AncestryBranch>> {
        let source_chain = self.chain_for(source)?;
        let target_chain = self.chain_for(target)?;
        let target_ids: Vec<Uuid> = target_chain.iter().map(|link| link.branch_id).collect();
        Ok(source_chain
            .into_iter()
            .find(|link| target_ids.contains(&link.branch_id)))
    }

    pub fn preview_merge(
        &mut self,
        campaign_id: Uuid,
        source_branch: Uuid,
        target_branch: Uuid,
    ) -> CoreResult<MergePreview> {
        self.require(campaign_id, Permission::BranchRead)?;
        let source_row = branches_db::get(self.conn, source_branch)?;
        let ancestor = self.common_ancestor(source_branch, target_branch)?;
        let base_time = source_row.diverged_at.unwrap_or(self.ctx.world_time);

        let source_chain = self.chain_for(source_branch)?;
        let target_chain = self.chain_for(target_branch)?;
        let base_chain = ancestor
            .map(|link| self.chain_for(link.branch_id))
            .transpose()?;

        let mut plans = Vec::new();
        for row in entities_db::list(self.conn, campaign_id, None, false)? {
            let entity = row.entity_ref()?;
            let source_version = versions_db::resolve_version(
                self.conn,
                entity,
                &source_chain,
                self.ctx.world_time,
            )?;
            let target_version = versions_db::resolve_version(
                self.conn,
                entity,
                &target_chain,
                self.ctx.world_time,
            )?;
            let (Some(source_version), Some(target_version)) = (source_version, target_version)
            else {
                continue;
            };
            let source_payload = source_version.payload()?;
            let target_payload = target_version.payload()?;
            if source_payload == target_payload {
                continue;
            }

            let base_payload = match &base_chain {
                Some(chain) => {
                    versions_db::resolve_version(self.conn, entity, chain, base_time)?
                        .map(|version| version.payload())
                        .transpose()?
                }
                None => None,
            };
            plans.push(plan_entity_merge(
                entity,
                base_payload.as_ref(),
                &source_payload,
                &target_payload,
            ));
        }
        Ok(MergePreview { plans })
    }

    /// Applies a previewed merge. Every conflict needs a resolution; each
    /// affected entity gets one new version in the target branch, one audit
    /// entry, and one event, all inside a single transaction.
    pub fn execute_merge(
        &mut self,
        campaign_id: Uuid,
        source_branch: Uuid,
        target_branch: Uuid,
        resolutions: &HashMap<String, Resolution>,
    ) -> CoreResult<(MergeResult, ChangeSet)> {
        self.require(campaign_id, Permission::BranchWrite)?;
        let preview = self.preview_merge(campaign_id, source_branch, target_branch)?;

        let unresolved = preview
            .conflicts()
            .iter()
            .filter(|conflict| !resolutions.contains_key(&conflict_key(conflict)))
            .count();
        if unresolved > 0 {
            return Err(CoreError::UnresolvedConflicts(unresolved));
        }

        let ctx = self.ctx.clone();
        let source_name = branches_db::get(self.conn, source_branch)?.name;
        let mut changes = ChangeSet::default();
        let mut merged_payloads = Vec::new();
        for plan in &preview.plans {
            merged_payloads.push((plan.entity, resolve_entity_merge(plan, resolutions)?));
        }

        let versions_written = self.conn.transaction(|conn| {
            let mut written = Vec::new();
            for (entity, payload) in &merged_payloads {
                let current = versions_db::latest_counter(conn, *entity, target_branch)?;
                let version = versions_db::create_version(
                    conn,
                    *entity,
                    target_branch,
                    payload,
                    ctx.world_time,
                    ctx.actor,
                    Some(current),
                )?;
                audit_db::record(
                    conn,
                    AuditRecord::new(entity.ty.as_str(), entity.id, AuditOperation::Merge, ctx.actor)
                        .with_reason(format!("merge from '{source_name}'")),
                )?;
                written.push(version.id);
            }
            Ok::<_, CoreError>(written)
        })?;

        for (entity, payload) in &merged_payloads {
            self.push_entity_events(campaign_id, *entity, payload.clone());
            changes
                .changed_nodes
                .extend(all_field_nodes(*entity, payload));
        }
        info!(
            "merged '{source_name}' into {target_branch}: {} entity(ies)",
            merged_payloads.len()
        );
        Ok((
            MergeResult {
                entities_merged: merged_payloads.len(),
                versions_written,
            },
            changes,
        ))
    }

    /// Applies one source version onto the target branch at the current
    /// world time. Unanswered field conflicts follow the source.
    pub fn cherry_pick(
        &mut self,
        campaign_id: Uuid,
        version_id: i64,
        target_branch: Uuid,
        resolutions: &HashMap<String, Resolution>,
    ) -> CoreResult<(EntityMergePlan, StoredVersion)> {
        self.require(campaign_id, Permission::BranchWrite)?;
        let source = versions_db::get_by_id(self.conn, version_id)?;
        let entity = source.entity;
        let target_chain = self.chain_for(target_branch)?;
        let target_payload = versions_db::resolve_version(
            self.conn,
            entity,
            &target_chain,
            self.ctx.world_time,
        )?
        .map(|version| version.payload())
        .transpose()?
        .unwrap_or(Value::Null);

        let source_payload = source.payload()?;
        let plan = plan_cherry_pick(entity, &source_payload, &target_payload);
        let merged = resolve_cherry_pick(&plan, resolutions);

        let ctx = self.ctx.clone();
        let version = self.conn.transaction(|conn| {
            let current = versions_db::latest_counter(conn, entity, target_branch)?;
            let version = versions_db::create_version(
                conn,
                entity,
                target_branch,
                &merged,
                ctx.world_time,
                ctx.actor,
                Some(current),
            )?;
            audit_db::record(
                conn,
                AuditRecord::new(entity.ty.as_str(), entity.id, AuditOperation::Merge, ctx.actor)
                    .with_reason(format!("cherry-pick of version {version_id}")),
            )?;
            Ok::<_, CoreError>(version)
        })?;

        self.push_entity_events(campaign_id, entity, merged);
        Ok((plan, version))
    }

    // ------------------------------------------------------------------
    // Audit

    /// Role-gated audit scan: players and viewers only ever see their own
    /// entries, whatever filter they pass.
    pub fn audit_query(
        &mut self,
        campaign_id: Uuid,
        mut filter: AuditFilter,
        cursor: Option<i64>,
        limit: i64,
    ) -> CoreResult<AuditPage> {
        let role = self.require(campaign_id, Permission::AuditRead)?;
        if !role.sees_all_audits() {
            filter.actor = Some(self.ctx.actor);
        }
        audit_db::query(self.conn, &filter, cursor, limit)
    }

    pub fn audit_count(&mut self, campaign_id: Uuid, mut filter: AuditFilter) -> CoreResult<i64> {
        let role = self.require(campaign_id, Permission::AuditRead)?;
        if !role.sees_all_audits() {
            filter.actor = Some(self.ctx.actor);
        }
        audit_db::count(self.conn, &filter)
    }

    pub fn audit_export(
        &mut self,
        campaign_id: Uuid,
        filter: AuditFilter,
        format: ExportFormat,
    ) -> CoreResult<Vec<u8>> {
        self.require(campaign_id, Permission::AuditExport)?;
        let mut entries = Vec::new();
        let mut cursor = None;
        loop {
            let page = audit_db::query(self.conn, &filter, cursor, 500)?;
            entries.extend(page.entries);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        audit_db::export(&entries, format)
    }
}

fn variables_of(payload: &Value) -> crate::entity::Variables {
    payload
        .get("variables")
        .and_then(Value::as_object)
        .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

/// Dependency-graph nodes for every leaf field that changed between two
/// payloads.
fn changed_nodes(entity: EntityRef, before: &Value, after: &Value) -> ChangeSet {
    let diff = crate::merge::payload_diff(before, after);
    let changed_nodes = diff
        .as_object()
        .map(|map| {
            map.keys()
                .map(|field| FieldNode::new(entity, field.clone()))
                .collect()
        })
        .unwrap_or_default();
    ChangeSet { changed_nodes }
}

fn all_field_nodes(entity: EntityRef, payload: &Value) -> Vec<FieldNode> {
    crate::merge::flatten_fields(payload)
        .into_keys()
        .map(|field| FieldNode::new(entity, field))
        .collect()
}
