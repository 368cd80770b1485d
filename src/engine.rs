use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::warn;
use serde_json::Value;
use uuid::Uuid;

use crate::context::RequestContext;
use crate::db::DbPool;
use crate::entity::{EntityRef, EntityType};
use crate::error::{CoreError, CoreResult};
use crate::events::{Publisher, Room, WireEvent};
use crate::graph::{
    spawn_recompute_worker, DepNode, DependencyGraph, FieldNode, RecomputeBatch, RecomputeQueue,
    ResultCache,
};
use crate::rules::FieldCondition;
use crate::state::{membership_role, ChangeSet, EntityRow, StateInterface};
use crate::{auth, state};

/// Top-level wiring: the pool, the publisher, one dependency graph per
/// campaign, the computed-field cache, and the recompute worker. The
/// transport holds one of these and drives everything through it.
pub struct Engine {
    pool: DbPool,
    publisher: Arc<Publisher>,
    graphs: Arc<Mutex<HashMap<Uuid, DependencyGraph>>>,
    cache: Arc<Mutex<ResultCache>>,
    recompute: RecomputeQueue,
}

impl Engine {
    pub fn new(pool: DbPool, publisher: Arc<Publisher>) -> Arc<Engine> {
        let graphs: Arc<Mutex<HashMap<Uuid, DependencyGraph>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let cache = Arc::new(Mutex::new(ResultCache::new()));

        let worker_pool = pool.clone();
        let worker_cache = cache.clone();
        let worker_publisher = publisher.clone();
        let (recompute, _handle) = spawn_recompute_worker(move |batch| {
            run_recompute_batch(&worker_pool, &worker_cache, &worker_publisher, batch)
        });

        Arc::new(Engine {
            pool,
            publisher,
            graphs,
            cache,
            recompute,
        })
    }

    pub fn publisher(&self) -> &Arc<Publisher> {
        &self.publisher
    }

    fn conn(&self) -> CoreResult<crate::db::DbConn> {
        self.pool
            .get()
            .map_err(|err| CoreError::integrity(format!("connection pool exhausted: {err}")))
    }

    /// Runs one mutation through a `StateInterface`, then handles the
    /// post-commit half: events are published and invalidation is scheduled
    /// only after the closure succeeded.
    pub async fn execute<T>(
        &self,
        ctx: RequestContext,
        campaign_id: Uuid,
        op: impl FnOnce(&mut StateInterface) -> CoreResult<(T, ChangeSet)>,
    ) -> CoreResult<T> {
        let mut conn = self.conn()?;
        let (outcome, changes, events) = {
            let mut state = StateInterface::new(&mut conn, ctx.clone());
            let (outcome, changes) = op(&mut state)?;
            let events = state.take_pending_events();
            (outcome, changes, events)
        };
        drop(conn);

        self.publisher.publish_all(events).await;
        self.schedule_invalidation(campaign_id, &ctx, changes.changed_nodes);
        Ok(outcome)
    }

    /// Read-only access; no events, no invalidation.
    pub fn read<T>(
        &self,
        ctx: RequestContext,
        op: impl FnOnce(&mut StateInterface) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let mut conn = self.conn()?;
        let mut state = StateInterface::new(&mut conn, ctx);
        op(&mut state)
    }

    fn schedule_invalidation(
        &self,
        campaign_id: Uuid,
        ctx: &RequestContext,
        changed: Vec<FieldNode>,
    ) {
        if changed.is_empty() {
            return;
        }
        let downstream = {
            let mut graphs = lock(&self.graphs);
            let graph = graphs.entry(campaign_id).or_default();
            let mut downstream = Vec::new();
            for node in &changed {
                for hit in graph.affected_by(&DepNode::Field(node.clone())) {
                    if !downstream.contains(&hit) {
                        downstream.push(hit);
                    }
                }
            }
            downstream
        };

        let mut wiped: Vec<FieldNode> = changed;
        wiped.extend(downstream.iter().cloned());
        lock(&self.cache).invalidate_nodes(ctx.branch_id, &wiped);

        self.recompute.schedule(RecomputeBatch {
            campaign_id,
            branch_id: ctx.branch_id,
            as_of: ctx.world_time,
            nodes: downstream,
            correlation_id: ctx.correlation_id,
        });
    }

    /// `advanceWorldTime` with the full post-commit choreography: the
    /// `world_time_changed` event, then (unless suppressed) invalidation of
    /// every time-sensitive node.
    pub async fn advance_world_time(
        &self,
        ctx: RequestContext,
        campaign_id: Uuid,
        to: DateTime<Utc>,
        expected_version: i32,
        invalidate_cache: bool,
    ) -> CoreResult<state::CampaignRow> {
        let mut conn = self.conn()?;
        let (updated, events) = {
            let mut state = StateInterface::new(&mut conn, ctx.clone());
            let updated = state.advance_world_time(campaign_id, to, expected_version)?;
            let events = state.take_pending_events();
            (updated, events)
        };
        drop(conn);

        self.publisher.publish_all(events).await;
        if invalidate_cache {
            let time_sensitive = {
                let mut graphs = lock(&self.graphs);
                graphs.entry(campaign_id).or_default().time_sensitive()
            };
            lock(&self.cache).invalidate_branch(ctx.branch_id);
            self.recompute.schedule(RecomputeBatch {
                campaign_id,
                branch_id: ctx.branch_id,
                as_of: to,
                nodes: time_sensitive,
                correlation_id: ctx.correlation_id,
            });
        }
        Ok(updated)
    }

    /// Stores a condition and registers its dependency edges. The edge
    /// insertion can fail with `CircularDependency`, in which case the
    /// stored condition is removed again.
    pub fn register_condition(
        &self,
        ctx: RequestContext,
        campaign_id: Uuid,
        condition: FieldCondition,
    ) -> CoreResult<FieldCondition> {
        let mut conn = self.conn()?;
        let mut state = StateInterface::new(&mut conn, ctx);
        let condition = state.create_condition(campaign_id, condition)?;

        let target_node = FieldNode::new(condition.target, condition.field.clone());
        let ancestors = scope_ancestor_refs(&mut state, condition.target)?;
        let dependencies =
            resolve_dependency_nodes(&condition.dependencies(), condition.target, &ancestors);

        let mut graphs = lock(&self.graphs);
        let graph = graphs.entry(campaign_id).or_default();
        if let Err(err) = graph.add_condition(condition.id, target_node, dependencies) {
            drop(graphs);
            state.delete_condition(campaign_id, condition.id)?;
            return Err(err);
        }
        Ok(condition)
    }

    /// Updates a stored condition and rebuilds its dependency edges.
    pub fn update_condition(
        &self,
        ctx: RequestContext,
        campaign_id: Uuid,
        condition: FieldCondition,
    ) -> CoreResult<FieldCondition> {
        let mut conn = self.conn()?;
        let mut state = StateInterface::new(&mut conn, ctx);
        let condition = state.update_condition(campaign_id, condition)?;

        let target_node = FieldNode::new(condition.target, condition.field.clone());
        let ancestors = scope_ancestor_refs(&mut state, condition.target)?;
        let dependencies =
            resolve_dependency_nodes(&condition.dependencies(), condition.target, &ancestors);

        let mut graphs = lock(&self.graphs);
        let graph = graphs.entry(campaign_id).or_default();
        graph.remove_condition(condition.id);
        graph.add_condition(condition.id, target_node, dependencies)?;
        Ok(condition)
    }

    pub fn unregister_condition(
        &self,
        ctx: RequestContext,
        campaign_id: Uuid,
        condition_id: Uuid,
    ) -> CoreResult<()> {
        let mut conn = self.conn()?;
        let mut state = StateInterface::new(&mut conn, ctx);
        state.delete_condition(campaign_id, condition_id)?;
        lock(&self.graphs)
            .entry(campaign_id)
            .or_default()
            .remove_condition(condition_id);
        Ok(())
    }

    /// `evaluateField` with the per-`(branch, asOf)` cache in front.
    pub fn evaluate_field(
        &self,
        ctx: RequestContext,
        entity: EntityRef,
        field: &str,
        branch_id: Uuid,
        as_of: DateTime<Utc>,
    ) -> CoreResult<Value> {
        let node = FieldNode::new(entity, field.to_string());
        if let Some(hit) = lock(&self.cache).get(branch_id, as_of, &node) {
            return Ok(hit.clone());
        }

        let mut conn = self.conn()?;
        let mut state = StateInterface::new(&mut conn, ctx);
        let value = state.evaluate_field(entity, field, branch_id, as_of)?;
        lock(&self.cache).put(branch_id, as_of, node, value.clone());
        Ok(value)
    }

    /// Authenticated room subscription. Settlement and structure rooms are
    /// resolved to their owning campaign first; membership is required for
    /// every room kind.
    pub fn subscribe(
        &self,
        actor: Uuid,
        room: Room,
    ) -> CoreResult<tokio::sync::broadcast::Receiver<WireEvent>> {
        let mut conn = self.conn()?;
        let campaign_id = match room {
            Room::Campaign(id) => id,
            Room::Settlement(id) => {
                owning_campaign(&mut conn, EntityRef::new(EntityType::Settlement, id))?
            }
            Room::Structure(id) => {
                owning_campaign(&mut conn, EntityRef::new(EntityType::Structure, id))?
            }
        };
        let role = membership_role(&mut conn, campaign_id, actor)?;
        let ticket = auth::authorize_subscription(role, actor, campaign_id)?;
        Ok(self.publisher.subscribe(room, ticket))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn owning_campaign(
    conn: &mut diesel::PgConnection,
    entity: EntityRef,
) -> CoreResult<Uuid> {
    let row: EntityRow = state::entity_row(conn, entity)?;
    Ok(row.campaign_id)
}

fn scope_ancestor_refs(
    state: &mut StateInterface<'_>,
    target: EntityRef,
) -> CoreResult<Vec<EntityRef>> {
    use crate::entity::Entity;

    let mut refs = Vec::new();
    let mut cursor = state.get_entity(target).ok().and_then(|e| e.scope_parent());
    while let Some(parent) = cursor {
        refs.push(parent);
        cursor = state
            .get_entity(parent)
            .ok()
            .and_then(|e| e.scope_parent());
    }
    Ok(refs)
}

/// Maps the variable paths a condition reads onto dependency-graph nodes:
///
/// - `worldTime` is the campaign clock;
/// - `entity.<field>` is a field of the target itself;
/// - `<ancestor type>.<field>` is a field of the matching scope ancestor;
/// - `variables.<name>` may be satisfied anywhere along the chain, so it
///   edges from the target and every ancestor;
/// - `params.*` is caller input and never an edge.
pub fn resolve_dependency_nodes(
    paths: &std::collections::BTreeSet<String>,
    target: EntityRef,
    ancestors: &[EntityRef],
) -> Vec<DepNode> {
    let mut nodes = Vec::new();
    let mut push = |node: DepNode| {
        if !nodes.contains(&node) {
            nodes.push(node);
        }
    };

    for path in paths {
        if path == "worldTime" {
            push(DepNode::WorldTime);
            continue;
        }
        if let Some(field) = path.strip_prefix("entity.") {
            push(DepNode::Field(FieldNode::new(target, field.to_string())));
            continue;
        }
        if path.starts_with("variables.") {
            push(DepNode::Field(FieldNode::new(target, path.clone())));
            for ancestor in ancestors {
                push(DepNode::Field(FieldNode::new(*ancestor, path.clone())));
            }
            continue;
        }
        if path.starts_with("links.") {
            push(DepNode::Field(FieldNode::new(target, path.clone())));
            continue;
        }
        if path.starts_with("params.") || path == "params" {
            continue;
        }
        if let Some((prefix, field)) = path.split_once('.') {
            if let Some(ancestor) = ancestors
                .iter()
                .find(|ancestor| ancestor.ty.as_str() == prefix)
            {
                push(DepNode::Field(FieldNode::new(*ancestor, field.to_string())));
                continue;
            }
            warn!("condition path '{path}' matches no scope ancestor of {target}");
        }
    }
    nodes
}

/// Recompute worker body: re-evaluates each invalidated node in order and
/// publishes an `entity_updated` per changed field. Runs with system
/// authority; the request that caused the invalidation was already
/// authorized.
fn run_recompute_batch(
    pool: &DbPool,
    cache: &Arc<Mutex<ResultCache>>,
    publisher: &Arc<Publisher>,
    batch: RecomputeBatch,
) -> anyhow::Result<()> {
    let mut conn = pool.get()?;
    let ctx = RequestContext::system(batch.branch_id, batch.as_of, batch.correlation_id);

    let mut events = Vec::new();
    {
        let mut state = StateInterface::new(&mut conn, ctx.clone());
        for node in &batch.nodes {
            let value = match state.evaluate_field(
                node.entity,
                &node.field,
                batch.branch_id,
                batch.as_of,
            ) {
                Ok(value) => value,
                Err(err) => {
                    warn!("recompute of {node} failed: {err}");
                    continue;
                }
            };
            lock(cache).put(batch.branch_id, batch.as_of, node.clone(), value.clone());
            events.push(crate::events::OutboundEvent {
                room: Room::Campaign(batch.campaign_id),
                event: WireEvent::new(
                    crate::events::EventType::EntityUpdated,
                    serde_json::json!({
                        "entityType": node.entity.ty,
                        "entityId": node.entity.id,
                        "field": node.field,
                        "value": value,
                    }),
                    &ctx,
                ),
            });
        }
    }
    drop(conn);

    let publisher = publisher.clone();
    tokio::spawn(async move {
        publisher.publish_all(events).await;
    });
    Ok(())
}
