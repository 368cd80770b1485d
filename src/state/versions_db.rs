use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use itertools::Itertools;
use uuid::Uuid;

use crate::codec::{compress_payload, decompress_payload};
use crate::entity::{AnyEntity, EntityRef, EntityType};
use crate::error::{CoreError, CoreResult};
use crate::schema::versions;
use crate::state::branches_db::AncestryBranch;

#[derive(Insertable)]
#[diesel(table_name = versions)]
pub(crate) struct NewVersion {
    pub entity_type: String,
    pub entity_id: Uuid,
    pub branch_id: Uuid,
    pub valid_from: DateTime<Utc>,
    pub version: i32,
    pub payload_gz: Vec<u8>,
    pub actor_id: Uuid,
}

#[derive(Identifiable, Queryable, PartialEq, Debug, Clone)]
#[diesel(table_name = versions)]
pub(crate) struct DbVersion {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub branch_id: Uuid,
    pub valid_from: DateTime<Utc>,
    pub version: i32,
    pub payload_gz: Vec<u8>,
    pub actor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl DbVersion {
    fn parse(self) -> CoreResult<StoredVersion> {
        let ty = EntityType::parse(&self.entity_type).ok_or_else(|| {
            CoreError::integrity(format!("unknown entity type '{}' in store", self.entity_type))
        })?;
        Ok(StoredVersion {
            id: self.id,
            entity: EntityRef::new(ty, self.entity_id),
            branch_id: self.branch_id,
            valid_from: self.valid_from,
            version: self.version,
            payload_gz: self.payload_gz,
            actor_id: self.actor_id,
            created_at: self.created_at,
        })
    }
}

/// An immutable snapshot. The compressed bytes stay opaque until a caller
/// asks for the payload; fork copies them without a decompress cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVersion {
    pub id: i64,
    pub entity: EntityRef,
    pub branch_id: Uuid,
    pub valid_from: DateTime<Utc>,
    pub version: i32,
    pub payload_gz: Vec<u8>,
    pub actor_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl StoredVersion {
    pub fn payload(&self) -> CoreResult<serde_json::Value> {
        decompress_payload(&self.payload_gz)
    }

    pub fn entity_state(&self) -> CoreResult<AnyEntity> {
        let payload = self.payload()?;
        AnyEntity::from_payload(self.entity.ty, payload).map_err(|err| {
            CoreError::integrity(format!("stored payload for {} is invalid: {err}", self.entity))
        })
    }
}

/// Writes a snapshot, bumping the per-`(entity, branch)` counter. With
/// `expected_version` the write only succeeds while the caller saw the
/// latest counter; the check and the increment share one transaction, and
/// the unique `(entity, branch, valid_from, version)` index backs it against
/// racing writers.
pub fn create_version(
    conn: &mut PgConnection,
    entity: EntityRef,
    branch_id: Uuid,
    payload: &serde_json::Value,
    valid_from: DateTime<Utc>,
    actor: Uuid,
    expected_version: Option<i32>,
) -> CoreResult<StoredVersion> {
    let payload_gz = compress_payload(payload)?;
    conn.transaction(|conn| {
        let current = latest_counter(conn, entity, branch_id)?;
        if let Some(expected) = expected_version {
            if current != expected {
                return Err(CoreError::VersionConflict {
                    entity: entity.to_string(),
                    expected,
                    found: current,
                });
            }
        }
        insert_raw(
            conn,
            entity,
            branch_id,
            valid_from,
            current + 1,
            payload_gz.clone(),
            actor,
        )
    })
}

/// The latest version counter for an entity in a branch, 0 when unversioned.
pub fn latest_counter(
    conn: &mut PgConnection,
    entity: EntityRef,
    branch_id: Uuid,
) -> CoreResult<i32> {
    use diesel::dsl::max;
    use crate::schema::versions::dsl as versions;

    let current: Option<i32> = versions::versions
        .filter(versions::entity_type.eq(entity.ty.as_str()))
        .filter(versions::entity_id.eq(entity.id))
        .filter(versions::branch_id.eq(branch_id))
        .select(max(versions::version))
        .first(conn)?;
    Ok(current.unwrap_or(0))
}

pub(crate) fn insert_raw(
    conn: &mut PgConnection,
    entity: EntityRef,
    branch_id: Uuid,
    valid_from: DateTime<Utc>,
    version: i32,
    payload_gz: Vec<u8>,
    actor: Uuid,
) -> CoreResult<StoredVersion> {
    use crate::schema::versions::dsl as versions;

    let row: DbVersion = diesel::insert_into(versions::versions)
        .values(NewVersion {
            entity_type: entity.ty.as_str().to_string(),
            entity_id: entity.id,
            branch_id,
            valid_from,
            version,
            payload_gz,
            actor_id: actor,
        })
        .get_result(conn)?;
    row.parse()
}

/// Resolves the version visible in `chain[0]` at `as_of`, walking the
/// ancestry. See [`resolve_from_candidates`] for the selection rules.
pub fn resolve_version(
    conn: &mut PgConnection,
    entity: EntityRef,
    chain: &[AncestryBranch],
    as_of: DateTime<Utc>,
) -> CoreResult<Option<StoredVersion>> {
    use crate::schema::versions::dsl as versions;

    let branch_ids: Vec<Uuid> = chain.iter().map(|link| link.branch_id).collect();
    let rows: Vec<DbVersion> = versions::versions
        .filter(versions::entity_type.eq(entity.ty.as_str()))
        .filter(versions::entity_id.eq(entity.id))
        .filter(versions::branch_id.eq_any(branch_ids))
        .filter(versions::valid_from.le(as_of))
        .load(conn)?;

    let candidates = rows
        .into_iter()
        .map(DbVersion::parse)
        .collect::<CoreResult<Vec<_>>>()?;
    Ok(resolve_from_candidates(chain, &candidates, as_of))
}

/// Pure ancestry resolution over loaded candidates.
///
/// Walking from the branch itself to the root:
/// - a branch's best candidate is the greatest `(validFrom, version)` with
///   `validFrom <= asOf`;
/// - a candidate at or before the branch's own `divergedAt` defers to the
///   parent (fork copies carry `validFrom == divergedAt`, and the parent
///   holds the identical bytes);
/// - moving to the parent clamps `asOf` to the child's `divergedAt`, so a
///   parent's post-fork history never leaks into the child.
pub fn resolve_from_candidates(
    chain: &[AncestryBranch],
    candidates: &[StoredVersion],
    as_of: DateTime<Utc>,
) -> Option<StoredVersion> {
    let mut by_branch: HashMap<Uuid, Vec<&StoredVersion>> = HashMap::new();
    for candidate in candidates {
        by_branch
            .entry(candidate.branch_id)
            .or_default()
            .push(candidate);
    }

    let mut effective_as_of = as_of;
    for link in chain {
        let best = by_branch.get(&link.branch_id).and_then(|versions| {
            versions
                .iter()
                .filter(|v| v.valid_from <= effective_as_of)
                .max_by_key(|v| (v.valid_from, v.version))
        });

        if let Some(best) = best {
            match link.diverged_at {
                Some(diverged_at) if best.valid_from <= diverged_at => {
                    // pre-divergence content; the parent owns it
                }
                _ => return Some((*best).clone()),
            }
        }

        if let Some(diverged_at) = link.diverged_at {
            effective_as_of = effective_as_of.min(diverged_at);
        }
    }
    None
}

pub fn get_by_id(conn: &mut PgConnection, id: i64) -> CoreResult<StoredVersion> {
    use crate::schema::versions::dsl as versions;

    let row: DbVersion = versions::versions
        .find(id)
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::integrity(format!("version {id} does not exist")))?;
    row.parse()
}

/// Version history of one entity in one branch, newest first.
pub fn list_versions(
    conn: &mut PgConnection,
    entity: EntityRef,
    branch_id: Uuid,
) -> CoreResult<Vec<StoredVersion>> {
    use crate::schema::versions::dsl as versions;

    let rows: Vec<DbVersion> = versions::versions
        .filter(versions::entity_type.eq(entity.ty.as_str()))
        .filter(versions::entity_id.eq(entity.id))
        .filter(versions::branch_id.eq(branch_id))
        .order((versions::valid_from.desc(), versions::version.desc()))
        .load(conn)?;
    rows.into_iter().map(DbVersion::parse).collect()
}

/// Every entity with any version visible at `as_of` across the chain,
/// with the rows needed to resolve each. Used by fork.
pub(crate) fn load_chain_candidates(
    conn: &mut PgConnection,
    chain: &[AncestryBranch],
    as_of: DateTime<Utc>,
) -> CoreResult<HashMap<EntityRef, Vec<StoredVersion>>> {
    use crate::schema::versions::dsl as versions;

    let branch_ids: Vec<Uuid> = chain.iter().map(|link| link.branch_id).collect();
    let rows: Vec<DbVersion> = versions::versions
        .filter(versions::branch_id.eq_any(branch_ids))
        .filter(versions::valid_from.le(as_of))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(DbVersion::parse)
        .collect::<CoreResult<Vec<_>>>()?
        .into_iter()
        .into_group_map_by(|version| version.entity))
}
