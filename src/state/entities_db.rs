use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::entity::{AnyEntity, Entity, EntityRef, EntityType};
use crate::error::{CoreError, CoreResult};
use crate::schema::entities;
use crate::spatial::{geometry_to_wkb, wkb_to_geometry, Geometry};

/// Registry row for one entity: identity, parent refs and the latest
/// geometry, denormalized out of the version payloads so listings and
/// spatial prefilters never decompress anything.
#[derive(Identifiable, Queryable, Debug, Clone, PartialEq)]
#[diesel(table_name = entities)]
#[diesel(primary_key(entity_type, id))]
pub struct EntityRow {
    pub entity_type: String,
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub name: String,
    pub parent_type: Option<String>,
    pub parent_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub geom_wkb: Option<Vec<u8>>,
    pub srid: Option<i32>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl EntityRow {
    pub fn entity_ref(&self) -> CoreResult<EntityRef> {
        let ty = EntityType::parse(&self.entity_type).ok_or_else(|| {
            CoreError::integrity(format!("registry holds unknown type '{}'", self.entity_type))
        })?;
        Ok(EntityRef::new(ty, self.id))
    }

    pub fn geometry(&self) -> CoreResult<Option<Geometry>> {
        self.geom_wkb
            .as_deref()
            .map(wkb_to_geometry)
            .transpose()
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Insertable)]
#[diesel(table_name = entities)]
struct NewEntityRow {
    entity_type: String,
    id: Uuid,
    campaign_id: Uuid,
    name: String,
    parent_type: Option<String>,
    parent_id: Option<Uuid>,
    location_id: Option<Uuid>,
    geom_wkb: Option<Vec<u8>>,
    srid: Option<i32>,
    version: i32,
}

/// The ownership edge used for cascade archival, per variant.
fn parent_of(entity: &AnyEntity) -> Option<EntityRef> {
    match entity {
        AnyEntity::Settlement(settlement) => settlement
            .kingdom_id
            .map(|id| EntityRef::new(EntityType::Kingdom, id)),
        AnyEntity::Structure(structure) => Some(EntityRef::new(
            EntityType::Settlement,
            structure.settlement_id,
        )),
        AnyEntity::Character(character) => character
            .party_id
            .map(|id| EntityRef::new(EntityType::Party, id)),
        _ => None,
    }
}

fn location_binding(entity: &AnyEntity) -> Option<Uuid> {
    match entity {
        AnyEntity::Settlement(settlement) => Some(settlement.location_id),
        AnyEntity::Encounter(encounter) => encounter.location_id,
        _ => None,
    }
}

fn geometry_cache(entity: &AnyEntity) -> CoreResult<(Option<Vec<u8>>, Option<i32>)> {
    match entity.own_geometry() {
        Some(geom) => Ok((Some(geometry_to_wkb(geom)?), Some(geom.srid()))),
        None => Ok((None, None)),
    }
}

pub fn register(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    entity: &AnyEntity,
    version: i32,
) -> CoreResult<()> {
    use crate::schema::entities::dsl as entities;

    let (geom_wkb, srid) = geometry_cache(entity)?;
    diesel::insert_into(entities::entities)
        .values(NewEntityRow {
            entity_type: entity.entity_type().as_str().to_string(),
            id: entity.id(),
            campaign_id,
            name: entity.name().to_string(),
            parent_type: parent_of(entity).map(|p| p.ty.as_str().to_string()),
            parent_id: parent_of(entity).map(|p| p.id),
            location_id: location_binding(entity),
            geom_wkb,
            srid,
            version,
        })
        .execute(conn)?;
    Ok(())
}

/// Refreshes the denormalized columns after a new version is written.
pub fn touch(conn: &mut PgConnection, entity: &AnyEntity, version: i32) -> CoreResult<()> {
    use crate::schema::entities::dsl as entities;

    let (geom_wkb, srid) = geometry_cache(entity)?;
    let updated = diesel::update(
        entities::entities.find((entity.entity_type().as_str(), entity.id())),
    )
    .set((
        entities::name.eq(entity.name().to_string()),
        entities::parent_type.eq(parent_of(entity).map(|p| p.ty.as_str().to_string())),
        entities::parent_id.eq(parent_of(entity).map(|p| p.id)),
        entities::location_id.eq(location_binding(entity)),
        entities::geom_wkb.eq(geom_wkb),
        entities::srid.eq(srid),
        entities::version.eq(version),
    ))
    .execute(conn)?;
    if updated == 0 {
        return Err(CoreError::EntityNotFound {
            ty: entity.entity_type(),
            id: entity.id(),
        });
    }
    Ok(())
}

pub fn get_row(conn: &mut PgConnection, entity: EntityRef) -> CoreResult<EntityRow> {
    use crate::schema::entities::dsl as entities;

    entities::entities
        .find((entity.ty.as_str(), entity.id))
        .first(conn)
        .optional()?
        .ok_or(CoreError::EntityNotFound {
            ty: entity.ty,
            id: entity.id,
        })
}

pub fn get_live_row(conn: &mut PgConnection, entity: EntityRef) -> CoreResult<EntityRow> {
    let row = get_row(conn, entity)?;
    if !row.is_live() {
        return Err(CoreError::EntityNotFound {
            ty: entity.ty,
            id: entity.id,
        });
    }
    Ok(row)
}

pub fn list(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    ty: Option<EntityType>,
    include_deleted: bool,
) -> CoreResult<Vec<EntityRow>> {
    use crate::schema::entities::dsl as entities;

    let mut query = entities::entities
        .filter(entities::campaign_id.eq(campaign_id))
        .into_boxed();
    if let Some(ty) = ty {
        query = query.filter(entities::entity_type.eq(ty.as_str()));
    }
    if !include_deleted {
        query = query.filter(entities::deleted_at.is_null());
    }
    Ok(query.order(entities::created_at.asc()).load(conn)?)
}

/// Entities owned (directly or transitively) by `root`, the cascade set for
/// archive and restore. Includes the root itself, parents before children.
pub fn ownership_cascade(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    root: EntityRef,
) -> CoreResult<Vec<EntityRef>> {
    let rows = list(conn, campaign_id, None, true)?;
    let mut cascade = vec![root];
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for row in &rows {
            if row.parent_type.as_deref() == Some(parent.ty.as_str())
                && row.parent_id == Some(parent.id)
            {
                let child = row.entity_ref()?;
                if !cascade.contains(&child) {
                    cascade.push(child);
                    frontier.push(child);
                }
            }
        }
    }
    Ok(cascade)
}

pub fn set_deleted(
    conn: &mut PgConnection,
    entity: EntityRef,
    deleted_at: Option<DateTime<Utc>>,
) -> CoreResult<()> {
    use crate::schema::entities::dsl as entities;

    let updated = diesel::update(entities::entities.find((entity.ty.as_str(), entity.id)))
        .set(entities::deleted_at.eq(deleted_at))
        .execute(conn)?;
    if updated == 0 {
        return Err(CoreError::EntityNotFound {
            ty: entity.ty,
            id: entity.id,
        });
    }
    Ok(())
}

/// Hard delete of the registry row; version history stays untouched.
pub fn hard_delete(conn: &mut PgConnection, entity: EntityRef) -> CoreResult<()> {
    use crate::schema::entities::dsl as entities;

    diesel::delete(entities::entities.find((entity.ty.as_str(), entity.id))).execute(conn)?;
    Ok(())
}

/// Live locations with geometry, ready for the spatial queries.
pub fn live_locations(
    conn: &mut PgConnection,
    campaign_id: Uuid,
) -> CoreResult<Vec<(Uuid, Geometry)>> {
    let rows = list(conn, campaign_id, Some(EntityType::Location), false)?;
    let mut out = Vec::new();
    for row in rows {
        if let Some(geometry) = row.geometry()? {
            out.push((row.id, geometry));
        }
    }
    Ok(out)
}

/// Live settlements with their bound location id.
pub fn live_settlements(
    conn: &mut PgConnection,
    campaign_id: Uuid,
) -> CoreResult<Vec<EntityRow>> {
    list(conn, campaign_id, Some(EntityType::Settlement), false)
}
