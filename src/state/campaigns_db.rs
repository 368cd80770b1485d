use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::info;
use serde::Serialize;
use uuid::Uuid;

use crate::auth::{self, Permission, Role};
use crate::calendar::Calendar;
use crate::error::{CoreError, CoreResult};
use crate::schema::{campaigns, memberships, worlds};
use crate::spatial::DEFAULT_SRID;
use crate::state::audit_db::{self, AuditOperation, AuditRecord};

#[derive(Identifiable, Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = worlds)]
#[serde(rename_all = "camelCase")]
pub struct WorldRow {
    pub id: Uuid,
    pub name: String,
    pub owner_id: Uuid,
    pub calendar: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl WorldRow {
    pub fn calendar(&self) -> CoreResult<Option<Calendar>> {
        match &self.calendar {
            None => Ok(None),
            Some(raw) => serde_json::from_value(raw.clone())
                .map(Some)
                .map_err(|err| {
                    CoreError::integrity(format!("world {} has a bad calendar: {err}", self.id))
                }),
        }
    }
}

#[derive(Identifiable, Queryable, Debug, Clone, PartialEq, Serialize)]
#[diesel(table_name = campaigns)]
#[serde(rename_all = "camelCase")]
pub struct CampaignRow {
    pub id: Uuid,
    pub world_id: Uuid,
    pub name: String,
    pub srid: i32,
    pub current_world_time: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Insertable)]
#[diesel(table_name = worlds)]
struct NewWorld {
    id: Uuid,
    name: String,
    owner_id: Uuid,
    calendar: Option<serde_json::Value>,
}

#[derive(Insertable)]
#[diesel(table_name = campaigns)]
struct NewCampaign {
    id: Uuid,
    world_id: Uuid,
    name: String,
    srid: i32,
}

#[derive(Insertable)]
#[diesel(table_name = memberships)]
struct NewMembership {
    campaign_id: Uuid,
    user_id: Uuid,
    role: Role,
}

pub fn get_world(conn: &mut PgConnection, id: Uuid) -> CoreResult<WorldRow> {
    use crate::schema::worlds::dsl as worlds;

    worlds::worlds
        .find(id)
        .filter(worlds::deleted_at.is_null())
        .first(conn)
        .optional()?
        .ok_or_else(|| CoreError::integrity(format!("world {id} does not exist")))
}

pub fn get_campaign(conn: &mut PgConnection, id: Uuid) -> CoreResult<CampaignRow> {
    use crate::schema::campaigns::dsl as campaigns;

    campaigns::campaigns
        .find(id)
        .filter(campaigns::deleted_at.is_null())
        .first(conn)
        .optional()?
        .ok_or(CoreError::CampaignNotFound(id))
}

pub fn create_world(
    conn: &mut PgConnection,
    name: String,
    owner: Uuid,
    calendar: Option<&Calendar>,
) -> CoreResult<WorldRow> {
    use crate::schema::worlds::dsl as worlds;

    if let Some(calendar) = calendar {
        calendar.check_definition()?;
    }
    let calendar = calendar
        .map(serde_json::to_value)
        .transpose()
        .map_err(|err| CoreError::integrity(format!("unserializable calendar: {err}")))?;
    Ok(diesel::insert_into(worlds::worlds)
        .values(NewWorld {
            id: Uuid::new_v4(),
            name,
            owner_id: owner,
            calendar,
        })
        .get_result(conn)?)
}

/// Creates a campaign with its owner membership and root branch.
pub fn create_campaign(
    conn: &mut PgConnection,
    world_id: Uuid,
    name: String,
    srid: Option<i32>,
    owner: Uuid,
) -> CoreResult<CampaignRow> {
    use crate::schema::campaigns::dsl as campaigns;

    conn.transaction(|conn| {
        get_world(conn, world_id)?;
        let row: CampaignRow = diesel::insert_into(campaigns::campaigns)
            .values(NewCampaign {
                id: Uuid::new_v4(),
                world_id,
                name,
                srid: srid.unwrap_or(DEFAULT_SRID),
            })
            .get_result(conn)?;
        add_member(conn, row.id, owner, Role::Owner)?;
        crate::state::branches_db::create(
            conn,
            row.id,
            crate::state::branches_db::BranchInput {
                name: "main".to_string(),
                ..Default::default()
            },
            owner,
        )?;
        Ok(row)
    })
}

pub fn add_member(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    user_id: Uuid,
    role: Role,
) -> CoreResult<()> {
    use crate::schema::memberships::dsl as memberships;

    diesel::insert_into(memberships::memberships)
        .values(NewMembership {
            campaign_id,
            user_id,
            role,
        })
        .execute(conn)?;
    Ok(())
}

pub fn membership_role(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    user_id: Uuid,
) -> CoreResult<Option<Role>> {
    use crate::schema::memberships::dsl as memberships;

    Ok(memberships::memberships
        .filter(memberships::campaign_id.eq(campaign_id))
        .filter(memberships::user_id.eq(user_id))
        .select(memberships::role)
        .first(conn)
        .optional()?)
}

/// The pure half of the advance decision: optimistic counter first, then
/// strict monotonicity once a clock is set.
pub fn check_advance(
    campaign: &CampaignRow,
    to: DateTime<Utc>,
    expected_version: i32,
) -> CoreResult<()> {
    if campaign.version != expected_version {
        return Err(CoreError::VersionConflict {
            entity: format!("campaign {}", campaign.id),
            expected: expected_version,
            found: campaign.version,
        });
    }
    if let Some(current) = campaign.current_world_time {
        if to <= current {
            return Err(CoreError::PastOrEqualTime {
                current,
                proposed: to,
            });
        }
    }
    Ok(())
}

/// Advances the campaign clock. OWNER or GM only; strictly monotonic once
/// set; the campaign row's version counter is the optimistic lock, and the
/// clock update plus its audit entry share one transaction.
pub fn advance_world_time(
    conn: &mut PgConnection,
    campaign_id: Uuid,
    to: DateTime<Utc>,
    actor: Uuid,
    expected_version: i32,
) -> CoreResult<CampaignRow> {
    use crate::schema::campaigns::dsl as campaigns;

    conn.transaction(|conn| {
        let role = membership_role(conn, campaign_id, actor)?;
        auth::require(role, Permission::CampaignWrite, actor, campaign_id)?;

        let campaign = get_campaign(conn, campaign_id)?;
        check_advance(&campaign, to, expected_version)?;
        if let Some(calendar) = get_world(conn, campaign.world_id)?.calendar()? {
            let outcome = crate::calendar::validate_world_date(to, Some(&calendar));
            if let Some(error) = outcome.error {
                return Err(CoreError::Validation(error));
            }
        }

        // The predicate re-checks the counter so a racing advance in another
        // transaction loses cleanly instead of double-applying.
        let updated: Option<CampaignRow> = diesel::update(
            campaigns::campaigns
                .find(campaign_id)
                .filter(campaigns::version.eq(expected_version)),
        )
        .set((
            campaigns::current_world_time.eq(Some(to)),
            campaigns::version.eq(expected_version + 1),
        ))
        .get_result(conn)
        .optional()?;
        let updated = updated.ok_or_else(|| CoreError::VersionConflict {
            entity: format!("campaign {campaign_id}"),
            expected: expected_version,
            found: expected_version + 1,
        })?;

        audit_db::record(
            conn,
            AuditRecord::new("campaign", campaign_id, AuditOperation::Update, actor)
                .with_states(
                    Some(serde_json::json!({
                        "currentWorldTime": campaign.current_world_time,
                    })),
                    Some(serde_json::json!({
                        "currentWorldTime": updated.current_world_time,
                    })),
                )
                .with_reason("world time advanced"),
        )?;
        info!(
            "campaign {campaign_id} world time -> {}",
            to.to_rfc3339()
        );
        Ok(updated)
    })
}
