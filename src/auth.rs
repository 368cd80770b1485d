use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Campaign membership roles, strongest first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    DbEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[ExistingTypePath = "crate::schema::sql_types::CampaignRole"]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Owner,
    Gm,
    Player,
    Viewer,
}

/// Everything a role can be asked for. Checked in front of every mutation
/// and on reads that reach a non-member actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    CampaignRead,
    CampaignWrite,
    CampaignDelete,
    BranchRead,
    BranchCreate,
    BranchWrite,
    BranchDelete,
    AuditRead,
    AuditExport,
    SpatialRead,
    SpatialWrite,
    EffectExecute,
}

impl Role {
    pub fn allows(&self, permission: Permission) -> bool {
        use Permission::*;
        match self {
            Role::Owner => true,
            // GMs run the table but cannot delete campaigns or branches.
            Role::Gm => !matches!(permission, CampaignDelete | BranchDelete),
            Role::Player | Role::Viewer => matches!(
                permission,
                CampaignRead | BranchRead | AuditRead | SpatialRead
            ),
        }
    }

    /// Whether audit queries show every actor's entries or only the
    /// caller's own.
    pub fn sees_all_audits(&self) -> bool {
        matches!(self, Role::Owner | Role::Gm)
    }
}

/// Fails with `Unauthorized` unless the actor holds a role granting the
/// permission. `role` is the membership lookup result; `None` means the
/// actor is not a member at all.
pub fn require(
    role: Option<Role>,
    permission: Permission,
    actor: Uuid,
    campaign: Uuid,
) -> CoreResult<Role> {
    match role {
        Some(role) if role.allows(permission) => Ok(role),
        _ => Err(CoreError::Unauthorized {
            actor,
            campaign,
            permission,
        }),
    }
}

/// Proof that a subscription passed the membership check. Constructed only
/// here, so the publisher cannot hand out a room without one.
#[derive(Debug, Clone, Copy)]
pub struct RoomTicket {
    campaign: Uuid,
}

impl RoomTicket {
    pub fn campaign(&self) -> Uuid {
        self.campaign
    }
}

/// Membership gate for event rooms. Settlement and structure rooms resolve
/// to their owning campaign before this check, so every room kind requires
/// membership.
pub fn authorize_subscription(
    role: Option<Role>,
    actor: Uuid,
    campaign: Uuid,
) -> CoreResult<RoomTicket> {
    require(role, Permission::CampaignRead, actor, campaign)?;
    Ok(RoomTicket { campaign })
}
