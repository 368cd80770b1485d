use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::auth::Permission;
use crate::entity::EntityType;

/// Error taxonomy for the world-state core. The transport layer maps these to
/// stable error codes; messages here never leak connection strings or SQL.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{ty} {id} does not exist")]
    EntityNotFound { ty: EntityType, id: Uuid },

    #[error("branch {0} does not exist")]
    BranchNotFound(Uuid),

    #[error("campaign {0} does not exist")]
    CampaignNotFound(Uuid),

    #[error("actor {actor} lacks {permission} on campaign {campaign}")]
    Unauthorized {
        actor: Uuid,
        campaign: Uuid,
        permission: Permission,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("version conflict on {entity}: expected version {expected}, found {found}")]
    VersionConflict {
        entity: String,
        expected: i32,
        found: i32,
    },

    #[error("world time {proposed} is not after current world time {current}")]
    PastOrEqualTime {
        current: DateTime<Utc>,
        proposed: DateTime<Utc>,
    },

    #[error("circular dependency: {}", path.join(" -> "))]
    CircularDependency { path: Vec<String> },

    #[error("merge aborted: {0} conflict(s) left unresolved")]
    UnresolvedConflicts(usize),

    #[error("schema change invalidates stored values: {0}")]
    SchemaIncompatible(String),

    #[error("condition {condition_id} failed to evaluate: {cause}")]
    ConditionFailed { condition_id: Uuid, cause: String },

    #[error("downstream recompute failed after rollback: {0}")]
    DependencyFailed(String),

    #[error("integrity error: {0}")]
    Integrity(String),

    #[error(transparent)]
    Database(#[from] diesel::result::Error),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        CoreError::Validation(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        CoreError::Integrity(msg.into())
    }

    /// Whether a client retry with a refreshed version can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::VersionConflict { .. })
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
