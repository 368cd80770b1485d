use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Correlation id threaded through long operations (fork, merge, recompute)
/// so clients can follow progress events belonging to one logical request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        CorrelationId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Explicit per-request context. Every operation takes one of these instead
/// of consulting any ambient "current user" or "current branch" state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub actor: Uuid,
    pub branch_id: Uuid,
    /// World time the request reads at. Mutations stamp new versions with it.
    pub world_time: DateTime<Utc>,
    pub correlation_id: CorrelationId,
    system: bool,
}

impl RequestContext {
    pub fn new(actor: Uuid, branch_id: Uuid, world_time: DateTime<Utc>) -> Self {
        RequestContext {
            actor,
            branch_id,
            world_time,
            correlation_id: CorrelationId::new(),
            system: false,
        }
    }

    /// Internal-worker context: recomputation runs with system authority
    /// because the mutation that scheduled it was already authorized.
    pub fn system(
        branch_id: Uuid,
        world_time: DateTime<Utc>,
        correlation_id: CorrelationId,
    ) -> Self {
        RequestContext {
            actor: Uuid::nil(),
            branch_id,
            world_time,
            correlation_id,
            system: true,
        }
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Same actor and correlation, different branch. Used by merge and
    /// cherry-pick, which read from one branch and write to another.
    pub fn on_branch(&self, branch_id: Uuid) -> Self {
        RequestContext {
            branch_id,
            ..self.clone()
        }
    }
}
