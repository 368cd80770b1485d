use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::{CorrelationId, RequestContext};

/// Change-event kinds pushed to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventType {
    EntityUpdated,
    StateInvalidated,
    WorldTimeChanged,
    SettlementUpdated,
    StructureUpdated,
}

/// A subscription target. Settlement and structure rooms exist so clients
/// can watch one place without the whole campaign firehose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Room {
    Campaign(Uuid),
    Settlement(Uuid),
    Structure(Uuid),
}

impl Display for Room {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Room::Campaign(id) => write!(f, "campaign:{id}"),
            Room::Settlement(id) => write!(f, "settlement:{id}"),
            Room::Structure(id) => write!(f, "structure:{id}"),
        }
    }
}

impl FromStr for Room {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, raw_id) = s.split_once(':').ok_or_else(|| format!("bad room '{s}'"))?;
        let id = Uuid::parse_str(raw_id).map_err(|err| format!("bad room '{s}': {err}"))?;
        match kind {
            "campaign" => Ok(Room::Campaign(id)),
            "settlement" => Ok(Room::Settlement(id)),
            "structure" => Ok(Room::Structure(id)),
            other => Err(format!("unknown room kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    pub user_id: Uuid,
    pub source: String,
    pub correlation_id: CorrelationId,
}

/// The wire shape subscribers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub metadata: EventMetadata,
}

impl WireEvent {
    pub fn new(event_type: EventType, payload: Value, ctx: &RequestContext) -> Self {
        WireEvent {
            event_type,
            timestamp: Utc::now(),
            payload,
            metadata: EventMetadata {
                user_id: ctx.actor,
                source: "core".to_string(),
                correlation_id: ctx.correlation_id,
            },
        }
    }
}

/// An event bound for a room, buffered until its transaction commits.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEvent {
    pub room: Room,
    pub event: WireEvent,
}
