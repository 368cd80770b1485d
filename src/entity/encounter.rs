use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Entity, EntityType, Variables};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct Encounter {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub location_id: Option<Uuid>,
    #[serde(default)]
    pub difficulty: Option<String>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variables: Variables,
}

impl Display for Encounter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Encounter {}", self.name)
    }
}

impl Entity for Encounter {
    fn entity_type(&self) -> EntityType {
        EntityType::Encounter
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        if self.resolved {
            format!("Encounter {} (resolved)", self.name)
        } else {
            format!("Encounter {}", self.name)
        }
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    fn validate(&self) -> Result<(), String> {
        if self.resolved_at.is_some() && !self.resolved {
            return Err("encounter has a resolution time but is not resolved".to_string());
        }
        Ok(())
    }
}

/// A scheduled or historical happening on the world timeline. Named
/// `WorldEvent` to keep it apart from the publisher's wire events.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct WorldEvent {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub occurs_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variables: Variables,
}

impl Display for WorldEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event {}", self.name)
    }
}

impl Entity for WorldEvent {
    fn entity_type(&self) -> EntityType {
        EntityType::Event
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Event {}", self.name)
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }
}
