use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Entity, EntityRef, EntityType, Variables};

/// A populated place inside a kingdom, bound 1:1 to a Location for its
/// geometry. Deleting the parent kingdom cascades here.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct Settlement {
    pub id: Uuid,
    pub name: String,
    pub location_id: Uuid,
    #[serde(default)]
    pub kingdom_id: Option<Uuid>,
    pub level: i32,
    #[serde(default)]
    pub population: Option<i64>,
    #[serde(default)]
    pub variables: Variables,
}

impl Display for Settlement {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Settlement {}", self.name)
    }
}

impl Entity for Settlement {
    fn entity_type(&self) -> EntityType {
        EntityType::Settlement
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Settlement {} (level {})", self.name, self.level)
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    fn scope_parent(&self) -> Option<EntityRef> {
        self.kingdom_id
            .map(|id| EntityRef::new(EntityType::Kingdom, id))
    }

    fn validate(&self) -> Result<(), String> {
        if self.level < 1 {
            return Err(format!("settlement level must be >= 1, got {}", self.level));
        }
        if matches!(self.population, Some(p) if p < 0) {
            return Err("settlement population cannot be negative".to_string());
        }
        Ok(())
    }
}

/// A building within a settlement. Structures have no geometry of their own;
/// spatial queries answer for them through the settlement's location.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct Structure {
    pub id: Uuid,
    pub name: String,
    pub settlement_id: Uuid,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub variables: Variables,
}

impl Display for Structure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Structure {}", self.name)
    }
}

impl Entity for Structure {
    fn entity_type(&self) -> EntityType {
        EntityType::Structure
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        match &self.kind {
            Some(kind) => format!("Structure {} ({kind})", self.name),
            None => format!("Structure {}", self.name),
        }
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    fn scope_parent(&self) -> Option<EntityRef> {
        Some(EntityRef::new(EntityType::Settlement, self.settlement_id))
    }
}
