use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Entity, EntityType, Variables};
use crate::spatial::Geometry;

/// A named place on the world map. The only entity kind that owns geometry;
/// settlements borrow theirs through their 1:1 location binding.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub geom: Option<Geometry>,
    #[serde(default)]
    pub variables: Variables,
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Location {}", self.name)
    }
}

impl Entity for Location {
    fn entity_type(&self) -> EntityType {
        EntityType::Location
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        match &self.geom {
            Some(geom) => format!("Location {} ({})", self.name, geom.kind()),
            None => format!("Location {} (no geometry)", self.name),
        }
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    fn validate(&self) -> Result<(), String> {
        if let Some(geom) = &self.geom {
            crate::spatial::validate_geometry(geom).map_err(|err| err.to_string())?;
        }
        Ok(())
    }
}
