use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Entity, EntityType, Variables};

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct Kingdom {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Settlement that serves as the capital, if one is designated.
    #[serde(default)]
    pub capital_id: Option<Uuid>,
    #[serde(default)]
    pub variables: Variables,
}

impl Display for Kingdom {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Kingdom {}", self.name)
    }
}

impl Entity for Kingdom {
    fn entity_type(&self) -> EntityType {
        EntityType::Kingdom
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Kingdom {}", self.name)
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }
}
