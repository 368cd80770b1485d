use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{Entity, EntityRef, EntityType, Variables};

pub const PARTY_LEVEL_MIN: i32 = 1;
pub const PARTY_LEVEL_MAX: i32 = 20;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub id: Uuid,
    pub name: String,
    pub level: i32,
    #[serde(default)]
    pub member_ids: Vec<Uuid>,
    #[serde(default)]
    pub variables: Variables,
}

impl Display for Party {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Party {}", self.name)
    }
}

impl Entity for Party {
    fn entity_type(&self) -> EntityType {
        EntityType::Party
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!(
            "Party {} (level {}, {} member(s))",
            self.name,
            self.level,
            self.member_ids.len()
        )
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    fn validate(&self) -> Result<(), String> {
        if !(PARTY_LEVEL_MIN..=PARTY_LEVEL_MAX).contains(&self.level) {
            return Err(format!(
                "party level must be within {PARTY_LEVEL_MIN}..={PARTY_LEVEL_MAX}, got {}",
                self.level
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct Character {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub party_id: Option<Uuid>,
    pub level: i32,
    #[serde(default)]
    pub ancestry: Option<String>,
    #[serde(default)]
    pub class: Option<String>,
    #[serde(default)]
    pub variables: Variables,
}

impl Display for Character {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Character {}", self.name)
    }
}

impl Entity for Character {
    fn entity_type(&self) -> EntityType {
        EntityType::Character
    }

    fn id(&self) -> Uuid {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Character {} (level {})", self.name, self.level)
    }

    fn variables(&self) -> &Variables {
        &self.variables
    }

    fn variables_mut(&mut self) -> &mut Variables {
        &mut self.variables
    }

    fn scope_parent(&self) -> Option<EntityRef> {
        self.party_id.map(|id| EntityRef::new(EntityType::Party, id))
    }

    fn validate(&self) -> Result<(), String> {
        if self.level < 1 {
            return Err(format!("character level must be >= 1, got {}", self.level));
        }
        Ok(())
    }
}
