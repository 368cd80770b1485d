// Entity variants
mod encounter;
mod kingdom;
mod location;
mod party;
mod settlement;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use derive_more::{From, TryInto};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use encounter::{Encounter, WorldEvent};
pub use kingdom::Kingdom;
pub use location::Location;
pub use party::{Character, Party};
pub use settlement::{Settlement, Structure};

use crate::spatial::Geometry;

/// The closed set of versioned entity kinds. Worlds and campaigns are
/// containers, not versioned entities, so they are not listed here.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntityType {
    Location,
    Kingdom,
    Settlement,
    Structure,
    Party,
    Character,
    Encounter,
    Event,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Location => "location",
            EntityType::Kingdom => "kingdom",
            EntityType::Settlement => "settlement",
            EntityType::Structure => "structure",
            EntityType::Party => "party",
            EntityType::Character => "character",
            EntityType::Encounter => "encounter",
            EntityType::Event => "event",
        }
    }

    pub fn parse(s: &str) -> Option<EntityType> {
        EntityType::from_str(s).ok()
    }
}

/// A stable `(entityType, entityId)` pair. Versions, conditions, links and
/// dependency-graph nodes all key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub ty: EntityType,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(ty: EntityType, id: Uuid) -> Self {
        EntityRef { ty, id }
    }
}

impl Display for EntityRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.ty, self.id)
    }
}

pub type Variables = BTreeMap<String, serde_json::Value>;

pub trait Entity: Serialize + for<'de> Deserialize<'de> + PartialEq + Clone + Display {
    fn entity_type(&self) -> EntityType;
    fn id(&self) -> Uuid;
    fn name(&self) -> &str;

    /// One-line description used in audit reasons and log lines.
    fn description(&self) -> String;

    /// Typed variable values carried in the entity payload.
    fn variables(&self) -> &Variables;
    fn variables_mut(&mut self) -> &mut Variables;

    /// The next-most-specific entity in the variable scope chain, if any.
    fn scope_parent(&self) -> Option<EntityRef> {
        None
    }

    /// Structural soundness of the payload itself. Schema/typed-value checks
    /// happen separately in the rules layer.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }

    fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_type(), self.id())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, From, TryInto)]
#[try_into(owned, ref, ref_mut)]
pub enum AnyEntity {
    Location(Location),
    Kingdom(Kingdom),
    Settlement(Settlement),
    Structure(Structure),
    Party(Party),
    Character(Character),
    Encounter(Encounter),
    Event(WorldEvent),
}

macro_rules! impl_match {
    ($any_entity_var:expr, $pattern_var:ident => $pattern_block:block) => {
        match $any_entity_var {
            AnyEntity::Location($pattern_var) => $pattern_block
            AnyEntity::Kingdom($pattern_var) => $pattern_block
            AnyEntity::Settlement($pattern_var) => $pattern_block
            AnyEntity::Structure($pattern_var) => $pattern_block
            AnyEntity::Party($pattern_var) => $pattern_block
            AnyEntity::Character($pattern_var) => $pattern_block
            AnyEntity::Encounter($pattern_var) => $pattern_block
            AnyEntity::Event($pattern_var) => $pattern_block
        }
    };
}

impl Display for AnyEntity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        impl_match!(self, e => { e.fmt(f) })
    }
}

impl Entity for AnyEntity {
    fn entity_type(&self) -> EntityType {
        impl_match!(self, e => { e.entity_type() })
    }

    fn id(&self) -> Uuid {
        impl_match!(self, e => { e.id() })
    }

    fn name(&self) -> &str {
        impl_match!(self, e => { e.name() })
    }

    fn description(&self) -> String {
        impl_match!(self, e => { e.description() })
    }

    fn variables(&self) -> &Variables {
        impl_match!(self, e => { e.variables() })
    }

    fn variables_mut(&mut self) -> &mut Variables {
        impl_match!(self, e => { e.variables_mut() })
    }

    fn scope_parent(&self) -> Option<EntityRef> {
        impl_match!(self, e => { e.scope_parent() })
    }

    fn validate(&self) -> Result<(), String> {
        impl_match!(self, e => { e.validate() })
    }
}

impl AnyEntity {
    fn from_payload_typed<EntityT>(payload: serde_json::Value) -> serde_json::Result<Self>
    where
        EntityT: Entity,
        AnyEntity: From<EntityT>,
    {
        let entity: EntityT = serde_json::from_value(payload)?;
        Ok(AnyEntity::from(entity))
    }

    pub fn from_payload(
        entity_type: EntityType,
        payload: serde_json::Value,
    ) -> serde_json::Result<Self> {
        match entity_type {
            EntityType::Location => Self::from_payload_typed::<Location>(payload),
            EntityType::Kingdom => Self::from_payload_typed::<Kingdom>(payload),
            EntityType::Settlement => Self::from_payload_typed::<Settlement>(payload),
            EntityType::Structure => Self::from_payload_typed::<Structure>(payload),
            EntityType::Party => Self::from_payload_typed::<Party>(payload),
            EntityType::Character => Self::from_payload_typed::<Character>(payload),
            EntityType::Encounter => Self::from_payload_typed::<Encounter>(payload),
            EntityType::Event => Self::from_payload_typed::<WorldEvent>(payload),
        }
    }

    pub fn to_payload(&self) -> serde_json::Value {
        impl_match!(self, e => {
            serde_json::to_value(e).unwrap_or(serde_json::Value::Null)
        })
    }

    /// The geometry of this entity, if it carries one directly. Settlements
    /// inherit their Location's geometry through the spatial queries instead.
    pub fn own_geometry(&self) -> Option<&Geometry> {
        match self {
            AnyEntity::Location(location) => location.geom.as_ref(),
            _ => None,
        }
    }
}

macro_rules! impl_as_ref {
    ($entity_type:ty, $entity_variant:path, $ref_name:ident, $mut_name:ident) => {
        pub fn $ref_name(&self) -> Option<&$entity_type> {
            if let $entity_variant(e) = self {
                Some(e)
            } else {
                None
            }
        }

        pub fn $mut_name(&mut self) -> Option<&mut $entity_type> {
            if let $entity_variant(e) = self {
                Some(e)
            } else {
                None
            }
        }
    };
}

impl AnyEntity {
    impl_as_ref!(Location, AnyEntity::Location, as_location, as_location_mut);
    impl_as_ref!(Kingdom, AnyEntity::Kingdom, as_kingdom, as_kingdom_mut);
    impl_as_ref!(Settlement, AnyEntity::Settlement, as_settlement, as_settlement_mut);
    impl_as_ref!(Structure, AnyEntity::Structure, as_structure, as_structure_mut);
    impl_as_ref!(Party, AnyEntity::Party, as_party, as_party_mut);
    impl_as_ref!(Character, AnyEntity::Character, as_character, as_character_mut);
    impl_as_ref!(Encounter, AnyEntity::Encounter, as_encounter, as_encounter_mut);
    impl_as_ref!(WorldEvent, AnyEntity::Event, as_event, as_event_mut);
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn entity_type_roundtrips_through_strings() {
        use strum::IntoEnumIterator;
        for ty in EntityType::iter() {
            assert_eq!(EntityType::parse(ty.as_str()), Some(ty));
        }
    }

    #[test]
    fn settlement_payload_roundtrips_through_any_entity() {
        let id = Uuid::new_v4();
        let location_id = Uuid::new_v4();
        let payload = json!({
            "id": id,
            "name": "Sandpoint",
            "locationId": location_id,
            "kingdomId": null,
            "level": 3,
            "population": 1240,
            "variables": { "morale": 5 },
        });
        let entity = AnyEntity::from_payload(EntityType::Settlement, payload.clone()).unwrap();
        assert_eq!(entity.entity_type(), EntityType::Settlement);
        assert_eq!(entity.id(), id);
        assert_eq!(entity.to_payload(), payload);
    }

    #[test]
    fn structure_scope_parent_is_its_settlement() {
        let settlement_id = Uuid::new_v4();
        let structure = Structure {
            id: Uuid::new_v4(),
            name: "Cathedral".into(),
            settlement_id,
            kind: Some("temple".into()),
            variables: Variables::new(),
        };
        assert_eq!(
            structure.scope_parent(),
            Some(EntityRef::new(EntityType::Settlement, settlement_id))
        );
    }

    #[test]
    fn payload_of_the_wrong_shape_is_rejected() {
        let err = AnyEntity::from_payload(EntityType::Party, json!({"id": "not-a-uuid"}));
        assert!(err.is_err());
    }
}
