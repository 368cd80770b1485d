mod ops;
mod query;
mod validate;
mod wkb;

use serde::{Deserialize, Serialize};

pub use ops::{covers, covers_point, distance, overlaps, within, Bbox};
pub use query::{locations_in_bounds, locations_in_region, locations_near, region_overlap};
pub use validate::{validate_geometry, GeometryError, MAX_POLYGON_AREA, MIN_POLYGON_AREA};
pub use wkb::{geometry_to_wkb, wkb_to_geometry};

/// Web Mercator, the default projection for campaigns.
pub const DEFAULT_SRID: i32 = 3857;

fn default_srid() -> i32 {
    DEFAULT_SRID
}

fn is_default_srid(srid: &i32) -> bool {
    *srid == DEFAULT_SRID
}

/// Supported geometry, serialized as GeoJSON. Coordinates are `[x, y]` in the
/// units of `srid`; the `srid` key is omitted on the wire when it is the
/// default so plain GeoJSON round-trips unchanged.
///
/// Polygon rings follow GeoJSON: the first ring is the outer boundary, any
/// further rings are holes, and every ring repeats its first position last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Geometry {
    Point {
        coordinates: [f64; 2],
        #[serde(default = "default_srid", skip_serializing_if = "is_default_srid")]
        srid: i32,
    },
    Polygon {
        coordinates: Vec<Vec<[f64; 2]>>,
        #[serde(default = "default_srid", skip_serializing_if = "is_default_srid")]
        srid: i32,
    },
    MultiPolygon {
        coordinates: Vec<Vec<Vec<[f64; 2]>>>,
        #[serde(default = "default_srid", skip_serializing_if = "is_default_srid")]
        srid: i32,
    },
}

impl Geometry {
    pub fn point(x: f64, y: f64, srid: i32) -> Self {
        Geometry::Point {
            coordinates: [x, y],
            srid,
        }
    }

    pub fn polygon(rings: Vec<Vec<[f64; 2]>>, srid: i32) -> Self {
        Geometry::Polygon {
            coordinates: rings,
            srid,
        }
    }

    pub fn srid(&self) -> i32 {
        match self {
            Geometry::Point { srid, .. }
            | Geometry::Polygon { srid, .. }
            | Geometry::MultiPolygon { srid, .. } => *srid,
        }
    }

    pub fn set_srid(&mut self, new_srid: i32) {
        match self {
            Geometry::Point { srid, .. }
            | Geometry::Polygon { srid, .. }
            | Geometry::MultiPolygon { srid, .. } => *srid = new_srid,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Geometry::Point { .. } => "Point",
            Geometry::Polygon { .. } => "Polygon",
            Geometry::MultiPolygon { .. } => "MultiPolygon",
        }
    }

    /// The polygons of this geometry; a point yields none.
    pub(crate) fn polygons(&self) -> Vec<&Vec<Vec<[f64; 2]>>> {
        match self {
            Geometry::Point { .. } => Vec::new(),
            Geometry::Polygon { coordinates, .. } => vec![coordinates],
            Geometry::MultiPolygon { coordinates, .. } => coordinates.iter().collect(),
        }
    }

    pub(crate) fn points(&self) -> Vec<[f64; 2]> {
        match self {
            Geometry::Point { coordinates, .. } => vec![*coordinates],
            Geometry::Polygon { coordinates, .. } => {
                coordinates.iter().flatten().copied().collect()
            }
            Geometry::MultiPolygon { coordinates, .. } => coordinates
                .iter()
                .flatten()
                .flatten()
                .copied()
                .collect(),
        }
    }
}

/// Parses a GeoJSON value, applying `fallback_srid` when the document does
/// not carry one, and validates the result.
pub fn geometry_from_geojson(
    value: serde_json::Value,
    fallback_srid: Option<i32>,
) -> Result<Geometry, GeometryError> {
    let carries_srid = value
        .as_object()
        .map(|obj| obj.contains_key("srid"))
        .unwrap_or(false);
    let mut geometry: Geometry =
        serde_json::from_value(value).map_err(|err| GeometryError::Malformed(err.to_string()))?;
    if !carries_srid {
        if let Some(srid) = fallback_srid {
            geometry.set_srid(srid);
        }
    }
    validate_geometry(&geometry)?;
    Ok(geometry)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn geojson_point_roundtrips() {
        let value = json!({"type": "Point", "coordinates": [10.0, 20.0]});
        let geom: Geometry = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(geom.srid(), DEFAULT_SRID);
        assert_eq!(serde_json::to_value(&geom).unwrap(), value);
    }

    #[test]
    fn non_default_srid_survives_the_wire() {
        let value = json!({"type": "Point", "coordinates": [1.0, 2.0], "srid": 4326});
        let geom: Geometry = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(geom.srid(), 4326);
        assert_eq!(serde_json::to_value(&geom).unwrap(), value);
    }

    #[test]
    fn fallback_srid_applies_only_when_absent() {
        let plain = json!({"type": "Point", "coordinates": [1.0, 2.0]});
        let geom = geometry_from_geojson(plain, Some(27700)).unwrap();
        assert_eq!(geom.srid(), 27700);

        let tagged = json!({"type": "Point", "coordinates": [1.0, 2.0], "srid": 4326});
        let geom = geometry_from_geojson(tagged, Some(27700)).unwrap();
        assert_eq!(geom.srid(), 4326);
    }
}
