use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::spatial::ops::{covers, covers_point, distance, overlaps, Bbox};
use crate::spatial::Geometry;

fn require_same_srid(a: &Geometry, b: &Geometry) -> CoreResult<()> {
    if a.srid() != b.srid() {
        return Err(CoreError::validation(format!(
            "srid mismatch: {} vs {}",
            a.srid(),
            b.srid()
        )));
    }
    Ok(())
}

/// Ids whose geometry's bounding box intersects `bounds`. The box test is the
/// query; callers wanting exact containment follow with
/// [`locations_in_region`].
pub fn locations_in_bounds(items: &[(Uuid, Geometry)], bounds: &Bbox) -> Vec<Uuid> {
    items
        .iter()
        .filter(|(_, geometry)| Bbox::of(geometry).intersects(bounds))
        .map(|(id, _)| *id)
        .collect()
}

/// Ids within `radius` of `center`, ordered by ascending distance. Distance
/// ties keep the input order stable.
pub fn locations_near(
    items: &[(Uuid, Geometry)],
    center: &Geometry,
    radius: f64,
) -> CoreResult<Vec<(Uuid, f64)>> {
    if !radius.is_finite() || radius < 0.0 {
        return Err(CoreError::validation(format!("bad radius {radius}")));
    }
    let mut hits = Vec::new();
    for (id, geometry) in items {
        require_same_srid(center, geometry)?;
        let d = distance(center, geometry);
        if d <= radius {
            hits.push((*id, d));
        }
    }
    hits.sort_by(|a, b| a.1.total_cmp(&b.1));
    Ok(hits)
}

/// Ids fully covered by `region` (boundary inclusive).
pub fn locations_in_region(
    items: &[(Uuid, Geometry)],
    region: &Geometry,
) -> CoreResult<Vec<Uuid>> {
    let mut hits = Vec::new();
    for (id, geometry) in items {
        require_same_srid(region, geometry)?;
        let contained = match geometry {
            Geometry::Point { coordinates, .. } => covers_point(region, *coordinates),
            _ => covers(region, geometry),
        };
        if contained {
            hits.push(*id);
        }
    }
    Ok(hits)
}

/// Whether two regions share any point.
pub fn region_overlap(a: &Geometry, b: &Geometry) -> CoreResult<bool> {
    require_same_srid(a, b)?;
    Ok(overlaps(a, b))
}
