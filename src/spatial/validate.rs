use thiserror::Error;

use crate::spatial::Geometry;

/// Smallest creatable region: one square metre (in projected units).
pub const MIN_POLYGON_AREA: f64 = 1.0;
/// Largest creatable region: 10,000 km² (in projected units).
pub const MAX_POLYGON_AREA: f64 = 1.0e10;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum GeometryError {
    #[error("geometry is malformed: {0}")]
    Malformed(String),

    #[error("coordinate ({0}, {1}) is not finite")]
    NonFiniteCoordinate(f64, f64),

    #[error("ring {0} is empty")]
    EmptyRing(usize),

    #[error("ring {0} is not closed")]
    UnclosedRing(usize),

    #[error("ring {0} has fewer than 3 distinct vertices")]
    DegenerateRing(usize),

    #[error("ring {0} intersects itself")]
    SelfIntersection(usize),

    #[error("polygon area {area:.1} is below the minimum of {MIN_POLYGON_AREA}")]
    AreaTooSmall { area: f64 },

    #[error("polygon area {area:.1} exceeds the maximum of {MAX_POLYGON_AREA}")]
    AreaTooLarge { area: f64 },
}

/// Full validation for created or edited geometry. Stored geometry read back
/// from the version store skips this; it was checked on the way in.
pub fn validate_geometry(geometry: &Geometry) -> Result<(), GeometryError> {
    for point in geometry.points() {
        if !point[0].is_finite() || !point[1].is_finite() {
            return Err(GeometryError::NonFiniteCoordinate(point[0], point[1]));
        }
    }

    for polygon in geometry.polygons() {
        if polygon.is_empty() {
            return Err(GeometryError::EmptyRing(0));
        }
        for (index, ring) in polygon.iter().enumerate() {
            check_ring(index, ring)?;
        }
        // Area bounds apply to the outer boundary only; holes subtract
        // nothing from the creatable range.
        let area = ring_area(&polygon[0]);
        if area < MIN_POLYGON_AREA {
            return Err(GeometryError::AreaTooSmall { area });
        }
        if area > MAX_POLYGON_AREA {
            return Err(GeometryError::AreaTooLarge { area });
        }
    }
    Ok(())
}

fn check_ring(index: usize, ring: &[[f64; 2]]) -> Result<(), GeometryError> {
    if ring.is_empty() {
        return Err(GeometryError::EmptyRing(index));
    }
    if ring.len() < 4 || ring.first() != ring.last() {
        return Err(GeometryError::UnclosedRing(index));
    }

    let mut distinct: Vec<[f64; 2]> = Vec::new();
    for point in &ring[..ring.len() - 1] {
        if !distinct.contains(point) {
            distinct.push(*point);
        }
    }
    if distinct.len() < 3 {
        return Err(GeometryError::DegenerateRing(index));
    }

    if ring_self_intersects(ring) {
        return Err(GeometryError::SelfIntersection(index));
    }
    Ok(())
}

/// Unsigned shoelace area.
pub(crate) fn ring_area(ring: &[[f64; 2]]) -> f64 {
    if ring.len() < 4 {
        return 0.0;
    }
    let mut doubled = 0.0;
    for pair in ring.windows(2) {
        doubled += pair[0][0] * pair[1][1] - pair[1][0] * pair[0][1];
    }
    (doubled / 2.0).abs()
}

/// Checks every non-adjacent segment pair for a proper crossing. O(n²) is
/// fine at the ring sizes campaigns draw by hand.
fn ring_self_intersects(ring: &[[f64; 2]]) -> bool {
    let segments: Vec<([f64; 2], [f64; 2])> = ring
        .windows(2)
        .map(|pair| (pair[0], pair[1]))
        .collect();
    let n = segments.len();
    for i in 0..n {
        for j in (i + 1)..n {
            // Neighbouring segments share an endpoint; the first and last
            // segments are neighbours through the ring closure.
            if j == i + 1 || (i == 0 && j == n - 1) {
                continue;
            }
            if segments_cross(segments[i], segments[j]) {
                return true;
            }
        }
    }
    false
}

fn orientation(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn segments_cross(s1: ([f64; 2], [f64; 2]), s2: ([f64; 2], [f64; 2])) -> bool {
    let (a, b) = s1;
    let (c, d) = s2;
    let o1 = orientation(a, b, c);
    let o2 = orientation(a, b, d);
    let o3 = orientation(c, d, a);
    let o4 = orientation(c, d, b);
    o1 * o2 < 0.0 && o3 * o4 < 0.0
}

#[cfg(test)]
mod tests {
    use crate::spatial::DEFAULT_SRID;

    use super::*;

    fn polygon(ring: Vec<[f64; 2]>) -> Geometry {
        Geometry::polygon(vec![ring], DEFAULT_SRID)
    }

    #[test]
    fn a_simple_square_is_valid() {
        let geom = polygon(vec![
            [0.0, 0.0],
            [100.0, 0.0],
            [100.0, 100.0],
            [0.0, 100.0],
            [0.0, 0.0],
        ]);
        assert_eq!(validate_geometry(&geom), Ok(()));
    }

    #[test]
    fn nan_coordinates_are_rejected() {
        let geom = Geometry::point(f64::NAN, 1.0, DEFAULT_SRID);
        assert!(matches!(
            validate_geometry(&geom),
            Err(GeometryError::NonFiniteCoordinate(_, _))
        ));
    }

    #[test]
    fn unclosed_rings_are_rejected() {
        let geom = polygon(vec![[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0]]);
        assert_eq!(
            validate_geometry(&geom),
            Err(GeometryError::UnclosedRing(0))
        );
    }

    #[test]
    fn rings_need_three_distinct_vertices() {
        let geom = polygon(vec![[0.0, 0.0], [100.0, 0.0], [0.0, 0.0], [0.0, 0.0]]);
        assert_eq!(
            validate_geometry(&geom),
            Err(GeometryError::DegenerateRing(0))
        );
    }

    #[test]
    fn bowties_are_rejected() {
        let geom = polygon(vec![
            [0.0, 0.0],
            [100.0, 100.0],
            [100.0, 0.0],
            [0.0, 100.0],
            [0.0, 0.0],
        ]);
        assert_eq!(
            validate_geometry(&geom),
            Err(GeometryError::SelfIntersection(0))
        );
    }

    #[test]
    fn area_bounds_are_enforced() {
        let tiny = polygon(vec![
            [0.0, 0.0],
            [0.5, 0.0],
            [0.5, 0.5],
            [0.0, 0.5],
            [0.0, 0.0],
        ]);
        assert!(matches!(
            validate_geometry(&tiny),
            Err(GeometryError::AreaTooSmall { .. })
        ));

        let side = 200_000.0; // 200 km square -> 40,000 km²
        let huge = polygon(vec![
            [0.0, 0.0],
            [side, 0.0],
            [side, side],
            [0.0, side],
            [0.0, 0.0],
        ]);
        assert!(matches!(
            validate_geometry(&huge),
            Err(GeometryError::AreaTooLarge { .. })
        ));
    }

    #[test]
    fn empty_rings_are_rejected() {
        let geom = Geometry::polygon(vec![], DEFAULT_SRID);
        assert_eq!(validate_geometry(&geom), Err(GeometryError::EmptyRing(0)));
    }
}
