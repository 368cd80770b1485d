use serde::{Deserialize, Serialize};

use crate::spatial::Geometry;

/// Axis-aligned bounding box in the geometry's projected units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bbox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Bbox {
    pub fn of(geometry: &Geometry) -> Bbox {
        let mut bbox = Bbox {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
        };
        for point in geometry.points() {
            bbox.min_x = bbox.min_x.min(point[0]);
            bbox.min_y = bbox.min_y.min(point[1]);
            bbox.max_x = bbox.max_x.max(point[0]);
            bbox.max_y = bbox.max_y.max(point[1]);
        }
        bbox
    }

    pub fn intersects(&self, other: &Bbox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

/// Inclusive point-on-segment test used for boundary ("covers") semantics.
fn on_segment(p: [f64; 2], a: [f64; 2], b: [f64; 2]) -> bool {
    let cross = (b[0] - a[0]) * (p[1] - a[1]) - (b[1] - a[1]) * (p[0] - a[0]);
    if cross.abs() > f64::EPSILON * (1.0 + cross.abs()) {
        return false;
    }
    p[0] >= a[0].min(b[0])
        && p[0] <= a[0].max(b[0])
        && p[1] >= a[1].min(b[1])
        && p[1] <= a[1].max(b[1])
}

/// Ray-cast containment with an explicit boundary check first, so points on
/// the ring count as inside.
fn ring_covers_point(ring: &[[f64; 2]], p: [f64; 2]) -> bool {
    for pair in ring.windows(2) {
        if on_segment(p, pair[0], pair[1]) {
            return true;
        }
    }

    let mut inside = false;
    for pair in ring.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let crosses = (a[1] > p[1]) != (b[1] > p[1]);
        if crosses {
            let x_at = a[0] + (p[1] - a[1]) / (b[1] - a[1]) * (b[0] - a[0]);
            if p[0] < x_at {
                inside = !inside;
            }
        }
    }
    inside
}

fn polygon_covers_point(rings: &[Vec<[f64; 2]>], p: [f64; 2]) -> bool {
    let Some(outer) = rings.first() else {
        return false;
    };
    if !ring_covers_point(outer, p) {
        return false;
    }
    // A point strictly inside a hole is not covered; a point on the hole's
    // boundary still is.
    for hole in &rings[1..] {
        let on_hole_edge = hole
            .windows(2)
            .any(|pair| on_segment(p, pair[0], pair[1]));
        if !on_hole_edge && ring_covers_point(hole, p) {
            return false;
        }
    }
    true
}

/// Whether `geometry` covers the point, boundary included.
pub fn covers_point(geometry: &Geometry, p: [f64; 2]) -> bool {
    match geometry {
        Geometry::Point { coordinates, .. } => *coordinates == p,
        Geometry::Polygon { coordinates, .. } => polygon_covers_point(coordinates, p),
        Geometry::MultiPolygon { coordinates, .. } => coordinates
            .iter()
            .any(|polygon| polygon_covers_point(polygon, p)),
    }
}

/// `covers(a, b)`: every point of `b` lies in `a`, boundaries included.
/// Decided by vertex containment plus the absence of proper edge crossings,
/// which is exact for the simple (validated) rings the store accepts.
pub fn covers(a: &Geometry, b: &Geometry) -> bool {
    if !b.points().iter().all(|point| covers_point(a, *point)) {
        return false;
    }
    !edges_properly_cross(a, b)
}

/// `within(b, a)` == `covers(a, b)`; kept for query readability.
pub fn within(b: &Geometry, a: &Geometry) -> bool {
    covers(a, b)
}

/// Whether the regions share any point.
pub fn overlaps(a: &Geometry, b: &Geometry) -> bool {
    if b.points().iter().any(|point| covers_point(a, *point)) {
        return true;
    }
    if a.points().iter().any(|point| covers_point(b, *point)) {
        return true;
    }
    edges_properly_cross(a, b)
}

/// Planar distance between the closest points of the two geometries, zero
/// when they touch or overlap. Units are the SRID's projected units.
pub fn distance(a: &Geometry, b: &Geometry) -> f64 {
    if overlaps(a, b) {
        return 0.0;
    }

    let a_segments = segments_of(a);
    let b_segments = segments_of(b);
    let mut best = f64::INFINITY;

    match (a_segments.is_empty(), b_segments.is_empty()) {
        (true, true) => {
            for pa in a.points() {
                for pb in b.points() {
                    best = best.min(point_distance(pa, pb));
                }
            }
        }
        (true, false) => {
            for pa in a.points() {
                for segment in &b_segments {
                    best = best.min(point_segment_distance(pa, *segment));
                }
            }
        }
        (false, true) => {
            for pb in b.points() {
                for segment in &a_segments {
                    best = best.min(point_segment_distance(pb, *segment));
                }
            }
        }
        (false, false) => {
            for sa in &a_segments {
                for sb in &b_segments {
                    best = best.min(point_segment_distance(sa.0, *sb));
                    best = best.min(point_segment_distance(sa.1, *sb));
                    best = best.min(point_segment_distance(sb.0, *sa));
                    best = best.min(point_segment_distance(sb.1, *sa));
                }
            }
        }
    }
    best
}

pub(crate) fn point_distance(a: [f64; 2], b: [f64; 2]) -> f64 {
    ((a[0] - b[0]).powi(2) + (a[1] - b[1]).powi(2)).sqrt()
}

fn point_segment_distance(p: [f64; 2], (a, b): ([f64; 2], [f64; 2])) -> f64 {
    let len_sq = (b[0] - a[0]).powi(2) + (b[1] - a[1]).powi(2);
    if len_sq == 0.0 {
        return point_distance(p, a);
    }
    let t = (((p[0] - a[0]) * (b[0] - a[0]) + (p[1] - a[1]) * (b[1] - a[1])) / len_sq)
        .clamp(0.0, 1.0);
    let nearest = [a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1])];
    point_distance(p, nearest)
}

fn segments_of(geometry: &Geometry) -> Vec<([f64; 2], [f64; 2])> {
    geometry
        .polygons()
        .into_iter()
        .flat_map(|rings| rings.iter())
        .flat_map(|ring| ring.windows(2).map(|pair| (pair[0], pair[1])))
        .collect()
}

fn edges_properly_cross(a: &Geometry, b: &Geometry) -> bool {
    let a_segments = segments_of(a);
    let b_segments = segments_of(b);
    for sa in &a_segments {
        for sb in &b_segments {
            if proper_crossing(*sa, *sb) {
                return true;
            }
        }
    }
    false
}

fn orientation(a: [f64; 2], b: [f64; 2], c: [f64; 2]) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

fn proper_crossing(s1: ([f64; 2], [f64; 2]), s2: ([f64; 2], [f64; 2])) -> bool {
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

    fn square(origin: [f64; 2], side: f64) -> Geometry {
        let [x, y] = origin;
        Geometry::polygon(
            vec![vec![
                [x, y],
                [x + side, y],
                [x + side, y + side],
                [x, y + side],
                [x, y],
            ]],
            DEFAULT_SRID,
        )
    }

    #[test]
    fn boundary_points_are_covered() {
        let region = square([0.0, 0.0], 100.0);
        assert!(covers_point(&region, [0.0, 50.0]));
        assert!(covers_point(&region, [100.0, 100.0]));
        assert!(covers_point(&region, [50.0, 50.0]));
        assert!(!covers_point(&region, [100.1, 50.0]));
    }

    #[test]
    fn holes_exclude_their_interior_but_not_their_edge() {
        let mut region = square([0.0, 0.0], 100.0);
        if let Geometry::Polygon { coordinates, .. } = &mut region {
            coordinates.push(vec![
                [40.0, 40.0],
                [60.0, 40.0],
                [60.0, 60.0],
                [40.0, 60.0],
                [40.0, 40.0],
            ]);
        }
        assert!(!covers_point(&region, [50.0, 50.0]));
        assert!(covers_point(&region, [40.0, 50.0]));
        assert!(covers_point(&region, [10.0, 10.0]));
    }

    #[test]
    fn covers_implies_within() {
        let outer = square([0.0, 0.0], 100.0);
        let inner = square([20.0, 20.0], 30.0);
        assert!(covers(&outer, &inner));
        assert!(within(&inner, &outer));
        assert!(!covers(&inner, &outer));
    }

    #[test]
    fn partial_overlap_is_not_coverage() {
        let a = square([0.0, 0.0], 100.0);
        let b = square([50.0, 50.0], 100.0);
        assert!(!covers(&a, &b));
        assert!(overlaps(&a, &b));
    }

    #[test]
    fn disjoint_regions_do_not_overlap() {
        let a = square([0.0, 0.0], 10.0);
        let b = square([100.0, 100.0], 10.0);
        assert!(!overlaps(&a, &b));
    }

    #[test]
    fn point_distances_are_planar() {
        let a = Geometry::point(0.0, 0.0, DEFAULT_SRID);
        let b = Geometry::point(3.0, 4.0, DEFAULT_SRID);
        assert!((distance(&a, &b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn distance_to_a_region_is_zero_inside_and_positive_outside() {
        let region = square([0.0, 0.0], 100.0);
        let inside = Geometry::point(50.0, 50.0, DEFAULT_SRID);
        let outside = Geometry::point(130.0, 50.0, DEFAULT_SRID);
        assert_eq!(distance(&region, &inside), 0.0);
        assert!((distance(&region, &outside) - 30.0).abs() < 1e-9);
    }

    #[test]
    fn bbox_intersection_is_inclusive() {
        let a = Bbox::of(&square([0.0, 0.0], 10.0));
        let b = Bbox::of(&square([10.0, 10.0], 10.0));
        let c = Bbox::of(&square([21.0, 21.0], 10.0));
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }
}
