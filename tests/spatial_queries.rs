use timeloom::spatial::{
    covers, geometry_from_geojson, geometry_to_wkb, locations_near, validate_geometry,
    wkb_to_geometry, within, Geometry, DEFAULT_SRID,
};
use uuid::Uuid;

fn point(x: f64, y: f64) -> Geometry {
    Geometry::point(x, y, DEFAULT_SRID)
}

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

/// The seeded scenario: three settlements at 100 m, 500 m and 2000 m; a
/// 1000 m radius returns the first two, ascending.
#[test]
fn settlements_near_returns_two_of_three_ordered_by_distance() {
    let near = Uuid::new_v4();
    let mid = Uuid::new_v4();
    let far = Uuid::new_v4();
    let locations = vec![
        (far, point(2000.0, 0.0)),
        (near, point(0.0, 100.0)),
        (mid, point(300.0, 400.0)),
    ];

    let hits = locations_near(&locations, &point(0.0, 0.0), 1000.0).unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].0, near);
    assert!((hits[0].1 - 100.0).abs() < 1e-9);
    assert_eq!(hits[1].0, mid);
    assert!((hits[1].1 - 500.0).abs() < 1e-9);
}

/// covers(A, B) and within(B, A) agree, boundary included.
#[test]
fn covers_and_within_are_duals() {
    let region = square([0.0, 0.0], 1000.0);
    let inner = square([100.0, 100.0], 200.0);
    let touching = square([0.0, 0.0], 500.0); // shares the region's corner

    for candidate in [&inner, &touching] {
        assert_eq!(covers(&region, candidate), within(candidate, &region));
        assert!(covers(&region, candidate));
    }

    let poking_out = square([900.0, 900.0], 200.0);
    assert!(!covers(&region, &poking_out));
    assert!(!within(&poking_out, &region));
}

/// WKB round-trip law over each geometry kind.
#[test]
fn wkb_roundtrips_preserve_geometry_and_srid() {
    let geometries = vec![
        point(12.5, -7.25),
        square([10.0, 10.0], 50.0),
        Geometry::MultiPolygon {
            coordinates: vec![
                vec![vec![[0.0, 0.0], [10.0, 0.0], [10.0, 10.0], [0.0, 10.0], [0.0, 0.0]]],
                vec![vec![[50.0, 50.0], [90.0, 50.0], [90.0, 90.0], [50.0, 90.0], [50.0, 50.0]]],
            ],
            srid: 27700,
        },
    ];
    for geometry in geometries {
        let bytes = geometry_to_wkb(&geometry).unwrap();
        assert_eq!(wkb_to_geometry(&bytes).unwrap(), geometry);
    }
}

/// GeoJSON in, validated geometry out, campaign SRID applied when absent.
#[test]
fn geojson_ingestion_validates_and_defaults_the_srid() {
    let valid = serde_json::json!({
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [100.0, 0.0], [100.0, 100.0], [0.0, 100.0], [0.0, 0.0]]],
    });
    let geometry = geometry_from_geojson(valid, Some(4326)).unwrap();
    assert_eq!(geometry.srid(), 4326);
    assert!(validate_geometry(&geometry).is_ok());

    let bowtie = serde_json::json!({
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [100.0, 100.0], [100.0, 0.0], [0.0, 100.0], [0.0, 0.0]]],
    });
    assert!(geometry_from_geojson(bowtie, None).is_err());

    let unclosed = serde_json::json!({
        "type": "Polygon",
        "coordinates": [[[0.0, 0.0], [100.0, 0.0], [100.0, 100.0]]],
    });
    assert!(geometry_from_geojson(unclosed, None).is_err());
}
