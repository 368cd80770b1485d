use chrono::{DateTime, TimeZone, Utc};
use timeloom::calendar::{format_world_date, parse_world_date, validate_world_date, Calendar};
use timeloom::error::CoreError;
use timeloom::state::{check_advance, CampaignRow};
use uuid::Uuid;

fn campaign(current_world_time: Option<DateTime<Utc>>, version: i32) -> CampaignRow {
    CampaignRow {
        id: Uuid::new_v4(),
        world_id: Uuid::new_v4(),
        name: "Rise of the Runelords".to_string(),
        srid: 3857,
        current_world_time,
        version,
        created_at: Utc.with_ymd_and_hms(4707, 1, 1, 0, 0, 0).unwrap(),
        deleted_at: None,
    }
}

fn absalom_reckoning() -> Calendar {
    Calendar {
        id: Uuid::new_v4(),
        name: "Absalom Reckoning".to_string(),
        months_per_year: 12,
        days_per_month: vec![31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31],
        month_names: [
            "Abadius", "Calistril", "Pharast", "Gozran", "Desnus", "Sarenith", "Erastus",
            "Arodus", "Rova", "Lamashan", "Neth", "Kuthona",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
        epoch: Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap(),
        notes: None,
    }
}

#[test]
fn first_advance_accepts_any_valid_time_then_enforces_monotonicity() {
    let noon = parse_world_date("4707-03-15T12:00:00Z", None).unwrap();

    // campaign clock unset: any valid time goes through at version 0
    let fresh = campaign(None, 0);
    assert!(check_advance(&fresh, noon, 0).is_ok());

    // once set, advancing to the same instant is PastOrEqualTime
    let advanced = campaign(Some(noon), 1);
    match check_advance(&advanced, noon, 1) {
        Err(CoreError::PastOrEqualTime { current, proposed }) => {
            assert_eq!(current, noon);
            assert_eq!(proposed, noon);
        }
        other => panic!("expected PastOrEqualTime, got {other:?}"),
    }

    // and going backwards is too
    let earlier = parse_world_date("4707-03-14T12:00:00Z", None).unwrap();
    assert!(matches!(
        check_advance(&advanced, earlier, 1),
        Err(CoreError::PastOrEqualTime { .. })
    ));

    // a later time passes
    let later = parse_world_date("4707-03-16T08:00:00Z", None).unwrap();
    assert!(check_advance(&advanced, later, 1).is_ok());
}

#[test]
fn stale_expected_versions_conflict_before_anything_else() {
    let noon = parse_world_date("4707-03-15T12:00:00Z", None).unwrap();
    let advanced = campaign(Some(noon), 3);
    match check_advance(&advanced, noon + chrono::Duration::days(1), 1) {
        Err(CoreError::VersionConflict {
            expected, found, ..
        }) => {
            assert_eq!(expected, 1);
            assert_eq!(found, 3);
        }
        other => panic!("expected VersionConflict, got {other:?}"),
    }
}

#[test]
fn absalom_reckoning_dates_roundtrip() {
    let ar = absalom_reckoning();
    let parsed = parse_world_date("15 Pharast 4707", Some(&ar)).unwrap();
    assert_eq!(
        format_world_date(parsed, Some(&ar), false).unwrap(),
        "15 Pharast 4707"
    );
}

#[test]
fn calistril_has_only_twenty_eight_days() {
    let ar = absalom_reckoning();
    let err = parse_world_date("29 Calistril 4707", Some(&ar)).unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
    assert!(err.to_string().contains("28 days"));

    let ok = parse_world_date("28 Calistril 4707", Some(&ar)).unwrap();
    assert!(validate_world_date(ok, Some(&ar)).is_valid);
}

#[test]
fn year_length_comes_from_the_calendar_definition() {
    let mut ar = absalom_reckoning();
    assert_eq!(ar.days_in_year(), 365);
    ar.days_per_month = vec![30; 12];
    assert_eq!(ar.days_in_year(), 360);
}
