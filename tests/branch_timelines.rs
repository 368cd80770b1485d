use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use timeloom::codec::compress_payload;
use timeloom::entity::{EntityRef, EntityType};
use timeloom::state::{resolve_from_candidates, AncestryBranch, StoredVersion};
use uuid::Uuid;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(4707, 3, day, hour, 0, 0).unwrap()
}

fn version(
    entity: EntityRef,
    branch_id: Uuid,
    valid_from: DateTime<Utc>,
    version: i32,
    payload: serde_json::Value,
) -> StoredVersion {
    StoredVersion {
        id: version as i64,
        entity,
        branch_id,
        valid_from,
        version,
        payload_gz: compress_payload(&payload).unwrap(),
        actor_id: Uuid::nil(),
        created_at: valid_from,
    }
}

/// Fork at T2 then read both branches at T2: identical payload bytes. A
/// later write in the fork moves the fork, not the source.
#[test]
fn fork_preserves_state_and_isolates_later_edits() {
    let settlement = EntityRef::new(EntityType::Settlement, Uuid::new_v4());
    let main = Uuid::new_v4();
    let what_if = Uuid::new_v4();
    let t1 = at(10, 0);
    let t2 = at(12, 0);
    let t3 = at(14, 0);

    let level3 = json!({"name": "Sandpoint", "level": 3});
    let source_version = version(settlement, main, t1, 1, level3.clone());

    let main_chain = [AncestryBranch {
        branch_id: main,
        diverged_at: None,
    }];
    let fork_chain = [
        AncestryBranch {
            branch_id: what_if,
            diverged_at: Some(t2),
        },
        AncestryBranch {
            branch_id: main,
            diverged_at: None,
        },
    ];

    // the fork copies the resolved version at t2, byte for byte
    let resolved_pre_fork =
        resolve_from_candidates(&main_chain, &[source_version.clone()], t2).unwrap();
    let fork_copy = version(settlement, what_if, t2, resolved_pre_fork.version, level3.clone());
    assert_eq!(fork_copy.payload_gz, resolved_pre_fork.payload_gz);

    let candidates = vec![source_version.clone(), fork_copy.clone()];

    // reading the fork at t2 yields the same payload bytes as the source
    let in_fork = resolve_from_candidates(&fork_chain, &candidates, t2).unwrap();
    let in_main = resolve_from_candidates(&main_chain, &candidates, t2).unwrap();
    assert_eq!(in_fork.payload_gz, in_main.payload_gz);
    assert_eq!(in_fork.payload().unwrap(), level3);

    // updating the settlement in the fork at t3...
    let level5 = json!({"name": "Sandpoint", "level": 5});
    let fork_edit = version(settlement, what_if, t3, 2, level5.clone());
    let mut candidates = candidates;
    candidates.push(fork_edit);

    // ...is visible in the fork
    let in_fork = resolve_from_candidates(&fork_chain, &candidates, t3).unwrap();
    assert_eq!(in_fork.payload().unwrap(), level5);

    // ...and invisible in main at the same time
    let in_main = resolve_from_candidates(&main_chain, &candidates, t3).unwrap();
    assert_eq!(in_main.payload().unwrap(), level3);
}

/// A source branch that keeps moving after the fork never bleeds into the
/// fork's reads.
#[test]
fn source_edits_after_the_fork_point_stay_out_of_the_fork() {
    let settlement = EntityRef::new(EntityType::Settlement, Uuid::new_v4());
    let main = Uuid::new_v4();
    let what_if = Uuid::new_v4();
    let t1 = at(10, 0);
    let t2 = at(12, 0);
    let t3 = at(14, 0);

    let before = json!({"level": 3});
    let after = json!({"level": 9});
    let candidates = vec![
        version(settlement, main, t1, 1, before.clone()),
        version(settlement, what_if, t2, 1, before.clone()),
        version(settlement, main, t3, 2, after.clone()),
    ];

    let fork_chain = [
        AncestryBranch {
            branch_id: what_if,
            diverged_at: Some(t2),
        },
        AncestryBranch {
            branch_id: main,
            diverged_at: None,
        },
    ];
    let in_fork = resolve_from_candidates(&fork_chain, &candidates, t3).unwrap();
    assert_eq!(in_fork.payload().unwrap(), before);

    let main_chain = [AncestryBranch {
        branch_id: main,
        diverged_at: None,
    }];
    let in_main = resolve_from_candidates(&main_chain, &candidates, t3).unwrap();
    assert_eq!(in_main.payload().unwrap(), after);
}

/// Versions sharing a validFrom resolve to the greatest version counter.
#[test]
fn same_instant_writes_resolve_by_version_number() {
    let party = EntityRef::new(EntityType::Party, Uuid::new_v4());
    let main = Uuid::new_v4();
    let t = at(10, 0);
    let candidates = vec![
        version(party, main, t, 1, json!({"level": 1})),
        version(party, main, t, 2, json!({"level": 2})),
        version(party, main, t, 3, json!({"level": 3})),
    ];
    let chain = [AncestryBranch {
        branch_id: main,
        diverged_at: None,
    }];
    let hit = resolve_from_candidates(&chain, &candidates, t).unwrap();
    assert_eq!(hit.version, 3);
    assert_eq!(hit.payload().unwrap(), json!({"level": 3}));
}

/// An entity created only after `asOf` is invisible at `asOf`.
#[test]
fn reads_before_the_first_version_see_nothing() {
    let encounter = EntityRef::new(EntityType::Encounter, Uuid::new_v4());
    let main = Uuid::new_v4();
    let chain = [AncestryBranch {
        branch_id: main,
        diverged_at: None,
    }];
    let candidates = vec![version(encounter, main, at(20, 0), 1, json!({"resolved": false}))];
    assert!(resolve_from_candidates(&chain, &candidates, at(19, 23)).is_none());
}
