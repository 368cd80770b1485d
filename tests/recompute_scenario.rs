use serde_json::json;
use timeloom::engine::resolve_dependency_nodes;
use timeloom::entity::{EntityRef, EntityType};
use timeloom::graph::{DepNode, DependencyGraph, FieldNode};
use timeloom::rules::{
    assemble_context, evaluate_conditions, sort_conditions, FieldCondition, OperatorTable,
};
use uuid::Uuid;

/// The seeded scenario: Structure X's `available` depends on
/// `settlement.level >= 3`. Raising the settlement to level 3 invalidates
/// exactly `[X.available]`, and re-evaluation flips it to true.
#[test]
fn settlement_level_change_recomputes_structure_availability() {
    let _ = env_logger::builder().is_test(true).try_init();

    let settlement = EntityRef::new(EntityType::Settlement, Uuid::new_v4());
    let structure = EntityRef::new(EntityType::Structure, Uuid::new_v4());

    let condition = FieldCondition {
        id: Uuid::new_v4(),
        target: structure,
        field: "available".to_string(),
        expression: json!({"if": [
            {">=": [{"var": "settlement.level"}, 3]},
            true,
            false,
        ]}),
        priority: 10,
        description: Some("needs a town of level 3".to_string()),
    };

    // wiring: condition dependencies resolve to the settlement's level node
    let dependencies =
        resolve_dependency_nodes(&condition.dependencies(), structure, &[settlement]);
    assert_eq!(
        dependencies,
        vec![DepNode::Field(FieldNode::new(settlement, "level"))]
    );

    let mut graph = DependencyGraph::new();
    graph
        .add_condition(
            condition.id,
            FieldNode::new(structure, "available"),
            dependencies,
        )
        .unwrap();

    // the settlement level changed: the graph names exactly X.available
    let affected = graph.affected_by(&DepNode::Field(FieldNode::new(settlement, "level")));
    assert_eq!(affected, vec![FieldNode::new(structure, "available")]);

    // recompute before the change: level 2, unavailable
    let table = OperatorTable::with_domain_ops();
    let mut conditions = vec![condition];
    sort_conditions(&mut conditions);

    let at_level = |level: i64| {
        let input = assemble_context(
            &json!({"name": "Cathedral", "variables": {}}),
            &[(
                EntityType::Settlement,
                json!({"name": "Sandpoint", "level": level, "variables": {}}),
            )],
            None,
            &serde_json::Map::new(),
            &[],
        );
        evaluate_conditions(&conditions, &table, &input, None).unwrap()
    };

    assert_eq!(at_level(2), json!(false));
    assert_eq!(at_level(3), json!(true));
}

/// Chained computed fields recompute in topological order, and unrelated
/// fields stay out of the batch.
#[test]
fn invalidation_batches_are_topologically_ordered_and_minimal() {
    let settlement = EntityRef::new(EntityType::Settlement, Uuid::new_v4());
    let structure = EntityRef::new(EntityType::Structure, Uuid::new_v4());
    let other = EntityRef::new(EntityType::Structure, Uuid::new_v4());

    let mut graph = DependencyGraph::new();
    let level = FieldNode::new(settlement, "level");
    let available = FieldNode::new(structure, "available");
    let tax = FieldNode::new(structure, "taxRate");
    let unrelated = FieldNode::new(other, "open");

    graph
        .add_condition(Uuid::new_v4(), available.clone(), [level.clone().into()])
        .unwrap();
    graph
        .add_condition(Uuid::new_v4(), tax.clone(), [available.clone().into()])
        .unwrap();
    graph
        .add_condition(Uuid::new_v4(), unrelated.clone(), [DepNode::WorldTime])
        .unwrap();

    let batch = graph.invalidate(&level.into());
    assert_eq!(batch, vec![available, tax]);

    let time_batch = graph.time_sensitive();
    assert_eq!(time_batch, vec![unrelated]);
}

/// Deterministic evaluation: same context, same result, every time.
#[test]
fn condition_evaluation_is_deterministic_across_runs() {
    let structure = EntityRef::new(EntityType::Structure, Uuid::new_v4());
    let condition = FieldCondition {
        id: Uuid::new_v4(),
        target: structure,
        field: "stock".to_string(),
        expression: json!({"+": [
            {"variable": "inventory"},
            {"*": [{"var": "settlement.level"}, 10]},
        ]}),
        priority: 1,
        description: None,
    };
    let table = OperatorTable::with_domain_ops();
    let input = assemble_context(
        &json!({"variables": {"inventory": 5}}),
        &[(
            EntityType::Settlement,
            json!({"level": 3, "variables": {}}),
        )],
        None,
        &serde_json::Map::new(),
        &[],
    );

    let conditions = vec![condition];
    let first = evaluate_conditions(&conditions, &table, &input, None).unwrap();
    for _ in 0..10 {
        assert_eq!(
            evaluate_conditions(&conditions, &table, &input, None).unwrap(),
            first
        );
    }
    assert_eq!(first, json!(35));
}
