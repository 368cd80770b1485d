mod cache;
mod recompute;

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};

use petgraph::visit::EdgeRef;
use petgraph::Direction;
use daggy::stable_dag::StableDag;
use daggy::NodeIndex;
use uuid::Uuid;

use crate::entity::EntityRef;
use crate::error::{CoreError, CoreResult};

pub use cache::ResultCache;
pub use recompute::{spawn_recompute_worker, RecomputeBatch, RecomputeQueue};

/// A computed-field node: one field of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldNode {
    pub entity: EntityRef,
    pub field: String,
}

impl FieldNode {
    pub fn new(entity: EntityRef, field: impl Into<String>) -> Self {
        FieldNode {
            entity,
            field: field.into(),
        }
    }
}

impl Display for FieldNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.entity, self.field)
    }
}

/// What a condition can depend on: another computed field / entity field, or
/// the campaign clock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DepNode {
    Field(FieldNode),
    WorldTime,
}

impl Display for DepNode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DepNode::Field(node) => node.fmt(f),
            DepNode::WorldTime => f.write_str("worldTime"),
        }
    }
}

impl From<FieldNode> for DepNode {
    fn from(node: FieldNode) -> Self {
        DepNode::Field(node)
    }
}

/// Field-to-field dependency DAG for one campaign. Edges run from the
/// referenced node to the referrer, so walking outgoing edges answers "what
/// must recompute when this changes". Which conditions keep an edge alive is
/// tracked beside the dag; the edge disappears with its last condition.
pub struct DependencyGraph {
    dag: StableDag<DepNode, ()>,
    indices: HashMap<DepNode, NodeIndex>,
    edges: HashMap<(NodeIndex, NodeIndex), daggy::EdgeIndex>,
    edge_conditions: HashMap<(NodeIndex, NodeIndex), HashSet<Uuid>>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        DependencyGraph {
            dag: StableDag::new(),
            indices: HashMap::new(),
            edges: HashMap::new(),
            edge_conditions: HashMap::new(),
        }
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, node: DepNode) -> NodeIndex {
        if let Some(index) = self.indices.get(&node) {
            return *index;
        }
        let index = self.dag.add_node(node.clone());
        self.indices.insert(node, index);
        index
    }

    /// Registers a condition: one edge per dependency, pointing at the
    /// condition's target field. Rejects edges that would close a cycle,
    /// naming the path that already runs the other way.
    pub fn add_condition(
        &mut self,
        condition_id: Uuid,
        target: FieldNode,
        dependencies: impl IntoIterator<Item = DepNode>,
    ) -> CoreResult<()> {
        let target_index = self.intern(DepNode::Field(target.clone()));
        for dependency in dependencies {
            let dep_index = self.intern(dependency.clone());
            if dep_index == target_index {
                return Err(self.cycle_error(target_index, dep_index));
            }

            let key = (dep_index, target_index);
            if self.edges.contains_key(&key) {
                self.edge_conditions
                    .entry(key)
                    .or_default()
                    .insert(condition_id);
                continue;
            }

            match self.dag.add_edge(dep_index, target_index, ()) {
                Ok(edge) => {
                    self.edges.insert(key, edge);
                    self.edge_conditions
                        .entry(key)
                        .or_default()
                        .insert(condition_id);
                }
                Err(_) => return Err(self.cycle_error(target_index, dep_index)),
            }
        }
        Ok(())
    }

    /// The would-be edge `dep -> target` closes a cycle, so a path
    /// `target -> ... -> dep` already exists; that path is the offence.
    fn cycle_error(&self, target: NodeIndex, dep: NodeIndex) -> CoreError {
        let mut path = self
            .find_path(target, dep)
            .unwrap_or_else(|| vec![target, dep]);
        path.push(target);
        CoreError::CircularDependency {
            path: path
                .into_iter()
                .filter_map(|index| self.dag.graph().node_weight(index))
                .map(ToString::to_string)
                .collect(),
        }
    }

    fn find_path(&self, from: NodeIndex, to: NodeIndex) -> Option<Vec<NodeIndex>> {
        let mut stack = vec![vec![from]];
        let mut seen = HashSet::new();
        while let Some(path) = stack.pop() {
            let last = *path.last()?;
            if last == to {
                return Some(path);
            }
            if !seen.insert(last) {
                continue;
            }
            for edge in self.dag.graph().edges_directed(last, Direction::Outgoing) {
                let mut next = path.clone();
                next.push(edge.target());
                stack.push(next);
            }
        }
        None
    }

    /// Drops the condition from every edge; edges no other condition uses
    /// disappear with it.
    pub fn remove_condition(&mut self, condition_id: Uuid) {
        let mut stale = Vec::new();
        for (key, conditions) in self.edge_conditions.iter_mut() {
            if conditions.remove(&condition_id) && conditions.is_empty() {
                stale.push(*key);
            }
        }
        for key in stale {
            self.edge_conditions.remove(&key);
            if let Some(edge) = self.edges.remove(&key) {
                self.dag.remove_edge(edge);
            }
        }
    }

    /// Everything downstream of `node`, in topological (recompute) order.
    /// The changed node itself is not included.
    pub fn invalidate(&self, node: &DepNode) -> Vec<FieldNode> {
        let Some(start) = self.indices.get(node) else {
            return Vec::new();
        };

        // reachability first, then order by a global toposort
        let mut reachable = HashSet::new();
        let mut stack = vec![*start];
        while let Some(current) = stack.pop() {
            for edge in self
                .dag
                .graph()
                .edges_directed(current, Direction::Outgoing)
            {
                if reachable.insert(edge.target()) {
                    stack.push(edge.target());
                }
            }
        }

        let order = petgraph::algo::toposort(self.dag.graph(), None)
            .unwrap_or_default();
        order
            .into_iter()
            .filter(|index| reachable.contains(index))
            .filter_map(|index| match self.dag.graph().node_weight(index) {
                Some(DepNode::Field(node)) => Some(node.clone()),
                _ => None,
            })
            .collect()
    }

    /// Downstream nodes for a mutation; alias of [`invalidate`] in the shape
    /// mutations use.
    pub fn affected_by(&self, change: &DepNode) -> Vec<FieldNode> {
        self.invalidate(change)
    }

    /// All nodes that depend on the campaign clock.
    pub fn time_sensitive(&self) -> Vec<FieldNode> {
        self.invalidate(&DepNode::WorldTime)
    }

    pub fn node_count(&self) -> usize {
        self.dag.graph().node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.dag.graph().edge_count()
    }
}

#[cfg(test)]
mod tests {
    use crate::entity::EntityType;

    use super::*;

    fn field(ty: EntityType, id: Uuid, name: &str) -> FieldNode {
        FieldNode::new(EntityRef::new(ty, id), name)
    }

    #[test]
    fn invalidation_walks_downstream_in_topological_order() {
        let mut graph = DependencyGraph::new();
        let settlement = Uuid::new_v4();
        let structure = Uuid::new_v4();

        let level = field(EntityType::Settlement, settlement, "level");
        let available = field(EntityType::Structure, structure, "available");
        let open_hours = field(EntityType::Structure, structure, "openHours");

        // level -> available -> openHours
        graph
            .add_condition(Uuid::new_v4(), available.clone(), [level.clone().into()])
            .unwrap();
        graph
            .add_condition(Uuid::new_v4(), open_hours.clone(), [available.clone().into()])
            .unwrap();

        let order = graph.invalidate(&level.clone().into());
        assert_eq!(order, vec![available.clone(), open_hours.clone()]);

        // a change to `available` leaves `level` alone
        let order = graph.invalidate(&available.into());
        assert_eq!(order, vec![open_hours]);
    }

    #[test]
    fn cycles_are_rejected_with_the_offending_path() {
        let mut graph = DependencyGraph::new();
        let a = field(EntityType::Settlement, Uuid::new_v4(), "a");
        let b = field(EntityType::Settlement, Uuid::new_v4(), "b");
        let c = field(EntityType::Settlement, Uuid::new_v4(), "c");

        graph
            .add_condition(Uuid::new_v4(), b.clone(), [a.clone().into()])
            .unwrap();
        graph
            .add_condition(Uuid::new_v4(), c.clone(), [b.clone().into()])
            .unwrap();

        let err = graph
            .add_condition(Uuid::new_v4(), a.clone(), [c.clone().into()])
            .unwrap_err();
        match err {
            CoreError::CircularDependency { path } => {
                assert!(path.len() >= 3);
                assert!(path.first().unwrap().contains(".a"));
                assert!(path.last().unwrap().contains(".a"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let mut graph = DependencyGraph::new();
        let node = field(EntityType::Kingdom, Uuid::new_v4(), "treasury");
        let err = graph
            .add_condition(Uuid::new_v4(), node.clone(), [node.into()])
            .unwrap_err();
        assert!(matches!(err, CoreError::CircularDependency { .. }));
    }

    #[test]
    fn removing_the_last_condition_drops_the_edge() {
        let mut graph = DependencyGraph::new();
        let level = field(EntityType::Settlement, Uuid::new_v4(), "level");
        let available = field(EntityType::Structure, Uuid::new_v4(), "available");

        let only = Uuid::new_v4();
        graph
            .add_condition(only, available.clone(), [level.clone().into()])
            .unwrap();
        assert_eq!(graph.invalidate(&level.clone().into()), vec![available.clone()]);

        graph.remove_condition(only);
        assert!(graph.invalidate(&level.into()).is_empty());
    }

    #[test]
    fn shared_edges_survive_until_every_condition_is_gone() {
        let mut graph = DependencyGraph::new();
        let level = field(EntityType::Settlement, Uuid::new_v4(), "level");
        let available = field(EntityType::Structure, Uuid::new_v4(), "available");

        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        graph
            .add_condition(first, available.clone(), [level.clone().into()])
            .unwrap();
        graph
            .add_condition(second, available.clone(), [level.clone().into()])
            .unwrap();

        graph.remove_condition(first);
        assert_eq!(graph.invalidate(&level.clone().into()), vec![available.clone()]);
        graph.remove_condition(second);
        assert!(graph.invalidate(&level.into()).is_empty());
    }

    #[test]
    fn world_time_dependencies_surface_as_time_sensitive() {
        let mut graph = DependencyGraph::new();
        let open = field(EntityType::Structure, Uuid::new_v4(), "open");
        graph
            .add_condition(Uuid::new_v4(), open.clone(), [DepNode::WorldTime])
            .unwrap();
        assert_eq!(graph.time_sensitive(), vec![open]);
    }

    #[test]
    fn unknown_nodes_invalidate_nothing() {
        let graph = DependencyGraph::new();
        let node = field(EntityType::Party, Uuid::new_v4(), "strength");
        assert!(graph.invalidate(&node.into()).is_empty());
    }
}
