use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::graph::FieldNode;

/// Computed-field results, cached per `(branch, asOf)` read point.
/// Invalidation removes exactly the nodes whose dependencies changed; a
/// world-time advance drops whole read points instead, since every `asOf`
/// under the old clock is stale.
#[derive(Default)]
pub struct ResultCache {
    entries: HashMap<(Uuid, DateTime<Utc>), HashMap<FieldNode, Value>>,
}

impl ResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, branch_id: Uuid, as_of: DateTime<Utc>, node: &FieldNode) -> Option<&Value> {
        self.entries.get(&(branch_id, as_of))?.get(node)
    }

    pub fn put(&mut self, branch_id: Uuid, as_of: DateTime<Utc>, node: FieldNode, value: Value) {
        self.entries
            .entry((branch_id, as_of))
            .or_default()
            .insert(node, value);
    }

    /// Wipes the given nodes from every read point of the branch.
    pub fn invalidate_nodes(&mut self, branch_id: Uuid, nodes: &[FieldNode]) {
        for ((entry_branch, _), results) in self.entries.iter_mut() {
            if *entry_branch != branch_id {
                continue;
            }
            for node in nodes {
                results.remove(node);
            }
        }
        self.entries.retain(|_, results| !results.is_empty());
    }

    /// Wipes every read point of the branch.
    pub fn invalidate_branch(&mut self, branch_id: Uuid) {
        self.entries.retain(|(entry_branch, _), _| *entry_branch != branch_id);
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use crate::entity::{EntityRef, EntityType};

    use super::*;

    fn node(field: &str) -> FieldNode {
        FieldNode::new(EntityRef::new(EntityType::Structure, Uuid::nil()), field)
    }

    #[test]
    fn hits_are_scoped_to_branch_and_read_point() {
        let mut cache = ResultCache::new();
        let branch = Uuid::new_v4();
        let other_branch = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(4707, 3, 15, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(4707, 3, 16, 0, 0, 0).unwrap();

        cache.put(branch, at, node("available"), json!(true));
        assert_eq!(cache.get(branch, at, &node("available")), Some(&json!(true)));
        assert_eq!(cache.get(branch, later, &node("available")), None);
        assert_eq!(cache.get(other_branch, at, &node("available")), None);
    }

    #[test]
    fn node_invalidation_leaves_unrelated_entries() {
        let mut cache = ResultCache::new();
        let branch = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(4707, 3, 15, 0, 0, 0).unwrap();

        cache.put(branch, at, node("available"), json!(true));
        cache.put(branch, at, node("openHours"), json!(8));
        cache.invalidate_nodes(branch, &[node("available")]);

        assert_eq!(cache.get(branch, at, &node("available")), None);
        assert_eq!(cache.get(branch, at, &node("openHours")), Some(&json!(8)));
    }

    #[test]
    fn branch_invalidation_drops_every_read_point() {
        let mut cache = ResultCache::new();
        let branch = Uuid::new_v4();
        let at = Utc.with_ymd_and_hms(4707, 3, 15, 0, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(4707, 3, 16, 0, 0, 0).unwrap();

        cache.put(branch, at, node("available"), json!(true));
        cache.put(branch, later, node("available"), json!(false));
        cache.invalidate_branch(branch);
        assert!(cache.is_empty());
    }
}
