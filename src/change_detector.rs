// Change Detector (component A): flat key->value diff between a prior snapshot and a new
// state, plus the per-session snapshot cache successive calls are relative to.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::state_tree::{flatten, Node};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added_fields: Vec<String>,
    pub removed_fields: Vec<String>,
    pub changed_fields: Vec<String>,
    pub total_changes: usize,
    pub change_percentage: f64,
}

/// Tracks the latest snapshot per session so successive `diff` calls are relative.
pub struct ChangeDetector {
    snapshots: RwLock<HashMap<String, Node>>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Compute the diff between the stored snapshot for `session_id` (if any) and `new_state`.
    /// Does not update the stored snapshot — call `commit` once the caller has decided to
    /// persist the resulting backup.
    pub fn diff(&self, session_id: &str, new_state: &Node) -> ChangeSet {
        let snapshots = self.snapshots.read();
        let prior = snapshots.get(session_id);
        diff_nodes(prior, new_state)
    }

    /// Update the cached snapshot after a backup using `new_state` has been persisted.
    pub fn commit(&self, session_id: &str, new_state: Node) {
        self.snapshots
            .write()
            .insert(session_id.to_string(), new_state);
    }

    pub fn has_snapshot(&self, session_id: &str) -> bool {
        self.snapshots.read().contains_key(session_id)
    }
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn diff_nodes(prior: Option<&Node>, new_state: &Node) -> ChangeSet {
    let empty: BTreeMap<String, Node> = BTreeMap::new();
    let prior_flat = prior.map(flatten).unwrap_or(empty);
    let new_flat = flatten(new_state);

    let mut added_fields = Vec::new();
    let mut removed_fields = Vec::new();
    let mut changed_fields = Vec::new();

    for (path, value) in &new_flat {
        match prior_flat.get(path) {
            None => added_fields.push(path.clone()),
            Some(prior_value) if prior_value != value => changed_fields.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in prior_flat.keys() {
        if !new_flat.contains_key(path) {
            removed_fields.push(path.clone());
        }
    }

    added_fields.sort();
    removed_fields.sort();
    changed_fields.sort();

    let total_changes = added_fields.len() + removed_fields.len() + changed_fields.len();
    let universe: std::collections::BTreeSet<&String> =
        prior_flat.keys().chain(new_flat.keys()).collect();
    let change_percentage = total_changes as f64 / universe.len().max(1) as f64 * 100.0;

    ChangeSet {
        added_fields,
        removed_fields,
        changed_fields,
        total_changes,
        change_percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(v: serde_json::Value) -> Node {
        Node::from(v)
    }

    #[test]
    fn first_call_reports_all_fields_added() {
        let detector = ChangeDetector::new();
        let state = node(json!({"a": 1, "b": 2}));
        let cs = detector.diff("s1", &state);
        assert_eq!(cs.added_fields.len(), 2);
        assert_eq!(cs.total_changes, 2);
        assert!((cs.change_percentage - 100.0).abs() < 1e-9);
    }

    #[test]
    fn subsequent_call_is_relative_to_committed_snapshot() {
        let detector = ChangeDetector::new();
        let s0 = node(json!({"a": 1, "b": {"c": 2}}));
        detector.commit("s1", s0);

        let s1 = node(json!({"a": 1, "b": {"c": 3}, "d": 4}));
        let cs = detector.diff("s1", &s1);

        assert_eq!(cs.added_fields, vec!["d".to_string()]);
        assert_eq!(cs.changed_fields, vec!["b.c".to_string()]);
        assert!(cs.removed_fields.is_empty());
        assert_eq!(cs.total_changes, 2);
    }

    #[test]
    fn removed_field_is_detected() {
        let detector = ChangeDetector::new();
        detector.commit("s1", node(json!({"a": 1, "b": 2})));
        let cs = detector.diff("s1", &node(json!({"a": 1})));
        assert_eq!(cs.removed_fields, vec!["b".to_string()]);
    }
}
