// Tagged-variant model for the backed-up payload (spec design note: the source treats state as
// an arbitrary tree of mappings with scalar/array leaves). `Node::Array` is always an opaque leaf:
// dotted paths address into objects only, never into array elements. This limitation is
// intentional and preserved rather than extended, per the open question it originates from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DurabilityError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

/// A node in the state tree. `BTreeMap` keeps object fields in sorted order so flattening
/// and checksums are deterministic across runs, independent of insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    Object(BTreeMap<String, Node>),
    Array(Vec<Node>),
    Scalar(Scalar),
}

impl Node {
    pub fn object() -> Self {
        Node::Object(BTreeMap::new())
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Node::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match self {
            Node::Object(m) => Some(m),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Node {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(map) => {
                Node::Object(map.into_iter().map(|(k, v)| (k, Node::from(v))).collect())
            }
            serde_json::Value::Array(items) => {
                Node::Array(items.into_iter().map(Node::from).collect())
            }
            serde_json::Value::String(s) => Node::Scalar(Scalar::String(s)),
            serde_json::Value::Number(n) => {
                Node::Scalar(Scalar::Number(n.as_f64().unwrap_or(0.0)))
            }
            serde_json::Value::Bool(b) => Node::Scalar(Scalar::Bool(b)),
            serde_json::Value::Null => Node::Scalar(Scalar::Null),
        }
    }
}

/// Inverse of `From<serde_json::Value>`, used when a change entry's value needs to cross
/// back into plain JSON for serialization into a `ChangeEntry`.
pub fn to_json_value(node: &Node) -> serde_json::Value {
    match node {
        Node::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), to_json_value(v)))
                .collect(),
        ),
        Node::Array(items) => serde_json::Value::Array(items.iter().map(to_json_value).collect()),
        Node::Scalar(Scalar::String(s)) => serde_json::Value::String(s.clone()),
        Node::Scalar(Scalar::Number(n)) => serde_json::Number::from_f64(*n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Node::Scalar(Scalar::Bool(b)) => serde_json::Value::Bool(*b),
        Node::Scalar(Scalar::Null) => serde_json::Value::Null,
    }
}

/// Flatten a tree into dotted-path -> leaf entries. Arrays are opaque leaves: the path
/// stops at the array, it is never indexed into.
pub fn flatten(node: &Node) -> BTreeMap<String, Node> {
    let mut out = BTreeMap::new();
    flatten_into(node, String::new(), &mut out);
    out
}

fn flatten_into(node: &Node, prefix: String, out: &mut BTreeMap<String, Node>) {
    match node {
        Node::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(child, path, out);
            }
        }
        other => {
            if !prefix.is_empty() {
                out.insert(prefix, other.clone());
            }
        }
    }
}

/// Read the node at a dotted path, or `None` if any intermediate segment is missing or
/// not an object.
pub fn get_path<'a>(node: &'a Node, path: &str) -> Option<&'a Node> {
    let mut current = node;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// Set the value at a dotted path, creating missing intermediate objects as needed.
pub fn set_path(node: &mut Node, path: &str, value: Node) -> Result<()> {
    let segments: Vec<&str> = path.split('.').collect();
    set_recursive(node, &segments, value)
}

fn set_recursive(node: &mut Node, segments: &[&str], value: Node) -> Result<()> {
    let (head, rest) = segments
        .split_first()
        .ok_or_else(|| DurabilityError::InvalidInput("empty path".into()))?;

    if !matches!(node, Node::Object(_)) {
        *node = Node::object();
    }
    let map = node.as_object_mut().expect("just coerced to object");

    if rest.is_empty() {
        map.insert((*head).to_string(), value);
        return Ok(());
    }

    let child = map.entry((*head).to_string()).or_insert_with(Node::object);
    set_recursive(child, rest, value)
}

/// Delete the value at a dotted path. Missing intermediate objects make this a no-op,
/// matching the patch routine's documented behavior.
pub fn remove_path(node: &mut Node, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    remove_recursive(node, &segments);
}

fn remove_recursive(node: &mut Node, segments: &[&str]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    let Some(map) = node.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        map.remove(*head);
        return;
    }
    if let Some(child) = map.get_mut(*head) {
        remove_recursive(child, rest);
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
    fn flatten_nested_object() {
        let n = node(json!({"a": 1, "b": {"c": 2, "d": 3}}));
        let flat = flatten(&n);
        assert_eq!(flat.len(), 3);
        assert!(flat.contains_key("a"));
        assert!(flat.contains_key("b.c"));
        assert!(flat.contains_key("b.d"));
    }

    #[test]
    fn arrays_are_opaque_leaves() {
        let n = node(json!({"tags": [1, 2, 3]}));
        let flat = flatten(&n);
        assert_eq!(flat.len(), 1);
        assert!(matches!(flat.get("tags"), Some(Node::Array(items)) if items.len() == 3));
    }

    #[test]
    fn set_path_creates_intermediates() {
        let mut n = Node::object();
        set_path(&mut n, "a.b.c", Node::Scalar(Scalar::Number(1.0))).unwrap();
        assert_eq!(
            get_path(&n, "a.b.c"),
            Some(&Node::Scalar(Scalar::Number(1.0)))
        );
    }

    #[test]
    fn remove_path_missing_intermediate_is_noop() {
        let mut n = node(json!({"a": 1}));
        remove_path(&mut n, "x.y.z");
        assert_eq!(flatten(&n).len(), 1);
    }

    #[test]
    fn to_json_value_round_trips_through_node() {
        let original = json!({"a": 1, "b": [1, 2], "c": "x"});
        let n = node(original.clone());
        assert_eq!(to_json_value(&n), original);
    }

    #[test]
    fn remove_path_deletes_leaf() {
        let mut n = node(json!({"a": {"b": 1, "c": 2}}));
        remove_path(&mut n, "a.b");
        let flat = flatten(&n);
        assert!(!flat.contains_key("a.b"));
        assert!(flat.contains_key("a.c"));
    }
}
