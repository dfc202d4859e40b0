//! Nested, path-addressable variable context.
//!
//! A `Variables` tree holds the state a pipeline run reads and writes.
//! Leaves are JSON scalars, interior nodes are mappings or sequences.
//! Paths use dotted notation (`result.items.0.name`); keys never contain
//! a dot, and integer segments index sequences.

use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised by path operations on a variable context.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("'{path}' is not a sequence")]
    NotASequence { path: String },
    #[error("cannot descend into scalar at '{path}'")]
    ScalarInPath { path: String },
    #[error("sequence index out of range at '{path}'")]
    IndexOutOfRange { path: String },
}

#[derive(Debug, Clone, Default)]
pub struct Variables {
    root: Map<String, Value>,
}

enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn segments(path: &str) -> impl Iterator<Item = Segment<'_>> {
    path.split('.').map(|part| match part.parse::<usize>() {
        Ok(idx) => Segment::Index(idx),
        Err(_) => Segment::Key(part),
    })
}

impl Variables {
    pub fn new() -> Self {
        Self { root: Map::new() }
    }

    /// Build a context from a JSON mapping. Non-mapping values yield an
    /// empty context.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(root) => Self { root },
            _ => Self::new(),
        }
    }

    pub fn from_map(root: Map<String, Value>) -> Self {
        Self { root }
    }

    /// The underlying mapping, for evaluation scopes.
    pub fn root(&self) -> &Map<String, Value> {
        &self.root
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.root)
    }

    /// Independent copy whose mutations do not leak back.
    pub fn child(&self) -> Variables {
        self.clone()
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// Resolve a dotted path. Falls through mappings and sequences;
    /// integer segments index sequences.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let mut current: Option<&Value> = None;
        for seg in segments(path) {
            current = match (current, seg) {
                (None, Segment::Key(key)) => self.root.get(key),
                (None, Segment::Index(_)) => None,
                (Some(Value::Object(map)), Segment::Key(key)) => map.get(key),
                (Some(Value::Array(seq)), Segment::Index(idx)) => seq.get(idx),
                // A numeric mapping key still resolves through an object.
                (Some(Value::Object(map)), Segment::Index(idx)) => map.get(&idx.to_string()),
                _ => None,
            };
            current?;
        }
        current
    }

    /// Assign a value at a dotted path, creating intermediate mappings as
    /// needed. Integer segments may only index existing sequences; indexing
    /// past the end pads the sequence with nulls.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), PathError> {
        let parts: Vec<&str> = path.split('.').collect();
        let mut current = SlotMut::Map(&mut self.root);

        for (i, part) in parts.iter().enumerate() {
            let here = parts[..=i].join(".");
            let last = i == parts.len() - 1;
            current = match current {
                SlotMut::Map(map) => {
                    if last {
                        map.insert(part.to_string(), value);
                        return Ok(());
                    }
                    let slot = map
                        .entry(part.to_string())
                        .or_insert_with(|| Value::Object(Map::new()));
                    descend(slot, &here)?
                }
                SlotMut::Seq(seq) => {
                    let idx: usize = part
                        .parse()
                        .map_err(|_| PathError::NotASequence { path: here.clone() })?;
                    while seq.len() <= idx {
                        seq.push(Value::Null);
                    }
                    if last {
                        seq[idx] = value;
                        return Ok(());
                    }
                    if matches!(seq[idx], Value::Null) {
                        seq[idx] = Value::Object(Map::new());
                    }
                    descend(&mut seq[idx], &here)?
                }
            };
        }
        Ok(())
    }

    /// Deep overlay of another tree. Mappings merge recursively; scalars
    /// and sequences replace wholesale.
    pub fn merge(&mut self, other: &Map<String, Value>) {
        merge_map(&mut self.root, other);
    }

    pub fn merge_value(&mut self, other: &Value) {
        if let Value::Object(map) = other {
            self.merge(map);
        }
    }

    /// Append into the sequence at `path`. The path must be unset (a new
    /// one-element sequence is created) or resolve to a sequence.
    pub fn append(&mut self, path: &str, value: Value) -> Result<(), PathError> {
        match self.get(path) {
            None => self.set(path, Value::Array(vec![value])),
            Some(Value::Array(_)) => {
                // Re-borrow mutably now that we know the shape.
                if let Some(Value::Array(seq)) = self.get_mut(path) {
                    seq.push(value);
                }
                Ok(())
            }
            Some(_) => Err(PathError::NotASequence {
                path: path.to_string(),
            }),
        }
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.root.get_mut(first)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get_mut(part)?,
                Value::Array(seq) => seq.get_mut(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

enum SlotMut<'a> {
    Map(&'a mut Map<String, Value>),
    Seq(&'a mut Vec<Value>),
}

fn descend<'a>(slot: &'a mut Value, path: &str) -> Result<SlotMut<'a>, PathError> {
    match slot {
        Value::Object(map) => Ok(SlotMut::Map(map)),
        Value::Array(seq) => Ok(SlotMut::Seq(seq)),
        _ => {
            // Scalars in the middle of a path are replaced by a mapping,
            // matching merge semantics where a conflict replaces.
            *slot = Value::Object(Map::new());
            match slot {
                Value::Object(map) => Ok(SlotMut::Map(map)),
                _ => Err(PathError::ScalarInPath {
                    path: path.to_string(),
                }),
            }
        }
    }
}

fn merge_map(target: &mut Map<String, Value>, updates: &Map<String, Value>) {
    for (key, value) in updates {
        match (target.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                merge_map(existing, incoming);
            }
            _ => {
                target.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Variables {
        Variables::from_value(value)
    }

    #[test]
    fn test_get_falls_through_mappings_and_sequences() {
        let v = ctx(json!({"a": {"b": [{"c": 7}]}}));
        assert_eq!(v.get("a.b.0.c"), Some(&json!(7)));
        assert_eq!(v.get("a.b.1.c"), None);
        assert_eq!(v.get("missing"), None);
    }

    #[test]
    fn test_set_creates_intermediate_mappings() {
        let mut v = Variables::new();
        v.set("a.b.c", json!(1)).unwrap();
        assert_eq!(v.get("a.b.c"), Some(&json!(1)));
    }

    #[test]
    fn test_set_indexes_existing_sequence() {
        let mut v = ctx(json!({"xs": [1, 2, 3]}));
        v.set("xs.1", json!(9)).unwrap();
        assert_eq!(v.get("xs"), Some(&json!([1, 9, 3])));
    }

    #[test]
    fn test_merge_is_deep_and_scalars_replace() {
        let mut a = ctx(json!({"p": {"x": 1, "y": 2}, "q": [1, 2]}));
        a.merge_value(&json!({"p": {"y": 3, "z": 4}, "q": [9]}));
        assert_eq!(
            a.into_value(),
            json!({"p": {"x": 1, "y": 3, "z": 4}, "q": [9]})
        );
    }

    #[test]
    fn test_merge_associativity_and_identity() {
        let base = json!({"a": {"b": 1}, "c": 2});
        let upd1 = json!({"a": {"d": 3}});
        let upd2 = json!({"a": {"b": 9}, "e": 4});

        // (A ⊕ B) ⊕ C
        let mut left = ctx(base.clone());
        left.merge_value(&upd1);
        left.merge_value(&upd2);

        // A ⊕ (B ⊕ C)
        let mut inner = ctx(upd1.clone());
        inner.merge_value(&upd2);
        let mut right = ctx(base.clone());
        right.merge_value(&inner.into_value());

        assert_eq!(left.into_value(), right.into_value());

        let mut ident = ctx(base.clone());
        ident.merge_value(&json!({}));
        assert_eq!(ident.into_value(), base);
    }

    #[test]
    fn test_child_does_not_leak_mutations() {
        let parent = ctx(json!({"a": 1}));
        let mut kid = parent.child();
        kid.set("a", json!(2)).unwrap();
        kid.set("b", json!(3)).unwrap();
        assert_eq!(parent.get("a"), Some(&json!(1)));
        assert!(!parent.has("b"));
    }

    #[test]
    fn test_append_creates_and_extends() {
        let mut v = Variables::new();
        v.append("out", json!("a")).unwrap();
        v.append("out", json!("b")).unwrap();
        assert_eq!(v.get("out"), Some(&json!(["a", "b"])));
    }

    #[test]
    fn test_append_rejects_non_sequence() {
        let mut v = ctx(json!({"out": "scalar"}));
        let err = v.append("out", json!(1)).unwrap_err();
        assert!(matches!(err, PathError::NotASequence { .. }));
    }
}
