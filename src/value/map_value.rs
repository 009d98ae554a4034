use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::FieldPath;
use crate::value::{FirestoreValue, ValueKind};

/// Map of field names to values; also used as the body of a document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            match current.kind() {
                ValueKind::Map(child) => current = child.fields.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Writes `value` at `path`, replacing any non-map intermediate values.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_value_at_segments(&mut self.fields, path.segments(), value);
    }

    pub fn delete(&mut self, path: &FieldPath) {
        remove_value_at_segments(&mut self.fields, path.segments());
    }

    /// Every leaf field path in this map; empty nested maps count as leaves.
    pub fn field_mask(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        paths
    }
}

fn set_value_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child_fields = match fields.get(first).map(|v| v.kind()) {
        Some(ValueKind::Map(map)) => map.fields.clone(),
        _ => BTreeMap::new(),
    };
    set_value_at_segments(&mut child_fields, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
}

fn remove_value_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    if let Some(ValueKind::Map(child_map)) = fields.get(first).map(|v| v.kind()) {
        let mut child_fields = child_map.fields.clone();
        remove_value_at_segments(&mut child_fields, rest);
        fields.insert(first.clone(), FirestoreValue::from_map(child_fields));
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (name, value) in fields {
        prefix.push(name.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => collect_leaf_paths(&child.fields, prefix, out),
            _ => {
                if let Ok(path) = FieldPath::new(prefix.clone()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(value: &str) -> FieldPath {
        FieldPath::from_dot_separated(value).unwrap()
    }

    #[test]
    fn sets_nested_values() {
        let mut map = MapValue::empty();
        map.set(&path("stats.count"), FirestoreValue::from_integer(1));
        map.set(&path("title"), FirestoreValue::from_string("hi"));
        assert_eq!(map.get(&path("stats.count")), Some(&FirestoreValue::from_integer(1)));
        assert!(map.get(&path("stats.missing")).is_none());
        assert!(map.get(&path("title.nested")).is_none());
    }

    #[test]
    fn overwrites_scalar_with_map() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_integer(1));
        map.set(&path("a.b"), FirestoreValue::from_integer(2));
        assert_eq!(map.get(&path("a.b")), Some(&FirestoreValue::from_integer(2)));
    }

    #[test]
    fn deletes_and_lists_leaf_paths() {
        let mut map = MapValue::empty();
        map.set(&path("a.b"), FirestoreValue::from_integer(1));
        map.set(&path("a.c"), FirestoreValue::from_integer(2));
        map.set(&path("d"), FirestoreValue::null());
        map.delete(&path("a.b"));
        let mask: Vec<String> = map.field_mask().iter().map(|p| p.canonical_string()).collect();
        assert_eq!(mask, vec!["a.c".to_string(), "d".to_string()]);
    }
}
