use crate::model::{DocumentKey, DocumentKeySet, TargetId};

/// In-memory `(document, id)` references, queryable by either side.
///
/// Views register the documents they show locally here so garbage collection
/// never drops a document that a listener can still see. The same structure
/// tracks which limbo documents each target depends on.
#[derive(Clone, Debug, Default)]
pub struct ReferenceSet {
    by_key: im::OrdSet<(DocumentKey, TargetId)>,
    by_id: im::OrdSet<(TargetId, DocumentKey)>,
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: TargetId) {
        self.by_id.insert((id, key.clone()));
        self.by_key.insert((key, id));
    }

    pub fn add_references(&mut self, keys: &DocumentKeySet, id: TargetId) {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: &DocumentKey, id: TargetId) {
        self.by_key.remove(&(key.clone(), id));
        self.by_id.remove(&(id, key.clone()));
    }

    pub fn remove_references(&mut self, keys: &DocumentKeySet, id: TargetId) {
        for key in keys {
            self.remove_reference(key, id);
        }
    }

    /// Drops every reference held by `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: TargetId) -> DocumentKeySet {
        let keys = self.references_for_id(id);
        self.remove_references(&keys, id);
        keys
    }

    pub fn remove_all_references(&mut self) {
        self.by_key.clear();
        self.by_id.clear();
    }

    pub fn references_for_id(&self, id: TargetId) -> DocumentKeySet {
        self.by_id
            .iter()
            .skip_while(|(ref_id, _)| *ref_id < id)
            .take_while(|(ref_id, _)| *ref_id == id)
            .map(|(_, key)| key.clone())
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.by_key
            .iter()
            .find(|(ref_key, _)| ref_key >= key)
            .is_some_and(|(ref_key, _)| ref_key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_from_both_sides() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("rooms/a"), 1);
        refs.add_reference(key("rooms/a"), 2);
        refs.add_reference(key("rooms/b"), 2);

        assert!(refs.contains_key(&key("rooms/a")));
        assert!(!refs.contains_key(&key("rooms/c")));
        assert_eq!(refs.references_for_id(2).len(), 2);

        let removed = refs.remove_references_for_id(2);
        assert_eq!(removed.len(), 2);
        assert!(refs.contains_key(&key("rooms/a")));
        assert!(!refs.contains_key(&key("rooms/b")));

        refs.remove_reference(&key("rooms/a"), 1);
        assert!(refs.is_empty());
    }
}
