use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::core::Query;
use crate::model::{Document, DocumentKey, DocumentKeySet, DocumentMap};

pub type DocumentComparator = Arc<dyn Fn(&Document, &Document) -> Ordering + Send + Sync>;

/// Documents of one query result, kept in query order and indexed by key.
///
/// Both indexes are persistent collections, so cloning a set and adding to the
/// clone leaves the original untouched; views diff old and new sets cheaply.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    key_index: DocumentMap,
    sorted: im::Vector<Document>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            key_index: DocumentMap::new(),
            sorted: im::Vector::new(),
        }
    }

    pub fn for_query(query: &Query) -> Self {
        Self::new(Arc::new(query.comparator()))
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn has(&self, key: &DocumentKey) -> bool {
        self.key_index.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.key_index.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.front()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.back()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.key_index.get(key)?;
        self.sorted
            .binary_search_by(|probe| (self.comparator)(probe, document))
            .ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> + '_ {
        self.sorted.iter()
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.key_index.keys().cloned().collect()
    }

    /// Copy of this set with `document` inserted, replacing any entry with the same key.
    pub fn add(&self, document: Document) -> Self {
        let mut next = self.delete(document.key());
        let position = match next
            .sorted
            .binary_search_by(|probe| (next.comparator)(probe, &document))
        {
            Ok(position) | Err(position) => position,
        };
        next.key_index.insert(document.key().clone(), document.clone());
        next.sorted.insert(position, document);
        next
    }

    pub fn delete(&self, key: &DocumentKey) -> Self {
        let mut next = self.clone();
        if let Some(position) = self.index_of(key) {
            next.sorted.remove(position);
            next.key_index.remove(key);
        }
        next
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.sorted.iter().map(|document| document.key().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::Direction;
    use crate::model::{FieldPath, ResourcePath, SnapshotVersion, Timestamp};
    use crate::value::{FirestoreValue, MapValue};

    fn doc(path: &str, n: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        Document::found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn by_n() -> DocumentSet {
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap())
            .order_by(FieldPath::from_dot_separated("n").unwrap(), Direction::Ascending);
        DocumentSet::for_query(&query)
    }

    #[test]
    fn keeps_query_order_and_replaces_by_key() {
        let set = by_n().add(doc("rooms/a", 3)).add(doc("rooms/b", 1)).add(doc("rooms/c", 2));
        let order: Vec<String> = set.iter().map(|d| d.key().id().to_string()).collect();
        assert_eq!(order, vec!["b", "c", "a"]);

        let moved = set.add(doc("rooms/a", 0));
        assert_eq!(moved.len(), 3);
        assert_eq!(moved.first().unwrap().key().id(), "a");
        assert_eq!(moved.index_of(&DocumentKey::from_string("rooms/c").unwrap()), Some(2));
        assert_eq!(set.first().unwrap().key().id(), "b");
    }

    #[test]
    fn delete_leaves_the_original_untouched() {
        let set = by_n().add(doc("rooms/a", 1)).add(doc("rooms/b", 2));
        let smaller = set.delete(&DocumentKey::from_string("rooms/a").unwrap());
        assert_eq!(smaller.len(), 1);
        assert!(!smaller.has(&DocumentKey::from_string("rooms/a").unwrap()));
        assert_eq!(set.len(), 2);
        assert_ne!(set, smaller);
    }
}
