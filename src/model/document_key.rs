use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{invalid_argument, FirestoreResult};
use crate::model::ResourcePath;

/// Full path of a document; totally ordered segment by segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !Self::is_document_key(&path) {
            return Err(invalid_argument(
                "Document keys must point to a document (even number of segments)",
            ));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        let resource = ResourcePath::from_string(path)?;
        Self::from_path(resource)
    }

    pub fn is_document_key(path: &ResourcePath) -> bool {
        path.len() >= 2 && path.len() % 2 == 0
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// The id of the collection this document lives in.
    pub fn collection_group(&self) -> &str {
        self.path.segment(self.path.len() - 2).unwrap_or_default()
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_even_segments() {
        let err = DocumentKey::from_string("rooms").unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn parses_valid_path() {
        let key = DocumentKey::from_string("rooms/eros/messages/1").unwrap();
        assert_eq!(key.id(), "1");
        assert_eq!(key.collection_group(), "messages");
        assert_eq!(key.collection_path().canonical_string(), "rooms/eros/messages");
    }

    #[test]
    fn keys_are_ordered_by_path() {
        let a = DocumentKey::from_string("c/a").unwrap();
        let b = DocumentKey::from_string("c/a/sub/z").unwrap();
        let c = DocumentKey::from_string("c/b").unwrap();
        let mut keys = vec![c.clone(), b.clone(), a.clone()];
        keys.sort();
        assert_eq!(keys, vec![a, b, c]);
    }
}
