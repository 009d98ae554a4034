use serde::{Deserialize, Serialize};

use crate::model::{DocumentKey, FieldPath, SnapshotVersion};
use crate::value::{FirestoreValue, MapValue};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DocumentKind {
    /// The document exists at `version` with the given contents.
    Found(MapValue),
    /// The document is known not to exist at `version`.
    NoDocument,
    /// The document was changed by a committed write but its contents are unknown.
    Unknown,
}

/// Cached or locally computed state of a single document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    key: DocumentKey,
    version: SnapshotVersion,
    kind: DocumentKind,
    has_local_mutations: bool,
    has_committed_mutations: bool,
}

impl Document {
    pub fn found(key: DocumentKey, version: SnapshotVersion, data: MapValue) -> Self {
        Self::with_kind(key, version, DocumentKind::Found(data))
    }

    pub fn no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_kind(key, version, DocumentKind::NoDocument)
    }

    pub fn unknown(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_kind(key, version, DocumentKind::Unknown)
    }

    fn with_kind(key: DocumentKey, version: SnapshotVersion, kind: DocumentKind) -> Self {
        Self {
            key,
            version,
            kind,
            has_local_mutations: false,
            has_committed_mutations: false,
        }
    }

    pub fn with_local_mutations(mut self) -> Self {
        self.has_local_mutations = true;
        self.has_committed_mutations = false;
        self
    }

    pub fn with_committed_mutations(mut self) -> Self {
        self.has_committed_mutations = true;
        self.has_local_mutations = false;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn kind(&self) -> &DocumentKind {
        &self.kind
    }

    pub fn is_found_document(&self) -> bool {
        matches!(self.kind, DocumentKind::Found(_))
    }

    pub fn is_no_document(&self) -> bool {
        matches!(self.kind, DocumentKind::NoDocument)
    }

    pub fn is_unknown_document(&self) -> bool {
        matches!(self.kind, DocumentKind::Unknown)
    }

    pub fn data(&self) -> Option<&MapValue> {
        match &self.kind {
            DocumentKind::Found(data) => Some(data),
            _ => None,
        }
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data().and_then(|data| data.get(path))
    }

    pub fn has_local_mutations(&self) -> bool {
        self.has_local_mutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.has_committed_mutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations || self.has_committed_mutations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_exclusive() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let doc = Document::found(key, SnapshotVersion::min(), MapValue::empty()).with_local_mutations();
        assert!(doc.has_local_mutations());
        let committed = doc.with_committed_mutations();
        assert!(!committed.has_local_mutations());
        assert!(committed.has_pending_writes());
        assert!(committed.is_found_document());
    }
}
