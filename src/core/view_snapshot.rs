use std::collections::BTreeMap;

use crate::core::document_set::DocumentSet;
use crate::core::Query;
use crate::model::{Document, DocumentKey, DocumentKeySet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only `has_pending_writes` changed.
    Metadata,
}

impl ChangeType {
    /// Removals sort first so consumers can apply changes by index.
    pub(crate) fn sort_rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, document: Document) -> Self {
        Self { change_type, document }
    }
}

/// Accumulates per-key changes, collapsing successive changes to one key into
/// the net effect.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (change.change_type, old.change_type) {
            (new_type, Metadata) if new_type != Added => Some(change),
            (Metadata, old_type) if old_type != Removed => Some(DocumentViewChange::new(old_type, change.document)),
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.document)),
            (Modified, Added) => Some(DocumentViewChange::new(Added, change.document)),
            (Removed, Added) => None,
            (Removed, Modified) => Some(DocumentViewChange::new(Removed, old.document.clone())),
            (Added, Removed) => Some(DocumentViewChange::new(Modified, change.document)),
            (new_type, old_type) => {
                log::error!("Unsupported change {new_type:?} after {old_type:?} for {key}");
                Some(change)
            }
        };
        match merged {
            Some(change) => {
                self.changes.insert(key, change);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }
}

/// Immutable result of one query at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub documents: DocumentSet,
    pub old_documents: DocumentSet,
    pub document_changes: Vec<DocumentViewChange>,
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    /// Snapshot that reports every document as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeType::Added, document.clone()))
            .collect();
        let old_documents = DocumentSet::new(documents.comparator().clone());
        Self {
            query,
            documents,
            old_documents,
            document_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}
