//! Per-query view state: the current result set, which keys the server has
//! confirmed for the target, and which local-only documents are in limbo.

use crate::core::document_set::DocumentSet;
use crate::core::query::LimitType;
use crate::core::view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
use crate::core::Query;
use crate::local::QueryResult;
use crate::model::{Document, DocumentKey, DocumentKeySet, DocumentMap};
use crate::remote::{OnlineState, TargetChange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SyncState {
    Local,
    Synced,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Candidate result of a view update, computed before it is applied.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    /// The limit window lost a document at its edge; the caller must re-run the
    /// query against the local store and compute the changes again.
    pub needs_refill: bool,
    pub mutated_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

#[derive(Clone, Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
    /// Keys the backend has reported for this view's target.
    synced_documents: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let document_set = DocumentSet::for_query(&query);
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
            synced_documents,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    /// Keys of the documents the view currently shows.
    pub fn document_keys(&self) -> DocumentKeySet {
        self.document_set.keys()
    }

    /// Current state reported as all-added, for a listener joining an existing view.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
        )
    }

    /// Diffs `changed` against the current documents, or against the result
    /// of an earlier pass when refilling a limit query.
    pub fn compute_doc_changes(
        &self,
        changed: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_document_set, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (DocumentChangeSet::new(), self.document_set.clone(), self.mutated_keys.clone()),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;
        let comparator = old_document_set.comparator().clone();

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(old_document_set.len());
        let last_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in changed {
            let old_document = old_document_set.get(key);
            let new_document = Some(entry).filter(|document| self.query.matches(document));
            let old_had_pending = old_document.is_some_and(|_| self.mutated_keys.contains(key));
            let new_has_pending = new_document.is_some_and(|document| {
                document.has_local_mutations()
                    || (self.mutated_keys.contains(key) && document.has_committed_mutations())
            });

            let mut applied = false;
            match (old_document, new_document) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new.clone()));
                            applied = true;
                            let beyond_last = last_in_limit
                                .as_ref()
                                .is_some_and(|last| comparator(new, last).is_gt());
                            let before_first = first_in_limit
                                .as_ref()
                                .is_some_and(|first| comparator(new, first).is_lt());
                            if beyond_last || before_first {
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new.clone()));
                        applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new.clone()));
                    applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old.clone()));
                    applied = true;
                    if last_in_limit.is_some() || first_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if applied {
                match new_document {
                    Some(new) => {
                        document_set = document_set.add(new.clone());
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        document_set = document_set.delete(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last(),
                    LimitType::Last => document_set.first(),
                }
                .cloned();
                let Some(evicted) = evicted else { break };
                document_set = document_set.delete(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            needs_refill,
            mutated_keys,
        }
    }

    /// Commits `doc_changes` and produces a snapshot if anything visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        update_limbo_documents: bool,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let comparator = self.document_set.comparator().clone();
        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| comparator(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if update_limbo_documents {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };
        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                documents: doc_changes.document_set,
                old_documents,
                document_changes: changes,
                mutated_keys: doc_changes.mutated_keys,
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
            }),
            limbo_changes,
        }
    }

    /// Going offline drops a current view back to "from cache".
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                needs_refill: false,
                mutated_keys: self.mutated_keys.clone(),
            };
            return self.apply_changes(unchanged, false, None);
        }
        ViewChange::default()
    }

    /// Replaces the view's state with what another instance persisted.
    pub fn synchronize_with_persisted_state(&mut self, result: QueryResult) -> ViewChange {
        self.synced_documents = result.remote_keys;
        self.limbo_documents = DocumentKeySet::new();
        let doc_changes = self.compute_doc_changes(&result.documents, None);
        self.apply_changes(doc_changes, true, None)
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else { return };
        for key in &change.added_documents {
            self.synced_documents.insert(key.clone());
        }
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            Some(document) => !document.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: DocumentKeySet = self
            .document_set
            .iter()
            .map(|document| document.key())
            .filter(|key| self.should_be_in_limbo(key))
            .cloned()
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .iter()
            .filter(|key| !new_limbo.contains(*key))
            .map(|key| LimboDocumentChange::Removed(key.clone()))
            .collect();
        changes.extend(
            new_limbo
                .iter()
                .filter(|key| !old_limbo.contains(*key))
                .map(|key| LimboDocumentChange::Added(key.clone())),
        );
        self.limbo_documents = new_limbo;
        changes
    }
}

/// A locally modified document whose acknowledged version arrives before the
/// watch stream confirms it keeps showing the local version.
fn should_wait_for_synced_document(old: &Document, new: &Document) -> bool {
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}
