use std::collections::{BTreeMap, BTreeSet};

use crate::local::{TargetData, TargetPurpose};
use crate::model::{Document, DocumentKey, DocumentKeySet, SnapshotVersion, TargetId};
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState, WatchChange,
    WatchTargetChange,
};

/// Provides metadata about active targets so the aggregator can reason about
/// documents the client already holds.
pub trait TargetMetadataProvider {
    /// Keys the backend last reported for the target, as persisted locally.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Target data for a target the client is listening to, `None` once unlistened.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug)]
struct TargetState {
    /// Watch and unwatch requests the backend has not acknowledged yet. While
    /// non-zero, changes for the target belong to an older request and are dropped.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::for_current_change(self.current, self.resume_token.clone());
        for (key, kind) in &self.document_changes {
            let set = match kind {
                DocumentChangeKind::Added => &mut change.added_documents,
                DocumentChangeKind::Modified => &mut change.modified_documents,
                DocumentChangeKind::Removed => &mut change.removed_documents,
            };
            set.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Accumulates watch changes between consistent snapshots and turns them into
/// a [`RemoteEvent`].
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    pending_document_updates_by_target: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_watch_change(&mut self, provider: &dyn TargetMetadataProvider, change: WatchChange) {
        match change {
            WatchChange::TargetChange(change) => self.handle_target_change(provider, &change),
            WatchChange::DocumentChange(change) => self.handle_document_change(provider, change),
            WatchChange::DocumentDelete(delete) => self.handle_document_delete(provider, delete),
            WatchChange::DocumentRemove(remove) => self.handle_document_remove(provider, remove),
            WatchChange::ExistenceFilter(filter) => self.handle_existence_filter(provider, filter),
        }
    }

    pub fn handle_document_change(&mut self, provider: &dyn TargetMetadataProvider, change: DocumentChange) {
        let key = change.document.key().clone();
        for target_id in &change.updated_target_ids {
            if change.document.is_found_document() {
                self.add_document_to_target(provider, *target_id, change.document.clone());
            } else {
                self.remove_document_from_target(provider, *target_id, &key, Some(change.document.clone()));
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, &key, Some(change.document.clone()));
        }
    }

    fn handle_document_delete(&mut self, provider: &dyn TargetMetadataProvider, delete: DocumentDelete) {
        let deleted = Document::no_document(delete.key.clone(), delete.read_time);
        for target_id in &delete.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, &delete.key, Some(deleted.clone()));
        }
    }

    fn handle_document_remove(&mut self, provider: &dyn TargetMetadataProvider, remove: DocumentRemove) {
        for target_id in &remove.removed_target_ids {
            self.remove_document_from_target(provider, *target_id, &remove.key, None);
        }
    }

    pub fn handle_target_change(&mut self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) {
        for target_id in self.affected_targets(provider, change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(provider, target_id) {
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        // Changes recorded before the backend acknowledged the
                        // request belong to the previous incarnation of the target.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.pending_responses -= 1;
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(provider, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(provider, target_id) {
                        self.reset_target(provider, target_id);
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the backend's document count for a target with the local
    /// count. A mismatch discards the target's local membership and schedules
    /// a fresh listen; single-document targets with a zero count are deleted.
    pub fn handle_existence_filter(&mut self, provider: &dyn TargetMetadataProvider, filter: ExistenceFilterChange) {
        let target_id = filter.target_id;
        let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
            return;
        };
        let target = &target_data.target;
        if target.is_document_target() {
            if filter.count == 0 {
                // The document was deleted while the client was not listening.
                if let Ok(key) = DocumentKey::from_path(target.path().clone()) {
                    let deleted = Document::no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(provider, target_id, &key, Some(deleted));
                }
            } else if filter.count != 1 {
                log::warn!(
                    "Single document existence filter for target {target_id} reported {} documents",
                    filter.count
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(provider, target_id);
        if current_count != filter.count {
            log::debug!(
                "Existence filter mismatch for target {target_id}: expected {}, found {current_count}",
                filter.count
            );
            self.reset_target(provider, target_id);
            self.pending_target_resets
                .insert(target_id, TargetPurpose::ExistenceFilterMismatch);
        }
    }

    /// Drains everything accumulated so far into an event at `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(provider, target_id) else {
                continue;
            };
            let current = self.target_states.get(&target_id).is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A current single-document target without the document means it does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let updated_here = self
                        .pending_document_updates_by_target
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !updated_here && !target_contains_document(provider, target_id, &key) {
                        let deleted = Document::no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(provider, target_id, &key, Some(deleted));
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(provider, *target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        };
        self.pending_document_updates_by_target.clear();
        self.pending_document_target_mapping.clear();
        event
    }

    /// Records that a watch or unwatch request was sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).pending_responses += 1;
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn affected_targets(&self, provider: &dyn TargetMetadataProvider, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(provider, *target_id))
            .collect()
    }

    fn add_document_to_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId, document: Document) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let key = document.key().clone();
        let kind = if target_contains_document(provider, target_id, &key) {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id).add_document_change(key.clone(), kind);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_updates_by_target
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_target_mapping.entry(key).or_default().insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<Document>,
    ) {
        if !self.is_active_target(provider, target_id) {
            return;
        }
        let contained = target_contains_document(provider, target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // The target never reported the document; forget any add seen in this batch.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .remove(&target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
            self.pending_document_updates_by_target
                .entry(key.clone())
                .or_default()
                .insert(target_id);
        }
    }

    /// Forgets the target's accumulated state and marks every key it held as removed.
    fn reset_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::new());
        for key in provider.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(provider, target_id, &key, None);
        }
    }

    fn current_document_count_for_target(&mut self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        let remote = provider.get_remote_keys_for_target(target_id).len();
        (remote + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, provider: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        let active = self.target_data_for_active_target(provider, target_id).is_some();
        if !active {
            log::debug!("Detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(
        &self,
        provider: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        if self.target_states.get(&target_id).is_some_and(TargetState::is_pending) {
            return None;
        }
        provider.get_target_data_for_target(target_id)
    }
}

fn target_contains_document(provider: &dyn TargetMetadataProvider, target_id: TargetId, key: &DocumentKey) -> bool {
    provider.get_remote_keys_for_target(target_id).contains(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Query, Target};
    use crate::model::{ResourcePath, Timestamp};
    use crate::value::MapValue;
    use std::collections::HashMap;

    #[derive(Default)]
    struct TestMetadata {
        targets: HashMap<TargetId, TargetData>,
        remote_keys: HashMap<TargetId, DocumentKeySet>,
    }

    impl TestMetadata {
        fn with_query_target(mut self, target_id: TargetId) -> Self {
            let target = Query::at_path(ResourcePath::from_string("rooms").unwrap()).to_target();
            self.targets
                .insert(target_id, TargetData::new(target, target_id, TargetPurpose::Listen, 1));
            self
        }

        fn with_target(mut self, target_id: TargetId, target: Target, purpose: TargetPurpose) -> Self {
            self.targets.insert(target_id, TargetData::new(target, target_id, purpose, 1));
            self
        }

        fn with_remote_keys(mut self, target_id: TargetId, keys: &[&str]) -> Self {
            self.remote_keys.insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str) -> Document {
        Document::found(key(path), version(1), MapValue::empty())
    }

    fn doc_change(path: &str, targets: Vec<TargetId>) -> WatchChange {
        WatchChange::DocumentChange(DocumentChange {
            updated_target_ids: targets,
            removed_target_ids: Vec::new(),
            document: doc(path),
        })
    }

    fn target_change(state: TargetChangeState, targets: Vec<TargetId>, token: &[u8]) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange::new(state, targets).with_resume_token(token.to_vec()))
    }

    #[test]
    fn aggregates_document_changes() {
        let metadata = TestMetadata::default().with_query_target(2).with_remote_keys(2, &["rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(&metadata, doc_change("rooms/a", vec![2]));
        aggregator.handle_watch_change(&metadata, doc_change("rooms/b", vec![2]));
        aggregator.handle_watch_change(&metadata, target_change(TargetChangeState::Current, vec![2], b"t1"));

        let event = aggregator.create_remote_event(&metadata, version(3));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, b"t1".to_vec());
        assert!(change.added_documents.contains(&key("rooms/a")));
        assert!(change.modified_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates.len(), 2);
        assert!(event.resolved_limbo_documents.is_empty());

        let empty = aggregator.create_remote_event(&metadata, version(4));
        assert!(empty.target_changes.is_empty());
        assert!(empty.document_updates.is_empty());
    }

    #[test]
    fn drops_changes_for_targets_awaiting_acknowledgement() {
        let metadata = TestMetadata::default().with_query_target(2);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator.handle_watch_change(&metadata, doc_change("rooms/a", vec![2]));
        assert!(aggregator
            .create_remote_event(&metadata, version(1))
            .document_updates
            .is_empty());

        aggregator.handle_watch_change(&metadata, target_change(TargetChangeState::Added, vec![2], b""));
        aggregator.handle_watch_change(&metadata, doc_change("rooms/a", vec![2]));
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.target_changes[&2].added_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn existence_filter_mismatch_resets_the_target() {
        let metadata = TestMetadata::default()
            .with_query_target(2)
            .with_remote_keys(2, &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(
            &metadata,
            WatchChange::ExistenceFilter(ExistenceFilterChange { target_id: 2, count: 1 }),
        );

        let event = aggregator.create_remote_event(&metadata, version(2));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );
        let change = &event.target_changes[&2];
        assert!(!change.current);
        assert_eq!(change.removed_documents.len(), 2);
    }

    #[test]
    fn matching_existence_filter_changes_nothing() {
        let metadata = TestMetadata::default().with_query_target(2).with_remote_keys(2, &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(&metadata, doc_change("rooms/b", vec![2]));
        aggregator.handle_watch_change(
            &metadata,
            WatchChange::ExistenceFilter(ExistenceFilterChange { target_id: 2, count: 2 }),
        );
        let event = aggregator.create_remote_event(&metadata, version(2));
        assert!(event.target_mismatches.is_empty());
    }

    #[test]
    fn synthesizes_deletes_for_single_document_targets() {
        let target = Target::for_document(&key("rooms/a"));
        let metadata = TestMetadata::default()
            .with_target(1, target.clone(), TargetPurpose::LimboResolution)
            .with_target(3, Target::for_document(&key("rooms/z")), TargetPurpose::Listen);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_watch_change(&metadata, target_change(TargetChangeState::Current, vec![1], b"t"));
        aggregator.handle_watch_change(
            &metadata,
            WatchChange::ExistenceFilter(ExistenceFilterChange { target_id: 3, count: 0 }),
        );

        let event = aggregator.create_remote_event(&metadata, version(5));
        let missing = &event.document_updates[&key("rooms/a")];
        assert!(missing.is_no_document());
        assert_eq!(missing.version(), version(5));
        assert!(event.document_updates[&key("rooms/z")].is_no_document());
        assert!(event.resolved_limbo_documents.contains(&key("rooms/a")));
    }
}
