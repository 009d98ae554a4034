use std::collections::BTreeMap;

use crate::local::TargetPurpose;
use crate::model::{Document, DocumentKey, DocumentKeySet, SnapshotVersion, TargetId};

/// Aggregated result of a consistent batch of watch changes, applied to the
/// local store in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose result set must be discarded and re-fetched, with the
    /// purpose they should be re-listened under.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    /// Updated documents that only limbo resolution targets referenced.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// Event that marks a target current without document changes, used when
    /// a rejected or released listen must still flush its view.
    pub fn synthesized_for_current_change(target_id: TargetId, current: bool, resume_token: Vec<u8>) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(target_id, TargetChange::for_current_change(current, resume_token));
        Self {
            snapshot_version: SnapshotVersion::min(),
            target_changes,
            ..Self::default()
        }
    }
}

/// Changes to one target carried by a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }
}
