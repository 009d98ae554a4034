use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::model::{DocumentKeySet, TargetId};

/// Keys a view started or stopped showing, reported back to the local store
/// so it can pin documents that are visible but not yet synced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = DocumentKeySet::new();
        let mut removed_keys = DocumentKeySet::new();
        for change in &snapshot.document_changes {
            match change.change_type {
                ChangeType::Added => {
                    added_keys.insert(change.document.key().clone());
                }
                ChangeType::Removed => {
                    removed_keys.insert(change.document.key().clone());
                }
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}
