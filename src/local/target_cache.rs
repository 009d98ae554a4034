//! Persisted targets, the documents the server said match each of them, and
//! global target metadata.

use std::collections::BTreeSet;

use crate::core::Target;
use crate::error::FirestoreResult;
use crate::local::kv_store::{KeyPart, KeyRange};
use crate::local::local_serializer::{
    document_key_from_part, document_target_key, global_key, int_from_part, path_part, target_document_key,
    target_key, DbTargetDocument, DbTargetGlobal, DOCUMENT_TARGETS, GLOBALS, SENTINEL_TARGET_ID,
    TARGETS, TARGET_CANONICAL_IDS, TARGET_DOCUMENTS, TARGET_GLOBAL_KEY,
};
use crate::local::lru_garbage_collector::write_sentinel_key;
use crate::local::persistence::PersistenceTransaction;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Query target ids are even; odd ids are reserved for limbo resolution.
const TARGET_ID_STEP: TargetId = 2;

#[derive(Clone, Copy, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub fn new() -> Self {
        Self
    }

    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction) -> FirestoreResult<TargetId> {
        let mut global = self.global(txn)?;
        global.highest_target_id += TARGET_ID_STEP;
        let target_id = global.highest_target_id;
        self.save_global(txn, &global)?;
        Ok(target_id)
    }

    pub fn add_target_data(&self, txn: &mut PersistenceTransaction, data: &TargetData) -> FirestoreResult<()> {
        self.write_target_row(txn, data)?;
        let mut global = self.global(txn)?;
        global.target_count += 1;
        update_global_from(&mut global, data);
        self.save_global(txn, &global)
    }

    /// Overwrites an existing target, e.g. with a new resume token or sequence number.
    pub fn save_target_data(&self, txn: &mut PersistenceTransaction, data: &TargetData) -> FirestoreResult<()> {
        self.write_target_row(txn, data)?;
        let mut global = self.global(txn)?;
        if update_global_from(&mut global, data) {
            self.save_global(txn, &global)?;
        }
        Ok(())
    }

    pub fn remove_target_data(&self, txn: &mut PersistenceTransaction, data: &TargetData) -> FirestoreResult<()> {
        self.remove_matching_keys_for_target(txn, data.target_id)?;
        txn.delete(TARGETS, &target_key(data.target_id))?;
        txn.delete(TARGET_CANONICAL_IDS, &canonical_key(&data.target, data.target_id))?;
        let mut global = self.global(txn)?;
        global.target_count = global.target_count.saturating_sub(1);
        self.save_global(txn, &global)
    }

    /// Persisted entry for a target equal to `target`, if any.
    pub fn get_target_data(&self, txn: &PersistenceTransaction, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let prefix = vec![KeyPart::from(target.canonical_id())];
        for (index_key, _) in txn.scan_raw(TARGET_CANONICAL_IDS, &KeyRange::prefix(prefix))? {
            let target_id = int_from_part(index_key.get(1))? as TargetId;
            if let Some(data) = self.get_target_data_by_id(txn, target_id)? {
                if &data.target == target {
                    return Ok(Some(data));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_by_id(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        txn.get(TARGETS, &target_key(target_id))
    }

    pub fn all_targets(&self, txn: &PersistenceTransaction) -> FirestoreResult<Vec<TargetData>> {
        Ok(txn
            .scan::<TargetData>(TARGETS, &KeyRange::all())?
            .into_iter()
            .map(|(_, data)| data)
            .collect())
    }

    pub fn add_matching_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.put(
                TARGET_DOCUMENTS,
                target_document_key(target_id, key),
                &DbTargetDocument::default(),
            )?;
            txn.put_raw(DOCUMENT_TARGETS, document_target_key(key, target_id), Vec::new())?;
            write_sentinel_key(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys(
        &self,
        txn: &mut PersistenceTransaction,
        keys: &DocumentKeySet,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in keys {
            txn.delete(TARGET_DOCUMENTS, &target_document_key(target_id, key))?;
            txn.delete(DOCUMENT_TARGETS, &document_target_key(key, target_id))?;
            write_sentinel_key(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys_for_target(
        &self,
        txn: &mut PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<()> {
        for key in self.matching_keys_for_target(txn, target_id)? {
            txn.delete(DOCUMENT_TARGETS, &document_target_key(&key, target_id))?;
        }
        txn.delete_range(TARGET_DOCUMENTS, &KeyRange::prefix(target_key(target_id)))
    }

    pub fn matching_keys_for_target(
        &self,
        txn: &PersistenceTransaction,
        target_id: TargetId,
    ) -> FirestoreResult<DocumentKeySet> {
        txn.scan_raw(TARGET_DOCUMENTS, &KeyRange::prefix(target_key(target_id)))?
            .into_iter()
            .map(|(row_key, _)| document_key_from_part(row_key.get(1)))
            .collect()
    }

    /// Targets (including the sentinel) that reference `key`.
    pub(crate) fn targets_for_document(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<BTreeSet<TargetId>> {
        txn.scan_raw(DOCUMENT_TARGETS, &KeyRange::prefix(vec![path_part(key.path())]))?
            .into_iter()
            .map(|(row_key, _)| Ok(int_from_part(row_key.get(1))? as TargetId))
            .collect()
    }

    /// Whether a real target (not the sentinel) references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(self
            .targets_for_document(txn, key)?
            .into_iter()
            .any(|target_id| target_id != SENTINEL_TARGET_ID))
    }

    /// Removes inactive targets whose sequence number is at most `upper_bound`.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for data in self.all_targets(txn)? {
            if data.sequence_number <= upper_bound && !active_target_ids.contains(&data.target_id) {
                self.remove_target_data(txn, &data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn last_remote_snapshot_version(&self, txn: &PersistenceTransaction) -> FirestoreResult<SnapshotVersion> {
        Ok(self.global(txn)?.last_remote_snapshot_version)
    }

    pub fn highest_sequence_number(&self, txn: &PersistenceTransaction) -> FirestoreResult<ListenSequenceNumber> {
        Ok(self.global(txn)?.highest_listen_sequence_number)
    }

    pub fn target_count(&self, txn: &PersistenceTransaction) -> FirestoreResult<u64> {
        Ok(self.global(txn)?.target_count)
    }

    pub fn set_target_metadata(
        &self,
        txn: &mut PersistenceTransaction,
        highest_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: Option<SnapshotVersion>,
    ) -> FirestoreResult<()> {
        let mut global = self.global(txn)?;
        global.highest_listen_sequence_number = global.highest_listen_sequence_number.max(highest_sequence_number);
        if let Some(version) = last_remote_snapshot_version {
            global.last_remote_snapshot_version = version;
        }
        self.save_global(txn, &global)
    }

    fn write_target_row(&self, txn: &mut PersistenceTransaction, data: &TargetData) -> FirestoreResult<()> {
        txn.put(TARGETS, target_key(data.target_id), data)?;
        txn.put_raw(
            TARGET_CANONICAL_IDS,
            canonical_key(&data.target, data.target_id),
            Vec::new(),
        )
    }

    fn global(&self, txn: &PersistenceTransaction) -> FirestoreResult<DbTargetGlobal> {
        Ok(txn.get(GLOBALS, &global_key(TARGET_GLOBAL_KEY))?.unwrap_or_default())
    }

    fn save_global(&self, txn: &mut PersistenceTransaction, global: &DbTargetGlobal) -> FirestoreResult<()> {
        txn.put(GLOBALS, global_key(TARGET_GLOBAL_KEY), global)
    }
}

fn canonical_key(target: &Target, target_id: TargetId) -> Vec<KeyPart> {
    vec![KeyPart::from(target.canonical_id()), KeyPart::from(target_id)]
}

fn update_global_from(global: &mut DbTargetGlobal, data: &TargetData) -> bool {
    let mut updated = false;
    if data.target_id > global.highest_target_id {
        global.highest_target_id = data.target_id;
        updated = true;
    }
    if data.sequence_number > global.highest_listen_sequence_number {
        global.highest_listen_sequence_number = data.sequence_number;
        updated = true;
    }
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::kv_store::MemoryKvStore;
    use crate::local::persistence::{Persistence, TransactionMode};
    use crate::local::target_data::TargetPurpose;
    use crate::model::ResourcePath;
    use crate::settings::SyncSettings;
    use std::sync::Arc;

    fn persistence() -> Arc<Persistence> {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", &SyncSettings::default());
        persistence.start().unwrap();
        persistence
    }

    fn target(path: &str) -> Target {
        Query::at_path(ResourcePath::from_string(path).unwrap()).to_target()
    }

    fn keys(paths: &[&str]) -> DocumentKeySet {
        paths.iter().map(|p| DocumentKey::from_string(p).unwrap()).collect()
    }

    #[test]
    fn allocates_even_ids_and_finds_targets_by_query() {
        let persistence = persistence();
        let cache = TargetCache::new();
        let (first, second, found, missing, count) = persistence
            .run_transaction("targets", TransactionMode::ReadWrite, |txn| {
                let first = cache.allocate_target_id(txn)?;
                let second = cache.allocate_target_id(txn)?;
                let data = TargetData::new(target("rooms"), first, TargetPurpose::Listen, txn.current_sequence_number());
                cache.add_target_data(txn, &data)?;
                Ok((
                    first,
                    second,
                    cache.get_target_data(txn, &target("rooms"))?,
                    cache.get_target_data(txn, &target("users"))?,
                    cache.target_count(txn)?,
                ))
            })
            .unwrap();
        assert_eq!((first, second), (2, 4));
        assert_eq!(found.map(|d| d.target_id), Some(2));
        assert!(missing.is_none());
        assert_eq!(count, 1);
    }

    #[test]
    fn matching_keys_leave_sentinel_rows() {
        let persistence = persistence();
        let cache = TargetCache::new();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let (matching, contains_before, contains_after, refs) = persistence
            .run_transaction("keys", TransactionMode::ReadWrite, |txn| {
                cache.add_matching_keys(txn, &keys(&["rooms/a", "rooms/b"]), 2)?;
                let matching = cache.matching_keys_for_target(txn, 2)?;
                let before = cache.contains_key(txn, &key)?;
                cache.remove_matching_keys(txn, &keys(&["rooms/a"]), 2)?;
                let after = cache.contains_key(txn, &key)?;
                Ok((matching, before, after, cache.targets_for_document(txn, &key)?))
            })
            .unwrap();
        assert_eq!(matching, keys(&["rooms/a", "rooms/b"]));
        assert!(contains_before);
        assert!(!contains_after);
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec![SENTINEL_TARGET_ID]);
    }

    #[test]
    fn removes_only_inactive_old_targets() {
        let persistence = persistence();
        let cache = TargetCache::new();
        let removed = persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                cache.add_target_data(txn, &TargetData::new(target("a"), 2, TargetPurpose::Listen, 1))?;
                cache.add_target_data(txn, &TargetData::new(target("b"), 4, TargetPurpose::Listen, 1))?;
                cache.add_target_data(txn, &TargetData::new(target("c"), 6, TargetPurpose::Listen, 10))?;
                cache.add_matching_keys(txn, &keys(&["a/1"]), 2)?;
                let active = BTreeSet::from([4]);
                let removed = cache.remove_targets(txn, 5, &active)?;
                Ok((removed, cache.target_count(txn)?, cache.matching_keys_for_target(txn, 2)?))
            })
            .unwrap();
        assert_eq!(removed.0, 1);
        assert_eq!(removed.1, 2);
        assert!(removed.2.is_empty());
    }
}
