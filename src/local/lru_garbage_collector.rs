//! Least-recently-used eviction of cached targets and documents.
//!
//! Every target carries the sequence number of the last transaction that used
//! it. Documents carry theirs on a sentinel row (target id 0), refreshed
//! whenever a target, a view or a mutation stops referencing them. A run
//! removes the oldest percentile of sequence numbers: first inactive targets,
//! then documents no longer referenced by anything.

use std::collections::{BTreeSet, BinaryHeap};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use crate::error::{invalid_argument, FirestoreResult};
use crate::local::kv_store::KeyRange;
use crate::local::local_serializer::{
    document_key_from_part, document_target_key, target_document_key, DbTargetDocument, DOCUMENT_TARGETS,
    SENTINEL_TARGET_ID, TARGET_DOCUMENTS,
};
use crate::local::local_store::LocalStore;
use crate::local::mutation_queue::mutation_queues_contain_key;
use crate::local::persistence::{ignore_if_primary_lease_loss, PersistenceTransaction};
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;
use crate::model::{DocumentKey, ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Cache size in bytes above which a collection runs; [`LruParams::DISABLED`] turns GC off.
    pub cache_size_collection_threshold: i64,
    /// Share of sequence numbers removed per run.
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub const DISABLED: i64 = -1;
    pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
    pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
    pub const DEFAULT_PERCENTILE_TO_COLLECT: u32 = 10;
    pub const DEFAULT_MAXIMUM_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;

    pub fn with_cache_size(cache_size: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(Self::DISABLED)
    }

    pub fn is_enabled(&self) -> bool {
        self.cache_size_collection_threshold != Self::DISABLED
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.is_enabled() && self.cache_size_collection_threshold < Self::MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache size must be at least {} bytes or disabled",
                Self::MINIMUM_CACHE_SIZE_BYTES
            )));
        }
        if self.percentile_to_collect > 100 {
            return Err(invalid_argument("percentile_to_collect must not exceed 100"));
        }
        Ok(())
    }
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: Self::DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: Self::DEFAULT_PERCENTILE_TO_COLLECT,
            maximum_sequence_numbers_to_collect: Self::DEFAULT_MAXIMUM_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

/// Marks `key` as touched by the current transaction.
pub(crate) fn write_sentinel_key(txn: &mut PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<()> {
    let row = DbTargetDocument {
        sequence_number: Some(txn.current_sequence_number()),
    };
    txn.put(TARGET_DOCUMENTS, target_document_key(SENTINEL_TARGET_ID, key), &row)?;
    txn.put_raw(DOCUMENT_TARGETS, document_target_key(key, SENTINEL_TARGET_ID), Vec::new())
}

fn remove_sentinel_key(txn: &mut PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<()> {
    txn.delete(TARGET_DOCUMENTS, &target_document_key(SENTINEL_TARGET_ID, key))?;
    txn.delete(DOCUMENT_TARGETS, &document_target_key(key, SENTINEL_TARGET_ID))
}

#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
    target_cache: TargetCache,
    remote_documents: RemoteDocumentCache,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self {
            params,
            target_cache: TargetCache::new(),
            remote_documents: RemoteDocumentCache::new(),
        }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs one collection unless GC is disabled or the cache is below the threshold.
    ///
    /// Documents referenced by `local_view_references` or by any pending mutation are kept.
    pub fn collect(
        &self,
        txn: &mut PersistenceTransaction,
        active_target_ids: &BTreeSet<TargetId>,
        local_view_references: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        if !self.params.is_enabled() {
            log::debug!("Garbage collection skipped; disabled");
            return Ok(LruResults::default());
        }
        let cache_size = self.remote_documents.byte_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::default());
        }
        self.run_collection(txn, active_target_ids, local_view_references)
    }

    fn run_collection(
        &self,
        txn: &mut PersistenceTransaction,
        active_target_ids: &BTreeSet<TargetId>,
        local_view_references: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        let to_collect = self.sequence_numbers_to_collect(txn)?;
        let upper_bound = self.nth_sequence_number(txn, to_collect)?;
        let targets_removed = self.target_cache.remove_targets(txn, upper_bound, active_target_ids)?;
        let documents_removed = self.remove_orphaned_documents(txn, upper_bound, local_view_references)?;
        log::debug!(
            "LRU garbage collection: counted {to_collect} sequence numbers up to {upper_bound}, \
             removed {targets_removed} targets and {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }

    fn sequence_numbers_to_collect(&self, txn: &PersistenceTransaction) -> FirestoreResult<usize> {
        let count = self.target_cache.target_count(txn)? as usize + self.orphaned_documents(txn)?.len();
        let to_collect = count * self.params.percentile_to_collect as usize / 100;
        if to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "Capping garbage collection from {to_collect} to {} sequence numbers",
                self.params.maximum_sequence_numbers_to_collect
            );
            return Ok(self.params.maximum_sequence_numbers_to_collect);
        }
        Ok(to_collect)
    }

    /// The `n`th smallest sequence number among targets and orphaned documents.
    pub(crate) fn nth_sequence_number(
        &self,
        txn: &PersistenceTransaction,
        n: usize,
    ) -> FirestoreResult<ListenSequenceNumber> {
        if n == 0 {
            return Ok(INVALID_SEQUENCE_NUMBER);
        }
        // Max-heap holding the `n` smallest values seen so far.
        let mut buffer: BinaryHeap<ListenSequenceNumber> = BinaryHeap::with_capacity(n + 1);
        let targets = self.target_cache.all_targets(txn)?.into_iter().map(|data| data.sequence_number);
        let documents = self.orphaned_documents(txn)?.into_iter().map(|(_, seq)| seq);
        for sequence_number in targets.chain(documents) {
            if buffer.len() < n {
                buffer.push(sequence_number);
            } else if buffer.peek().is_some_and(|max| sequence_number < *max) {
                buffer.pop();
                buffer.push(sequence_number);
            }
        }
        Ok(buffer.peek().copied().unwrap_or(INVALID_SEQUENCE_NUMBER))
    }

    /// Documents whose only reference row is the sentinel, with its sequence number.
    fn orphaned_documents(
        &self,
        txn: &PersistenceTransaction,
    ) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
        let sentinels = txn.scan::<DbTargetDocument>(
            TARGET_DOCUMENTS,
            &KeyRange::prefix(vec![SENTINEL_TARGET_ID.into()]),
        )?;
        let mut orphaned = Vec::new();
        for (row_key, row) in sentinels {
            let key = document_key_from_part(row_key.get(1))?;
            if self.target_cache.contains_key(txn, &key)? {
                continue;
            }
            orphaned.push((key, row.sequence_number.unwrap_or(INVALID_SEQUENCE_NUMBER)));
        }
        Ok(orphaned)
    }

    fn remove_orphaned_documents(
        &self,
        txn: &mut PersistenceTransaction,
        upper_bound: ListenSequenceNumber,
        local_view_references: &ReferenceSet,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for (key, sequence_number) in self.orphaned_documents(txn)? {
            if sequence_number > upper_bound
                || local_view_references.contains_key(&key)
                || mutation_queues_contain_key(txn, &key)?
            {
                continue;
            }
            self.remote_documents.remove(txn, &key)?;
            remove_sentinel_key(txn, &key)?;
            removed += 1;
        }
        Ok(removed)
    }
}

/// Runs garbage collection on the worker queue while this client is primary.
pub struct LruScheduler {
    queue: AsyncQueue,
    local_store: LocalStore,
    initial_delay: Duration,
    regular_delay: Duration,
    task: StdMutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    pub fn new(queue: AsyncQueue, local_store: LocalStore, initial_delay: Duration, regular_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            queue,
            local_store,
            initial_delay,
            regular_delay,
            task: StdMutex::new(None),
        })
    }

    pub fn is_started(&self) -> bool {
        self.lock().is_some()
    }

    pub fn start(self: &Arc<Self>) {
        if !self.local_store.lru_params().is_enabled() {
            log::debug!("Garbage collection is disabled; not scheduling");
            return;
        }
        if self.is_started() {
            return;
        }
        self.schedule(self.initial_delay);
    }

    pub fn stop(&self) {
        if let Some(task) = self.lock().take() {
            task.cancel();
        }
    }

    fn schedule(self: &Arc<Self>, delay: Duration) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
                let Some(scheduler) = weak.upgrade() else {
                    return;
                };
                let result = scheduler.local_store.collect_garbage().map(|results| {
                    if results.did_run {
                        log::debug!("Garbage collection finished: {results:?}");
                    }
                });
                if let Err(err) = ignore_if_primary_lease_loss(result) {
                    log::warn!("Garbage collection failed: {err}");
                }
                if scheduler.is_started() {
                    scheduler.schedule(scheduler.regular_delay);
                }
            });
        *self.lock() = Some(task);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<DelayedOperation>> {
        self.task.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::kv_store::MemoryKvStore;
    use crate::local::mutation_queue::MutationQueue;
    use crate::local::persistence::{Persistence, TransactionMode};
    use crate::local::target_data::{TargetData, TargetPurpose};
    use crate::model::{Document, DocumentKeySet, Mutation, ResourcePath, SnapshotVersion, Timestamp, User};
    use crate::settings::SyncSettings;
    use crate::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn persistence() -> Arc<Persistence> {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", &SyncSettings::default());
        persistence.start().unwrap();
        persistence
    }

    fn params() -> LruParams {
        LruParams {
            cache_size_collection_threshold: LruParams::MINIMUM_CACHE_SIZE_BYTES,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1_000,
        }
    }

    fn cache_document(txn: &mut PersistenceTransaction, path: &str) -> FirestoreResult<()> {
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        let doc = Document::found(key(path), version, MapValue::empty());
        RemoteDocumentCache::new().set(txn, &doc, version)
    }

    /// Large document so the cache exceeds the collection threshold.
    fn cache_filler(txn: &mut PersistenceTransaction) -> FirestoreResult<()> {
        let mut big = MapValue::empty();
        big.set(
            &crate::model::FieldPath::from_dot_separated("blob").unwrap(),
            crate::value::FirestoreValue::from_string("x".repeat(LruParams::MINIMUM_CACHE_SIZE_BYTES as usize)),
        );
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        RemoteDocumentCache::new().set(txn, &Document::found(key("filler/big"), version, big), version)
    }

    #[test]
    fn params_validate_cache_size() {
        assert!(LruParams::default().validate().is_ok());
        assert!(LruParams::disabled().validate().is_ok());
        assert!(LruParams::with_cache_size(1024).validate().is_err());
    }

    #[test]
    fn nth_sequence_number_picks_the_smallest_values() {
        let persistence = persistence();
        let collector = LruGarbageCollector::new(params());
        let cache = TargetCache::new();
        let (second, none) = persistence
            .run_transaction("seq", TransactionMode::ReadWrite, |txn| {
                for (id, seq) in [(2, 30), (4, 10), (6, 20)] {
                    let target = Query::at_path(ResourcePath::from_string(&format!("c{id}"))?).to_target();
                    cache.add_target_data(txn, &TargetData::new(target, id, TargetPurpose::Listen, seq))?;
                }
                Ok((collector.nth_sequence_number(txn, 2)?, collector.nth_sequence_number(txn, 0)?))
            })
            .unwrap();
        assert_eq!(second, 20);
        assert_eq!(none, INVALID_SEQUENCE_NUMBER);
    }

    #[test]
    fn skips_when_cache_is_below_threshold() {
        let persistence = persistence();
        let collector = LruGarbageCollector::new(LruParams::default());
        let results = persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                cache_document(txn, "rooms/a")?;
                collector.collect(txn, &BTreeSet::new(), &ReferenceSet::new())
            })
            .unwrap();
        assert!(!results.did_run);
    }

    #[test]
    fn removes_orphaned_documents_but_keeps_pinned_ones() {
        let persistence = persistence();
        let collector = LruGarbageCollector::new(params());
        let targets = TargetCache::new();
        let documents = RemoteDocumentCache::new();

        persistence
            .run_transaction("setup", TransactionMode::ReadWrite, |txn| {
                for path in ["rooms/a", "rooms/b", "rooms/c"] {
                    cache_document(txn, path)?;
                }
                cache_filler(txn)?;

                let keys: DocumentKeySet = [key("rooms/a"), key("rooms/b"), key("rooms/c")].into_iter().collect();
                targets.add_matching_keys(txn, &keys, 2)?;
                targets.remove_matching_keys(txn, &keys, 2)?;
                let mut held: DocumentKeySet = DocumentKeySet::new();
                held.insert(key("rooms/c"));
                targets.add_matching_keys(txn, &held, 4)?;
                let target = Query::at_path(ResourcePath::from_string("rooms")?).to_target();
                targets.add_target_data(txn, &TargetData::new(target, 4, TargetPurpose::Listen, txn.current_sequence_number()))
            })
            .unwrap();

        let mut pinned = ReferenceSet::new();
        pinned.add_reference(key("rooms/b"), 1);
        let results = persistence
            .run_transaction("gc", TransactionMode::ReadWritePrimary, |txn| {
                collector.collect(txn, &BTreeSet::from([4]), &pinned)
            })
            .unwrap();
        assert!(results.did_run);
        assert_eq!(results.targets_removed, 0);

        let (a, b, c) = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    documents.get(txn, &key("rooms/a"))?,
                    documents.get(txn, &key("rooms/b"))?,
                    documents.get(txn, &key("rooms/c"))?,
                ))
            })
            .unwrap();
        assert!(a.is_none());
        assert!(b.is_some());
        assert!(c.is_some());
    }

    #[test]
    fn pending_mutation_keeps_a_released_document_until_acknowledged() {
        let persistence = persistence();
        let collector = LruGarbageCollector::new(params());
        let targets = TargetCache::new();
        let documents = RemoteDocumentCache::new();
        let queue = MutationQueue::new(&User::new("alice"));

        let batch = persistence
            .run_transaction("setup", TransactionMode::ReadWrite, |txn| {
                cache_document(txn, "rooms/a")?;
                cache_filler(txn)?;
                let keys: DocumentKeySet = [key("rooms/a")].into_iter().collect();
                targets.add_matching_keys(txn, &keys, 2)?;
                targets.remove_matching_keys(txn, &keys, 2)?;
                queue.add_batch(
                    txn,
                    Timestamp::new(2, 0),
                    vec![Mutation::set(key("rooms/a"), MapValue::empty())],
                )
            })
            .unwrap();

        let collect_and_read = || {
            persistence
                .run_transaction("gc", TransactionMode::ReadWritePrimary, |txn| {
                    let results = collector.collect(txn, &BTreeSet::new(), &ReferenceSet::new())?;
                    Ok((results, documents.get(txn, &key("rooms/a"))?))
                })
                .unwrap()
        };

        let (results, doc) = collect_and_read();
        assert!(results.did_run);
        assert!(doc.is_some());

        persistence
            .run_transaction("acknowledge", TransactionMode::ReadWrite, |txn| {
                queue.acknowledge_batch(txn, &batch, b"token".to_vec())?;
                queue.remove_batch(txn, &batch)
            })
            .unwrap();

        let (results, doc) = collect_and_read();
        assert!(results.did_run);
        assert_eq!(results.documents_removed, 1);
        assert!(doc.is_none());
    }
}
