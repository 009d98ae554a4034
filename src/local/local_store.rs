//! Local half of the client: owns the caches and the mutation queue and
//! exposes the operations the sync engine runs against them.
//!
//! Every public method is one storage transaction. In-memory bookkeeping
//! (active targets, view references) is updated only after the transaction
//! commits.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use crate::core::{Query, Target};
use crate::error::{is_retryable_storage_error, FirestoreResult};
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::local_view_changes::LocalViewChanges;
use crate::local::lru_garbage_collector::{write_sentinel_key, LruGarbageCollector, LruParams, LruResults};
use crate::local::mutation_queue::MutationQueue;
use crate::local::persistence::{Persistence, TransactionMode};
use crate::local::query_engine::QueryEngine;
use crate::local::reference_set::ReferenceSet;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::TargetCache;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, TargetId, Timestamp, User,
};
use crate::remote::{RemoteEvent, TargetChange};
use crate::settings::SyncSettings;

#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the server last reported as matching the query's target.
    pub remote_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserChangeResult {
    /// Local view of every document touched by either user's pending writes.
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

struct LocalStoreState {
    user: User,
    mutation_queue: MutationQueue,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
    local_view_references: ReferenceSet,
    /// Keys of batches seen by this instance, kept after the batch leaves the
    /// queue so another instance's acknowledgement can still be applied.
    mutation_keys_by_batch: HashMap<BatchId, DocumentKeySet>,
}

struct LocalStoreInner {
    persistence: Arc<Persistence>,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    garbage_collector: LruGarbageCollector,
    resume_token_max_age: Duration,
    state: StdMutex<LocalStoreState>,
}

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<LocalStoreInner>,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, user: User, settings: &SyncSettings) -> Self {
        let mutation_queue = MutationQueue::new(&user);
        let local_documents = LocalDocumentsView::new(mutation_queue.clone());
        let query_engine = QueryEngine::new(local_documents.clone());
        Self {
            inner: Arc::new(LocalStoreInner {
                persistence,
                remote_documents: RemoteDocumentCache::new(),
                target_cache: TargetCache::new(),
                garbage_collector: LruGarbageCollector::new(settings.lru.clone()),
                resume_token_max_age: settings.resume_token_max_age,
                state: StdMutex::new(LocalStoreState {
                    user,
                    mutation_queue,
                    local_documents,
                    query_engine,
                    target_data_by_target: BTreeMap::new(),
                    target_id_by_canonical_id: HashMap::new(),
                    local_view_references: ReferenceSet::new(),
                    mutation_keys_by_batch: HashMap::new(),
                }),
            }),
        }
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.inner.persistence
    }

    pub fn lru_params(&self) -> &LruParams {
        self.inner.garbage_collector.params()
    }

    pub fn current_user(&self) -> User {
        self.lock().user.clone()
    }

    /// Switches the mutation queue to `user` and reports which documents changed as a result.
    pub fn handle_user_change(&self, user: &User) -> FirestoreResult<UserChangeResult> {
        let old_queue = self.lock().mutation_queue.clone();
        let new_queue = MutationQueue::new(user);
        let new_documents = LocalDocumentsView::new(new_queue.clone());

        let result = self.inner.persistence.run_transaction(
            "Handle user change",
            TransactionMode::ReadOnly,
            |txn| {
                let old_batches = old_queue.all_batches(txn)?;
                let new_batches = new_queue.all_batches(txn)?;
                let mut changed_keys = DocumentKeySet::new();
                for batch in old_batches.iter().chain(&new_batches) {
                    changed_keys.extend(batch.keys());
                }
                Ok(UserChangeResult {
                    affected_documents: new_documents.get_documents(txn, &changed_keys)?,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            },
        )?;

        let mut state = self.lock();
        state.user = user.clone();
        state.query_engine = QueryEngine::new(new_documents.clone());
        state.local_documents = new_documents;
        state.mutation_queue = new_queue;
        Ok(result)
    }

    /// Enqueues `mutations` as one batch and returns the resulting local view.
    pub fn local_write(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let (queue, documents) = self.queue_and_documents();
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key().clone()).collect();
        let local_write_time = Timestamp::now();
        let result = self
            .inner
            .persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let batch = queue.add_batch(txn, local_write_time, mutations.clone())?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: documents.get_documents(txn, &keys)?,
                })
            })?;
        self.lock().mutation_keys_by_batch.insert(result.batch_id, keys);
        Ok(result)
    }

    /// Applies an acknowledged batch to the remote cache and drops it from the queue.
    ///
    /// Acknowledging a batch that is no longer queued changes nothing.
    pub fn acknowledge_batch(&self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let (queue, documents) = self.queue_and_documents();
        let remote_documents = self.inner.remote_documents;
        self.inner
            .persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &batch_result.batch;
                let keys = batch.keys();
                if queue.lookup_batch(txn, batch.batch_id)?.is_none() {
                    log::debug!("Ignoring acknowledgement of unknown batch {}", batch.batch_id);
                    return documents.get_documents(txn, &keys);
                }
                queue.acknowledge_batch(txn, batch, batch_result.stream_token.clone())?;
                for key in &keys {
                    let Some(ack_version) = batch_result.doc_versions.get(key) else {
                        continue;
                    };
                    let existing = remote_documents.get(txn, key)?;
                    let existing_version = existing
                        .as_ref()
                        .map(Document::version)
                        .unwrap_or_else(SnapshotVersion::min);
                    if existing_version < *ack_version {
                        if let Some(updated) = batch.apply_to_remote_document(key, existing, batch_result)? {
                            remote_documents.set(txn, &updated, batch_result.commit_version)?;
                        }
                    }
                }
                queue.remove_batch(txn, batch)?;
                documents.get_documents(txn, &keys)
            })
    }

    /// Drops a rejected batch. Rejecting a batch that is no longer queued changes nothing.
    pub fn reject_batch(&self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        let (queue, documents) = self.queue_and_documents();
        self.inner
            .persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let Some(batch) = queue.lookup_batch(txn, batch_id)? else {
                    log::debug!("Ignoring rejection of unknown batch {batch_id}");
                    return Ok(DocumentMap::new());
                };
                queue.remove_batch(txn, &batch)?;
                documents.get_documents(txn, &batch.keys())
            })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let queue = self.lock().mutation_queue.clone();
        self.inner.persistence.run_transaction(
            "Get highest unacknowledged batch id",
            TransactionMode::ReadOnly,
            |txn| queue.highest_unacknowledged_batch_id(txn),
        )
    }

    /// Next queued batch after `after_batch_id`, for the write pipeline.
    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let queue = self.lock().mutation_queue.clone();
        self.inner
            .persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.next_batch_after(txn, after_batch_id)
            })
    }

    /// Local view of the documents a batch touches, or `None` for a batch this
    /// instance never saw that is no longer queued.
    pub fn lookup_mutation_documents(&self, batch_id: BatchId) -> FirestoreResult<Option<DocumentMap>> {
        let (queue, documents) = self.queue_and_documents();
        let cached_keys = self.lock().mutation_keys_by_batch.get(&batch_id).cloned();
        let result = self
            .inner
            .persistence
            .run_transaction("Lookup mutation documents", TransactionMode::ReadOnly, |txn| {
                let keys = match &cached_keys {
                    Some(keys) => keys.clone(),
                    None => match queue.lookup_batch(txn, batch_id)? {
                        Some(batch) => batch.keys(),
                        None => return Ok(None),
                    },
                };
                Ok(Some((documents.get_documents(txn, &keys)?, keys)))
            })?;
        Ok(result.map(|(changes, keys)| {
            self.lock().mutation_keys_by_batch.insert(batch_id, keys);
            changes
        }))
    }

    /// Forgets the cached keys of a batch once its outcome was applied.
    pub fn remove_cached_mutation_batch_metadata(&self, batch_id: BatchId) {
        self.lock().mutation_keys_by_batch.remove(&batch_id);
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        let queue = self.lock().mutation_queue.clone();
        self.inner
            .persistence
            .run_transaction("Get last stream token", TransactionMode::ReadOnly, |txn| {
                queue.last_stream_token(txn)
            })
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) -> FirestoreResult<()> {
        let queue = self.lock().mutation_queue.clone();
        self.inner
            .persistence
            .run_transaction("Set last stream token", TransactionMode::ReadWritePrimary, |txn| {
                queue.set_last_stream_token(txn, token.clone())
            })
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let target_cache = self.inner.target_cache;
        self.inner.persistence.run_transaction(
            "Get last remote snapshot version",
            TransactionMode::ReadOnly,
            |txn| target_cache.last_remote_snapshot_version(txn),
        )
    }

    /// Persists a watch event and returns the local view of every changed document.
    pub fn apply_remote_event(&self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let (active_targets, documents) = {
            let state = self.lock();
            (state.target_data_by_target.clone(), state.local_documents.clone())
        };
        let target_cache = self.inner.target_cache;
        let remote_documents = self.inner.remote_documents;
        let remote_version = event.snapshot_version;

        let (changed, updated_targets) = self.inner.persistence.run_transaction(
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let mut updated_targets = BTreeMap::new();
                for (target_id, change) in &event.target_changes {
                    // Only active targets are updated; released ones are ignored.
                    let Some(old_data) = active_targets.get(target_id) else {
                        continue;
                    };
                    target_cache.remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    target_cache.add_matching_keys(txn, &change.added_documents, *target_id)?;

                    let mut new_data = old_data.clone().with_sequence_number(txn.current_sequence_number());
                    if event.target_mismatches.contains_key(target_id) {
                        new_data = new_data
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        new_data = new_data.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if self.should_persist_target_data(old_data, &new_data, change) {
                        target_cache.save_target_data(txn, &new_data)?;
                    }
                    updated_targets.insert(*target_id, new_data);
                }

                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        write_sentinel_key(txn, key)?;
                    }
                }

                let mut changed = DocumentMap::new();
                for (key, document) in &event.document_updates {
                    let existing = remote_documents.get(txn, key)?;
                    if document.is_no_document() && document.version().is_min() {
                        // Synthesized deletes mean access was lost; forget the entry.
                        remote_documents.remove(txn, key)?;
                        changed.insert(key.clone(), document.clone());
                        continue;
                    }
                    let newer = match &existing {
                        None => true,
                        Some(existing) => {
                            document.version() > existing.version()
                                || (document.version() == existing.version() && existing.has_pending_writes())
                        }
                    };
                    if newer {
                        remote_documents.set(txn, document, remote_version)?;
                        changed.insert(key.clone(), document.clone());
                    } else {
                        log::debug!(
                            "Ignoring outdated watch update for {key}. Current version: {}, watch version: {}",
                            existing.map(|doc| doc.version()).unwrap_or_default(),
                            document.version()
                        );
                    }
                }

                if !remote_version.is_min() {
                    target_cache.set_target_metadata(txn, txn.current_sequence_number(), Some(remote_version))?;
                }

                let keys: DocumentKeySet = changed.keys().cloned().collect();
                let local_view = documents.get_local_view_of_documents(txn, &changed, &keys)?;
                Ok((local_view, updated_targets))
            },
        )?;

        let mut state = self.lock();
        for (target_id, data) in updated_targets {
            if state.target_data_by_target.contains_key(&target_id) {
                state.target_data_by_target.insert(target_id, data);
            }
        }
        Ok(changed)
    }

    fn should_persist_target_data(&self, old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
        if new.resume_token.is_empty() {
            return false;
        }
        if old.resume_token.is_empty() {
            return true;
        }
        let max_age = self.inner.resume_token_max_age.as_micros() as i64;
        if micros(new.snapshot_version) - micros(old.snapshot_version) >= max_age {
            return true;
        }
        let changes =
            change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len();
        changes > 0
    }

    /// Records which documents each view shows so GC keeps them, and marks
    /// targets whose views are synced as limbo-free at their snapshot version.
    pub fn notify_local_view_changes(&self, changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let result = self
            .inner
            .persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                for change in changes {
                    for key in change.added_keys.iter().chain(&change.removed_keys) {
                        write_sentinel_key(txn, key)?;
                    }
                }
                Ok(())
            });
        match result {
            Err(err) if is_retryable_storage_error(&err) => {
                log::debug!("Failed to update sequence numbers: {err}");
            }
            other => other?,
        }

        let mut state = self.lock();
        for change in changes {
            state
                .local_view_references
                .add_references(&change.added_keys, change.target_id);
            state
                .local_view_references
                .remove_references(&change.removed_keys, change.target_id);
            if !change.from_cache {
                if let Some(data) = state.target_data_by_target.get_mut(&change.target_id) {
                    data.last_limbo_free_snapshot_version = data.snapshot_version;
                }
            }
        }
        Ok(())
    }

    /// Returns the cached target for `target`, creating and persisting it when new.
    pub fn allocate_target(&self, target: Target) -> FirestoreResult<TargetData> {
        let target_cache = self.inner.target_cache;
        let data = self
            .inner
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = target_cache.allocate_target_id(txn)?;
                let data = TargetData::new(target.clone(), target_id, TargetPurpose::Listen, txn.current_sequence_number());
                target_cache.add_target_data(txn, &data)?;
                Ok(data)
            })?;

        let mut state = self.lock();
        let newer = state
            .target_data_by_target
            .get(&data.target_id)
            .map_or(true, |cached| data.snapshot_version > cached.snapshot_version);
        if newer {
            state.target_data_by_target.insert(data.target_id, data.clone());
            state
                .target_id_by_canonical_id
                .insert(data.target.canonical_id(), data.target_id);
        }
        Ok(data)
    }

    /// Active target data for `target`, if it is currently allocated.
    pub fn get_local_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = self.lock();
        state
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| state.target_data_by_target.get(target_id))
            .cloned()
    }

    /// Active target data by id, falling back to the persisted entry.
    pub fn get_cached_target(&self, target_id: TargetId) -> FirestoreResult<Option<TargetData>> {
        if let Some(data) = self.lock().target_data_by_target.get(&target_id) {
            return Ok(Some(data.clone()));
        }
        let target_cache = self.inner.target_cache;
        self.inner
            .persistence
            .run_transaction("Get cached target", TransactionMode::ReadOnly, |txn| {
                target_cache.get_target_data_by_id(txn, target_id)
            })
    }

    /// Stops tracking `target_id`. Its persisted data stays behind for LRU collection.
    pub fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let (data, released_keys) = {
            let mut state = self.lock();
            let Some(data) = state.target_data_by_target.get(&target_id).cloned() else {
                log::debug!("Ignoring release of inactive target {target_id}");
                return Ok(());
            };
            let released_keys = state.local_view_references.remove_references_for_id(target_id);
            (data, released_keys)
        };

        if !keep_persisted_target_data {
            let target_cache = self.inner.target_cache;
            let result = self
                .inner
                .persistence
                .run_transaction("Release target", TransactionMode::ReadWritePrimary, |txn| {
                    for key in &released_keys {
                        write_sentinel_key(txn, key)?;
                    }
                    let updated = data.clone().with_sequence_number(txn.current_sequence_number());
                    target_cache.save_target_data(txn, &updated)
                });
            match result {
                Err(err) if is_retryable_storage_error(&err) => {
                    log::debug!("Failed to update sequence numbers for target {target_id}: {err}");
                }
                other => other?,
            }
        }

        let mut state = self.lock();
        state.target_data_by_target.remove(&target_id);
        state.target_id_by_canonical_id.remove(&data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the local cache.
    ///
    /// With `use_previous_results` the query engine may reuse the target's
    /// last limbo-free result set instead of scanning the collection.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target = query.to_target();
        let local_target = self.get_local_target_data(&target);
        let query_engine = self.lock().query_engine.clone();
        let target_cache = self.inner.target_cache;
        self.inner
            .persistence
            .run_transaction("Execute query", TransactionMode::ReadOnly, |txn| {
                let data = match &local_target {
                    Some(data) => Some(data.clone()),
                    None => target_cache.get_target_data(txn, &target)?,
                };
                let (last_limbo_free, remote_keys) = match &data {
                    Some(data) => (
                        data.last_limbo_free_snapshot_version,
                        target_cache.matching_keys_for_target(txn, data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), DocumentKeySet::new()),
                };
                let documents = if use_previous_results {
                    query_engine.get_documents_matching_query(txn, query, last_limbo_free, &remote_keys)?
                } else {
                    query_engine.get_documents_matching_query(
                        txn,
                        query,
                        SnapshotVersion::min(),
                        &DocumentKeySet::new(),
                    )?
                };
                Ok(QueryResult { documents, remote_keys })
            })
    }

    /// Local view of a single document.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let documents = self.lock().local_documents.clone();
        self.inner
            .persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| {
                documents.get_document(txn, key)
            })
    }

    /// Keys the server last reported as matching `target_id`.
    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<DocumentKeySet> {
        let target_cache = self.inner.target_cache;
        self.inner
            .persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                target_cache.matching_keys_for_target(txn, target_id)
            })
    }

    pub fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let (active, references) = {
            let state = self.lock();
            let active: BTreeSet<TargetId> = state.target_data_by_target.keys().copied().collect();
            (active, state.local_view_references.clone())
        };
        let collector = &self.inner.garbage_collector;
        self.inner
            .persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                collector.collect(txn, &active, &references)
            })
    }

    pub(crate) fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.lock().target_data_by_target.keys().copied().collect()
    }

    fn queue_and_documents(&self) -> (MutationQueue, LocalDocumentsView) {
        let state = self.lock();
        (state.mutation_queue.clone(), state.local_documents.clone())
    }

    fn lock(&self) -> MutexGuard<'_, LocalStoreState> {
        self.inner.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn micros(version: SnapshotVersion) -> i64 {
    let timestamp = version.timestamp();
    timestamp.seconds * 1_000_000 + i64::from(timestamp.nanos / 1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::kv_store::MemoryKvStore;
    use crate::model::{
        FieldPath, FieldTransform, MutationResult, Precondition, ResourcePath, TransformOperation, BATCH_ID_UNKNOWN,
    };
    use crate::value::{FirestoreValue, MapValue};

    fn local_store() -> LocalStore {
        let settings = SyncSettings::default();
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", &settings);
        persistence.start().unwrap();
        LocalStore::new(persistence, User::unauthenticated(), &settings)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn rooms() -> Query {
        Query::at_path(ResourcePath::from_string("rooms").unwrap())
    }

    fn acknowledge(store: &LocalStore, batch_id: BatchId, commit: i64) -> DocumentMap {
        acknowledge_with(store, batch_id, commit, Vec::new())
    }

    fn acknowledge_with(
        store: &LocalStore,
        batch_id: BatchId,
        commit: i64,
        transform_results: Vec<FirestoreValue>,
    ) -> DocumentMap {
        let batch = store.next_mutation_batch(batch_id - 1).unwrap().unwrap();
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(version(commit), transform_results.clone()))
            .collect();
        let result = MutationBatchResult::from(batch, version(commit), results, b"token".to_vec()).unwrap();
        store.acknowledge_batch(&result).unwrap()
    }

    #[test]
    fn local_write_is_visible_with_pending_flag() {
        let store = local_store();
        let result = store
            .local_write(vec![Mutation::set(key("rooms/eros"), MapValue::empty())])
            .unwrap();
        let document = &result.changes[&key("rooms/eros")];
        assert!(document.is_found_document());
        assert!(document.has_local_mutations());
        assert_eq!(store.highest_unacknowledged_batch_id().unwrap(), result.batch_id);

        let read = store.read_document(&key("rooms/eros")).unwrap();
        assert!(read.has_local_mutations());
    }

    #[test]
    fn acknowledged_write_moves_to_the_remote_cache() {
        let store = local_store();
        let result = store
            .local_write(vec![Mutation::set(key("rooms/eros"), MapValue::empty())])
            .unwrap();
        let changes = acknowledge(&store, result.batch_id, 5);

        let document = &changes[&key("rooms/eros")];
        assert!(document.has_committed_mutations());
        assert!(!document.has_local_mutations());
        assert_eq!(document.version(), version(5));
        assert_eq!(store.highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);
        assert_eq!(store.last_stream_token().unwrap(), b"token".to_vec());
    }

    #[test]
    fn acknowledged_increment_takes_the_server_result() {
        let store = local_store();
        let count = FieldPath::from_dot_separated("count").unwrap();
        let increment = Mutation::patch(key("rooms/eros"), MapValue::empty(), vec![])
            .with_precondition(Precondition::None)
            .with_transforms(vec![FieldTransform::new(count.clone(), TransformOperation::Increment(1.into()))]);
        let first = store.local_write(vec![increment.clone()]).unwrap();
        let second = store.local_write(vec![increment]).unwrap();
        let local = store.read_document(&key("rooms/eros")).unwrap();
        assert_eq!(local.field(&count), Some(&FirestoreValue::from_integer(2)));

        // The server saw other increments; the pending one still applies on top.
        acknowledge_with(&store, first.batch_id, 2, vec![6.into()]);
        let partial = store.read_document(&key("rooms/eros")).unwrap();
        assert_eq!(partial.field(&count), Some(&FirestoreValue::from_integer(7)));
        assert!(partial.has_local_mutations());

        acknowledge_with(&store, second.batch_id, 3, vec![7.into()]);
        let committed = store.read_document(&key("rooms/eros")).unwrap();
        assert_eq!(committed.field(&count), Some(&FirestoreValue::from_integer(7)));
        assert!(!committed.has_local_mutations());
        assert!(committed.has_committed_mutations());
    }

    #[test]
    fn rejected_write_reverts_the_local_view() {
        let store = local_store();
        let result = store
            .local_write(vec![Mutation::set(key("rooms/eros"), MapValue::empty())])
            .unwrap();
        let changes = store.reject_batch(result.batch_id).unwrap();
        assert!(changes[&key("rooms/eros")].is_no_document());
        assert!(!store.read_document(&key("rooms/eros")).unwrap().has_local_mutations());
        assert!(store.reject_batch(result.batch_id).unwrap().is_empty());
    }

    #[test]
    fn batch_keys_outlive_the_queued_batch() {
        let store = local_store();
        let result = store
            .local_write(vec![Mutation::delete(key("rooms/eros"))])
            .unwrap();
        acknowledge(&store, result.batch_id, 2);

        let documents = store.lookup_mutation_documents(result.batch_id).unwrap().unwrap();
        assert!(documents.contains_key(&key("rooms/eros")));

        store.remove_cached_mutation_batch_metadata(result.batch_id);
        assert!(store.lookup_mutation_documents(result.batch_id).unwrap().is_none());
    }

    #[test]
    fn equal_targets_share_one_allocation() {
        let store = local_store();
        let first = store.allocate_target(rooms().to_target()).unwrap();
        let second = store.allocate_target(rooms().to_target()).unwrap();
        assert_eq!(first.target_id, second.target_id);
        assert_eq!(first.target_id % 2, 0);

        store.release_target(first.target_id, false).unwrap();
        assert!(store.get_local_target_data(&rooms().to_target()).is_none());
        let cached = store.get_cached_target(first.target_id).unwrap().unwrap();
        assert_eq!(cached.target, rooms().to_target());
    }

    #[test]
    fn outdated_watch_updates_are_ignored() {
        let store = local_store();
        let target = store.allocate_target(rooms().to_target()).unwrap();
        let mut event = RemoteEvent {
            snapshot_version: version(3),
            ..RemoteEvent::default()
        };
        let mut change = TargetChange::for_current_change(true, b"r1".to_vec());
        change.added_documents.insert(key("rooms/eros"));
        event.target_changes.insert(target.target_id, change);
        event
            .document_updates
            .insert(key("rooms/eros"), Document::found(key("rooms/eros"), version(3), MapValue::empty()));
        assert_eq!(store.apply_remote_event(&event).unwrap().len(), 1);

        let mut stale = RemoteEvent {
            snapshot_version: version(4),
            ..RemoteEvent::default()
        };
        stale
            .document_updates
            .insert(key("rooms/eros"), Document::found(key("rooms/eros"), version(1), MapValue::empty()));
        assert!(store.apply_remote_event(&stale).unwrap().is_empty());

        assert_eq!(store.last_remote_snapshot_version().unwrap(), version(4));
        assert!(store.remote_document_keys(target.target_id).unwrap().contains(&key("rooms/eros")));
        let result = store.execute_query(&rooms(), true).unwrap();
        assert_eq!(result.documents[&key("rooms/eros")].version(), version(3));
    }

    #[test]
    fn user_change_swaps_the_mutation_queue() {
        let store = local_store();
        let batch = store
            .local_write(vec![Mutation::set(key("rooms/eros"), MapValue::empty())])
            .unwrap();
        let result = store.handle_user_change(&User::new("alice")).unwrap();
        assert_eq!(result.removed_batch_ids, vec![batch.batch_id]);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents[&key("rooms/eros")].has_local_mutations());
        assert_eq!(store.current_user(), User::new("alice"));
    }

    #[test]
    fn applying_the_same_remote_event_twice_changes_nothing() {
        let store = local_store();
        let target = store.allocate_target(rooms().to_target()).unwrap();
        let mut event = RemoteEvent {
            snapshot_version: version(3),
            ..RemoteEvent::default()
        };
        let mut change = TargetChange::for_current_change(true, b"r1".to_vec());
        change.added_documents.insert(key("rooms/eros"));
        event.target_changes.insert(target.target_id, change);
        event
            .document_updates
            .insert(key("rooms/eros"), Document::found(key("rooms/eros"), version(3), MapValue::empty()));

        assert_eq!(store.apply_remote_event(&event).unwrap().len(), 1);
        let cached = store.get_cached_target(target.target_id).unwrap().unwrap();
        let local = store.get_local_target_data(&rooms().to_target()).unwrap();

        assert!(store.apply_remote_event(&event).unwrap().is_empty());
        assert_eq!(store.get_cached_target(target.target_id).unwrap().unwrap().resume_token, cached.resume_token);
        let replayed = store.get_local_target_data(&rooms().to_target()).unwrap();
        assert_eq!(replayed.resume_token, b"r1".to_vec());
        assert_eq!(replayed.resume_token, local.resume_token);
        assert_eq!(replayed.snapshot_version, local.snapshot_version);
        assert_eq!(store.last_remote_snapshot_version().unwrap(), version(3));
        assert!(store.remote_document_keys(target.target_id).unwrap().contains(&key("rooms/eros")));
    }
}
