//! Glue between the local store, the remote store and the views of active
//! queries.
//!
//! The sync engine owns one [`View`] per listened query and keeps it up to
//! date as local writes, remote events and write acknowledgements arrive. It
//! tracks limbo documents (documents a view shows that the backend has not
//! confirmed) and resolves them with single-document listens, at most
//! `max_concurrent_limbo_resolutions` at a time.
//!
//! Every method runs on the async queue. The state lock is only held across
//! synchronous local store calls, never across an await.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use futures::channel::oneshot;

use crate::core::view::{LimboDocumentChange, View};
use crate::core::view_snapshot::ViewSnapshot;
use crate::core::{Query, Target};
use crate::error::{cancelled, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::local::{
    LocalStore, LocalViewChanges, MutationBatchState, QueryTargetState, ReferenceSet, SharedClientState,
    SharedClientStateSyncer, TargetData, TargetPurpose,
};
use crate::model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, MutationBatchResult, Mutation, SnapshotVersion,
    TargetId, User, BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::remote::{
    box_remote_store_future, OnlineState, RemoteEvent, RemoteStore, RemoteStoreFuture, RemoteSyncer, TargetChange,
};

/// Resolves once the backend accepted or rejected a write.
pub type WriteReceiver = oneshot::Receiver<FirestoreResult<()>>;

/// Receives what the sync engine raises for the registered queries.
pub trait SyncEngineListener: Send + Sync + 'static {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    /// The listen for `query` failed permanently; the query is no longer active.
    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

struct LimboResolution {
    key: DocumentKey,
    /// Set once the limbo target reported the document, so an existence filter
    /// for the target can be checked against it.
    received_document: bool,
}

/// Listens and unlistens computed under the state lock and sent after it is released.
#[derive(Default)]
struct RemoteRequests {
    listens: Vec<TargetData>,
    unlistens: Vec<TargetId>,
}

impl RemoteRequests {
    fn extend(&mut self, other: RemoteRequests) {
        self.listens.extend(other.listens);
        self.unlistens.extend(other.unlistens);
    }
}

struct SyncEngineState {
    current_user: User,
    /// `None` until the persistence layer reported the first primary state.
    is_primary: Option<bool>,
    online_state: OnlineState,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, Vec<Query>>,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    limbo_document_refs: ReferenceSet,
    next_limbo_target_id: TargetId,
    max_concurrent_limbo_resolutions: usize,
    mutation_callbacks: HashMap<String, BTreeMap<BatchId, oneshot::Sender<FirestoreResult<()>>>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<oneshot::Sender<FirestoreResult<()>>>>,
}

impl SyncEngineState {
    fn is_primary(&self) -> bool {
        self.is_primary == Some(true)
    }

    fn update_tracked_limbos(
        &mut self,
        target_id: TargetId,
        changes: Vec<LimboDocumentChange>,
        requests: &mut RemoteRequests,
    ) {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key, requests);
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("Document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(&key, requests);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey, requests: &mut RemoteRequests) {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        log::debug!("New document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(requests);
    }

    /// Starts limbo listens from the queue until the pool is full.
    fn pump_enqueued_limbo_resolutions(&mut self, requests: &mut RemoteRequests) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.next_limbo_target_id;
            self.next_limbo_target_id += 2;
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            requests.listens.push(TargetData::new(
                Target::for_document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            ));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey, requests: &mut RemoteRequests) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        self.active_limbo_resolutions_by_target.remove(&target_id);
        requests.unlistens.push(target_id);
        self.pump_enqueued_limbo_resolutions(requests);
    }

    /// Drops all limbo bookkeeping and returns the limbo targets that were being listened to.
    fn reset_limbo_documents(&mut self) -> Vec<TargetId> {
        let target_ids = self.active_limbo_targets_by_key.values().copied().collect();
        self.limbo_document_refs.remove_all_references();
        self.active_limbo_targets_by_key.clear();
        self.active_limbo_resolutions_by_target.clear();
        self.enqueued_limbo_resolutions.clear();
        target_ids
    }
}

pub struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    shared_client_state: SharedClientState,
    state: StdMutex<SyncEngineState>,
    listener: StdMutex<Option<Weak<dyn SyncEngineListener>>>,
}

impl SyncEngine {
    /// Creates the sync engine and registers it with the remote store and the shared client state.
    pub fn new(
        local_store: LocalStore,
        remote_store: RemoteStore,
        shared_client_state: SharedClientState,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let current_user = local_store.current_user();
        let engine = Arc::new(Self {
            local_store,
            remote_store,
            shared_client_state,
            state: StdMutex::new(SyncEngineState {
                current_user,
                is_primary: None,
                online_state: OnlineState::Unknown,
                query_views: BTreeMap::new(),
                queries_by_target: BTreeMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: BTreeMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                // Query targets get even ids from the target cache.
                next_limbo_target_id: 1,
                max_concurrent_limbo_resolutions,
                mutation_callbacks: HashMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
            }),
            listener: StdMutex::new(None),
        });
        let weak: Weak<SyncEngine> = Arc::downgrade(&engine);
        engine.remote_store.set_syncer(weak.clone());
        engine.shared_client_state.set_syncer(weak);
        engine
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        *self.listener.lock().unwrap_or_else(|poison| poison.into_inner()) = Some(listener);
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn is_primary_client(&self) -> bool {
        self.lock().is_primary()
    }

    /// Number of limbo documents currently being resolved, and the number waiting for a free slot.
    pub fn limbo_resolution_counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.active_limbo_targets_by_key.len(), state.enqueued_limbo_resolutions.len())
    }

    /// Starts listening to `query` and returns its initial snapshot.
    ///
    /// A query that is already active shares the existing view.
    pub async fn listen(&self, query: Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        let existing = {
            let state = self.lock();
            state
                .query_views
                .get(&query.canonical_id())
                .map(|query_view| (query_view.target_id, query_view.view.compute_initial_snapshot()))
        };
        if let Some((target_id, snapshot)) = existing {
            self.shared_client_state.add_local_query_target(target_id)?;
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let target_state = self.shared_client_state.add_local_query_target(target_data.target_id)?;
        let is_primary = self.is_primary_client();
        let (snapshot, requests) = self.initialize_view_and_compute_snapshot(
            query,
            target_data.target_id,
            target_state == QueryTargetState::Current,
            is_primary,
        )?;
        if is_primary && should_listen_to_remote {
            self.remote_store.listen(target_data).await;
        }
        self.send_remote_requests(requests).await;
        Ok(snapshot)
    }

    /// Stops listening to `query`. The target is released once no query and
    /// no other instance uses it.
    pub async fn unlisten(&self, query: &Query, should_unlisten_to_remote: bool) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.lock();
            let Some(target_id) = state.query_views.get(&canonical_id).map(|query_view| query_view.target_id) else {
                log::debug!("Ignoring unlisten of inactive query {canonical_id}");
                return Ok(());
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        if self.is_primary_client() {
            // Removed first so the check below only sees other instances.
            self.shared_client_state.remove_local_query_target(target_id)?;
            if self.shared_client_state.is_active_query_target(target_id) {
                return Ok(());
            }
            match self.local_store.release_target(target_id, false) {
                Ok(()) => {}
                Err(err) if err.code == FirestoreErrorCode::PrimaryLeaseLost => {
                    log::debug!("Lost the primary lease while releasing target {target_id}");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
            self.shared_client_state.clear_query_state(target_id);
            if should_unlisten_to_remote {
                self.remote_store.unlisten(target_id).await;
            }
            let requests = self.remove_and_clean_up_target(target_id, None);
            self.send_remote_requests(requests).await;
        } else {
            let requests = self.remove_and_clean_up_target(target_id, None);
            self.local_store.release_target(target_id, true)?;
            self.send_remote_requests(requests).await;
        }
        Ok(())
    }

    /// Applies `mutations` locally and queues them for the backend. The
    /// returned receiver resolves with the backend's verdict.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteReceiver> {
        let result = self.local_store.local_write(mutations)?;
        self.shared_client_state.add_pending_mutation(result.batch_id)?;
        let (sender, receiver) = oneshot::channel();
        {
            let mut state = self.lock();
            let user_key = state.current_user.key().to_string();
            state
                .mutation_callbacks
                .entry(user_key)
                .or_default()
                .insert(result.batch_id, sender);
        }
        self.emit_new_snaps_and_notify_local_store(&result.changes, None).await?;
        self.remote_store.fill_write_pipeline().await;
        Ok(receiver)
    }

    /// Resolves once every batch written so far has been acknowledged or rejected.
    pub async fn register_pending_writes_callback(&self) -> FirestoreResult<WriteReceiver> {
        if !self.remote_store.can_use_network().await {
            log::debug!(
                "The network is disabled. Pending writes will not be acknowledged until the network is enabled."
            );
        }
        let highest = self.local_store.highest_unacknowledged_batch_id()?;
        let (sender, receiver) = oneshot::channel();
        if highest == BATCH_ID_UNKNOWN {
            let _ = sender.send(Ok(()));
        } else {
            self.lock().pending_writes_callbacks.entry(highest).or_default().push(sender);
        }
        Ok(receiver)
    }

    /// Called when this instance gains or loses the primary lease.
    pub async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        let was_primary = self.lock().is_primary;
        if is_primary && was_primary != Some(true) {
            log::debug!("Becoming the primary client");
            let active_targets: Vec<TargetId> = self
                .shared_client_state
                .get_all_active_query_targets()
                .into_iter()
                .collect();
            let (active_queries, requests) = self.synchronize_query_views_and_raise_snapshots(active_targets, true)?;
            self.lock().is_primary = Some(true);
            self.remote_store.apply_primary_state(true).await;
            for target_data in active_queries {
                self.remote_store.listen(target_data).await;
            }
            self.send_remote_requests(requests).await;
        } else if !is_primary && was_primary != Some(false) {
            log::debug!("Becoming a secondary client");
            let limbo_targets = self.lock().reset_limbo_documents();
            for target_id in limbo_targets {
                self.remote_store.unlisten(target_id).await;
            }

            let target_ids: Vec<TargetId> = self.lock().queries_by_target.keys().copied().collect();
            let mut active_targets = Vec::new();
            for target_id in target_ids {
                if self.shared_client_state.is_local_query_target(target_id) {
                    active_targets.push(target_id);
                } else {
                    // Views kept only for other instances are not needed as a secondary.
                    self.remove_and_clean_up_target(target_id, None);
                    self.local_store.release_target(target_id, true)?;
                }
                self.remote_store.unlisten(target_id).await;
            }
            self.synchronize_query_views_and_raise_snapshots(active_targets, false)?;
            self.lock().is_primary = Some(false);
            self.remote_store.apply_primary_state(false).await;
        }
        Ok(())
    }

    fn initialize_view_and_compute_snapshot(
        &self,
        query: Query,
        target_id: TargetId,
        current: bool,
        update_limbo_documents: bool,
    ) -> FirestoreResult<(ViewSnapshot, RemoteRequests)> {
        let query_result = self.local_store.execute_query(&query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);

        let mut requests = RemoteRequests::default();
        let mut state = self.lock();
        let synthesized = TargetChange::for_current_change(
            current && state.online_state != OnlineState::Offline,
            Vec::new(),
        );
        let view_change = view.apply_changes(doc_changes, update_limbo_documents, Some(&synthesized));
        state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut requests);
        state.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        state.queries_by_target.entry(target_id).or_default().push(query);
        let snapshot = view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view must produce an initial snapshot"))?;
        Ok((snapshot, requests))
    }

    /// Re-reads the views of `target_ids` from persisted state, creating views
    /// for targets another instance started. Returns the target data to listen to.
    fn synchronize_query_views_and_raise_snapshots(
        &self,
        target_ids: Vec<TargetId>,
        transition_to_primary: bool,
    ) -> FirestoreResult<(Vec<TargetData>, RemoteRequests)> {
        let mut snapshots = Vec::new();
        let mut active_queries = Vec::new();
        let mut requests = RemoteRequests::default();

        for target_id in target_ids {
            let queries = self.lock().queries_by_target.get(&target_id).cloned().unwrap_or_default();
            let target_data = if let Some(first) = queries.first() {
                let target_data = self.local_store.allocate_target(first.to_target())?;
                for query in &queries {
                    let query_result = self.local_store.execute_query(query, true)?;
                    let mut state = self.lock();
                    let Some(query_view) = state.query_views.get_mut(&query.canonical_id()) else {
                        continue;
                    };
                    let view_change = query_view.view.synchronize_with_persisted_state(query_result);
                    if transition_to_primary {
                        state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut requests);
                    }
                    snapshots.extend(view_change.snapshot);
                }
                target_data
            } else {
                let Some(cached) = self.local_store.get_cached_target(target_id)? else {
                    log::warn!("Cannot synchronize unknown target {target_id}");
                    continue;
                };
                let target_data = self.local_store.allocate_target(cached.target.clone())?;
                let (_, view_requests) = self.initialize_view_and_compute_snapshot(
                    cached.target.to_query(),
                    target_data.target_id,
                    false,
                    transition_to_primary,
                )?;
                requests.extend(view_requests);
                target_data
            };
            active_queries.push(target_data);
        }

        self.raise_snapshots(snapshots);
        Ok((active_queries, requests))
    }

    /// Recomputes every view against `changes`, raises the resulting snapshots
    /// and records which documents the views now show.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut requests = RemoteRequests::default();
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let mut query_states = Vec::new();
        {
            let mut state = self.lock();
            let is_primary = state.is_primary();
            let canonical_ids: Vec<String> = state.query_views.keys().cloned().collect();
            for canonical_id in canonical_ids {
                let Some(query_view) = state.query_views.get_mut(&canonical_id) else {
                    continue;
                };
                let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
                if doc_changes.needs_refill {
                    // The limit window lost a document; rerun without the previous results.
                    let query_result = self.local_store.execute_query(&query_view.query, false)?;
                    doc_changes = query_view
                        .view
                        .compute_doc_changes(&query_result.documents, Some(doc_changes));
                }
                let target_id = query_view.target_id;
                let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
                let view_change = query_view.view.apply_changes(doc_changes, is_primary, target_change);
                state.update_tracked_limbos(target_id, view_change.limbo_changes, &mut requests);
                if let Some(snapshot) = view_change.snapshot {
                    if is_primary {
                        let query_state = if snapshot.from_cache {
                            QueryTargetState::NotCurrent
                        } else {
                            QueryTargetState::Current
                        };
                        query_states.push((target_id, query_state));
                    }
                    view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                    snapshots.push(snapshot);
                }
            }
        }

        for (target_id, query_state) in query_states {
            self.shared_client_state.update_query_state(target_id, query_state, None)?;
        }
        self.raise_snapshots(snapshots);
        if let Err(err) = self.local_store.notify_local_view_changes(&view_changes) {
            log::debug!("Failed to update sequence numbers: {err}");
        }
        self.send_remote_requests(requests).await;
        Ok(())
    }

    fn remove_and_clean_up_target(&self, target_id: TargetId, error: Option<FirestoreError>) -> RemoteRequests {
        if let Err(err) = self.shared_client_state.remove_local_query_target(target_id) {
            log::debug!("Failed to update the shared state of target {target_id}: {err}");
        }
        let mut requests = RemoteRequests::default();
        let queries = {
            let mut state = self.lock();
            let queries = state.queries_by_target.remove(&target_id).unwrap_or_default();
            for query in &queries {
                state.query_views.remove(&query.canonical_id());
            }
            if state.is_primary() {
                let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
                for key in &limbo_keys {
                    if !state.limbo_document_refs.contains_key(key) {
                        state.remove_limbo_target(key, &mut requests);
                    }
                }
            }
            queries
        };
        if let Some(error) = error {
            if let Some(listener) = self.listener() {
                for query in &queries {
                    listener.on_watch_error(query, error.clone());
                }
            }
        }
        requests
    }

    async fn send_remote_requests(&self, requests: RemoteRequests) {
        for target_id in requests.unlistens {
            self.remote_store.unlisten(target_id).await;
        }
        for target_data in requests.listens {
            self.remote_store.listen(target_data).await;
        }
    }

    async fn apply_remote_event_internal(&self, event: RemoteEvent) -> FirestoreResult<()> {
        {
            let mut state = self.lock();
            for (target_id, change) in &event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                let change_count =
                    change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len();
                if change_count > 1 {
                    return Err(internal_error("Limbo resolution for a single document contains multiple changes"));
                }
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(internal_error("Received a change for a limbo document that was never added"));
                    }
                } else if !change.removed_documents.is_empty() {
                    if !resolution.received_document {
                        return Err(internal_error("Received a removal for a limbo document that was never added"));
                    }
                    resolution.received_document = false;
                }
            }
        }

        match self.local_store.apply_remote_event(&event) {
            Ok(changes) => self.emit_new_snaps_and_notify_local_store(&changes, Some(&event)).await,
            Err(err) if err.code == FirestoreErrorCode::PrimaryLeaseLost => {
                log::debug!("Lost the primary lease while applying a remote event");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn reject_listen_internal(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(&error))?;

        let mut requests = RemoteRequests::default();
        let limbo_key = {
            let mut state = self.lock();
            let key = state
                .active_limbo_resolutions_by_target
                .remove(&target_id)
                .map(|resolution| resolution.key);
            if let Some(key) = &key {
                state.active_limbo_targets_by_key.remove(key);
                state.pump_enqueued_limbo_resolutions(&mut requests);
            }
            key
        };

        if let Some(key) = limbo_key {
            log::debug!("Limbo resolution for {key} was rejected: {error}");
            self.send_remote_requests(requests).await;
            // Treat the document as deleted; access to it was lost.
            let mut event = RemoteEvent::default();
            event
                .document_updates
                .insert(key.clone(), Document::no_document(key.clone(), SnapshotVersion::min()));
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event_internal(event).await;
        }

        match self.local_store.release_target(target_id, false) {
            Ok(()) => {}
            Err(err) if err.code == FirestoreErrorCode::PrimaryLeaseLost => return Ok(()),
            Err(err) => return Err(err),
        }
        let requests = self.remove_and_clean_up_target(target_id, Some(error));
        self.send_remote_requests(requests).await;
        Ok(())
    }

    async fn apply_successful_write_internal(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = match self.local_store.acknowledge_batch(&result) {
            Ok(changes) => changes,
            Err(err) if err.code == FirestoreErrorCode::PrimaryLeaseLost => return Ok(()),
            Err(err) => return Err(err),
        };
        self.process_user_callback(batch_id, None);
        self.trigger_pending_writes_callbacks(batch_id);
        self.local_store.remove_cached_mutation_batch_metadata(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None)?;
        self.emit_new_snaps_and_notify_local_store(&changes, None).await
    }

    async fn reject_failed_write_internal(&self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = match self.local_store.reject_batch(batch_id) {
            Ok(changes) => changes,
            Err(err) if err.code == FirestoreErrorCode::PrimaryLeaseLost => return Ok(()),
            Err(err) => return Err(err),
        };
        self.process_user_callback(batch_id, Some(error.clone()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.local_store.remove_cached_mutation_batch_metadata(batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(&error))?;
        self.emit_new_snaps_and_notify_local_store(&changes, None).await
    }

    async fn handle_credential_change_internal(&self, user: User) -> FirestoreResult<()> {
        if self.lock().current_user == user {
            return Ok(());
        }
        log::debug!("User change. New user: {}", user.key());
        let result = self.local_store.handle_user_change(&user)?;
        self.lock().current_user = user.clone();
        self.reject_outstanding_pending_writes_callbacks("Pending writes were abandoned because the user changed");
        self.shared_client_state
            .handle_user_change(user, &result.removed_batch_ids, &result.added_batch_ids)?;
        self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)
            .await
    }

    fn apply_online_state(&self, online_state: OnlineState, source: OnlineStateSource) {
        let (snapshots, is_primary) = {
            let mut state = self.lock();
            let is_primary = state.is_primary();
            let applies = match source {
                OnlineStateSource::RemoteStore => is_primary,
                OnlineStateSource::SharedClientState => !is_primary,
            };
            if !applies {
                return;
            }
            state.online_state = online_state;
            let snapshots: Vec<ViewSnapshot> = state
                .query_views
                .values_mut()
                .filter_map(|query_view| query_view.view.apply_online_state_change(online_state).snapshot)
                .collect();
            (snapshots, is_primary)
        };
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
        }
        self.raise_snapshots(snapshots);
        if is_primary {
            if let Err(err) = self.shared_client_state.set_online_state(online_state) {
                log::debug!("Failed to share the online state: {err}");
            }
        }
    }

    /// Resolves the write callback of `batch_id` if this instance issued the batch.
    fn process_user_callback(&self, batch_id: BatchId, error: Option<FirestoreError>) -> bool {
        let sender = {
            let mut state = self.lock();
            let user_key = state.current_user.key().to_string();
            state
                .mutation_callbacks
                .get_mut(&user_key)
                .and_then(|callbacks| callbacks.remove(&batch_id))
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(error.map_or(Ok(()), Err));
                true
            }
            None => false,
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: BatchId) {
        let callbacks = self.lock().pending_writes_callbacks.remove(&batch_id).unwrap_or_default();
        for callback in callbacks {
            let _ = callback.send(Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&self, message: &str) {
        let callbacks = std::mem::take(&mut self.lock().pending_writes_callbacks);
        for callback in callbacks.into_values().flatten() {
            let _ = callback.send(Err(cancelled(message)));
        }
    }

    fn raise_snapshots(&self, snapshots: Vec<ViewSnapshot>) {
        if snapshots.is_empty() {
            return;
        }
        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn lock(&self) -> MutexGuard<'_, SyncEngineState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_remote_event_internal(event))
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_listen_internal(target_id, error))
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.apply_successful_write_internal(result))
    }

    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.reject_failed_write_internal(batch_id, error))
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_credential_change_internal(user))
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.lock();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return DocumentKeySet::unit(resolution.key.clone());
            }
            return DocumentKeySet::new();
        }
        let mut keys = DocumentKeySet::new();
        for query in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(&query.canonical_id()) {
                keys = keys.union(query_view.view.synced_documents().clone());
            }
        }
        keys
    }

    fn apply_online_state_change(&self, online_state: OnlineState) {
        self.apply_online_state(online_state, OnlineStateSource::RemoteStore);
    }
}

impl SharedClientStateSyncer for SyncEngine {
    fn apply_batch_state(
        &self,
        batch_id: BatchId,
        batch_state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            let Some(documents) = self.local_store.lookup_mutation_documents(batch_id)? else {
                log::debug!("Cannot apply mutation batch with id {batch_id}");
                return Ok(());
            };
            match batch_state {
                MutationBatchState::Pending => {
                    // The primary picks up batches written by secondaries.
                    self.remote_store.fill_write_pipeline().await;
                }
                MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                    if self.process_user_callback(batch_id, error) {
                        self.shared_client_state.remove_mutation_state(batch_id);
                    }
                    self.trigger_pending_writes_callbacks(batch_id);
                    self.local_store.remove_cached_mutation_batch_metadata(batch_id);
                }
            }
            self.emit_new_snaps_and_notify_local_store(&documents, None).await
        })
    }

    fn apply_target_state(
        &self,
        target_id: TargetId,
        target_state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            if self.is_primary_client() {
                log::debug!("Ignoring unexpected query state notification for target {target_id}");
                return Ok(());
            }
            let queries = self.lock().queries_by_target.get(&target_id).cloned().unwrap_or_default();
            if queries.is_empty() {
                return Ok(());
            }
            match target_state {
                QueryTargetState::Current | QueryTargetState::NotCurrent => {
                    // The primary already persisted the changes; re-read them.
                    let mut changes = DocumentMap::new();
                    let mut synced = DocumentKeySet::new();
                    for query in &queries {
                        let query_result = self.local_store.execute_query(query, true)?;
                        let shown = {
                            let state = self.lock();
                            state
                                .query_views
                                .get(&query.canonical_id())
                                .map(|query_view| {
                                    synced = synced.clone().union(query_view.view.synced_documents().clone());
                                    query_view.view.document_keys()
                                })
                                .unwrap_or_default()
                        };
                        for key in shown {
                            if !query_result.documents.contains_key(&key) {
                                changes.insert(key.clone(), self.local_store.read_document(&key)?);
                            }
                        }
                        changes.extend(query_result.documents);
                    }
                    let remote_keys = self.local_store.remote_document_keys(target_id)?;
                    let mut event = RemoteEvent::synthesized_for_current_change(
                        target_id,
                        target_state == QueryTargetState::Current,
                        Vec::new(),
                    );
                    if let Some(change) = event.target_changes.get_mut(&target_id) {
                        change.added_documents = remote_keys.clone().relative_complement(synced.clone());
                        change.removed_documents = synced.relative_complement(remote_keys);
                    }
                    self.emit_new_snaps_and_notify_local_store(&changes, Some(&event)).await
                }
                QueryTargetState::Rejected => {
                    self.local_store.release_target(target_id, true)?;
                    let requests = self.remove_and_clean_up_target(
                        target_id,
                        Some(error.unwrap_or_else(|| internal_error("Listen was rejected"))),
                    );
                    self.send_remote_requests(requests).await;
                    Ok(())
                }
            }
        })
    }

    fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            if !self.is_primary_client() {
                return Ok(());
            }
            for target_id in added {
                if self.lock().queries_by_target.contains_key(&target_id) {
                    log::debug!("Adding an already active target {target_id}");
                    continue;
                }
                let Some(cached) = self.local_store.get_cached_target(target_id)? else {
                    log::warn!("Another client listens to unknown target {target_id}");
                    continue;
                };
                let target_data = self.local_store.allocate_target(cached.target.clone())?;
                let (_, requests) = self.initialize_view_and_compute_snapshot(
                    cached.target.to_query(),
                    target_data.target_id,
                    false,
                    true,
                )?;
                self.remote_store.listen(target_data).await;
                self.send_remote_requests(requests).await;
            }
            for target_id in removed {
                if !self.lock().queries_by_target.contains_key(&target_id) {
                    continue;
                }
                // Still listened to by this instance.
                if self.shared_client_state.is_local_query_target(target_id) {
                    continue;
                }
                match self.local_store.release_target(target_id, false) {
                    Ok(()) => {}
                    Err(err) if err.code == FirestoreErrorCode::PrimaryLeaseLost => continue,
                    Err(err) => return Err(err),
                }
                self.remote_store.unlisten(target_id).await;
                let requests = self.remove_and_clean_up_target(target_id, None);
                self.send_remote_requests(requests).await;
            }
            Ok(())
        })
    }

    fn apply_shared_online_state(&self, online_state: OnlineState) {
        self.apply_online_state(online_state, OnlineStateSource::SharedClientState);
    }
}
