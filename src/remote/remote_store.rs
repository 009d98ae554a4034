//! Owns the watch and write streams and translates between them and the sync engine.
//!
//! All methods run on the async queue. The state lock is never held while
//! calling into a stream or the [`RemoteSyncer`], since both may call back in.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_lock::Mutex;
use async_trait::async_trait;

use crate::error::{
    is_permanent_error, is_permanent_write_error, is_retryable_storage_error, FirestoreError, FirestoreErrorCode,
    FirestoreResult,
};
use crate::local::{LocalStore, TargetData};
use crate::model::{
    DocumentKeySet, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, TargetId, User,
    BATCH_ID_UNKNOWN,
};
use crate::remote::connection::{Connection, TokenProviderArc};
use crate::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
use crate::remote::streams::{ListenStream, ListenStreamListener, WriteStream, WriteStreamListener};
use crate::remote::watch_change::{TargetChangeState, WatchChange};
use crate::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::settings::{StreamSettings, SyncSettings};
use crate::util::{AsyncQueue, ExponentialBackoff};

/// Reasons the remote store keeps its streams closed. The network is used
/// only while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    CredentialChange,
    /// Another instance holds the primary lease.
    IsSecondary,
    /// Local storage failed; cleared once a probe transaction succeeds.
    StorageFailed,
    Shutdown,
}

struct RemoteStoreState {
    listen_targets: BTreeMap<TargetId, TargetData>,
    /// Present while the watch stream is started.
    aggregator: Option<WatchChangeAggregator>,
    /// Batches sent or about to be sent, oldest first; acknowledgements arrive in this order.
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

struct RemoteStoreInner {
    local_store: LocalStore,
    queue: AsyncQueue,
    watch_stream: ListenStream,
    write_stream: WriteStream,
    online_state_tracker: OnlineStateTracker,
    max_pending_writes: usize,
    stream_settings: StreamSettings,
    state: Mutex<RemoteStoreState>,
    syncer: StdMutex<Option<Weak<dyn RemoteSyncer>>>,
}

#[derive(Clone)]
pub struct RemoteStore {
    inner: Arc<RemoteStoreInner>,
}

struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: Option<&'a dyn RemoteSyncer>,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

impl RemoteStore {
    /// Creates a remote store whose network stays off until [`RemoteStore::apply_primary_state`]
    /// reports this instance as primary.
    pub fn new(
        local_store: LocalStore,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        queue: AsyncQueue,
        settings: &SyncSettings,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<RemoteStoreInner>| {
            let watch_stream = ListenStream::listen(
                Arc::new(RemoteListenDelegate { inner: weak.clone() }),
                queue.clone(),
                Arc::clone(&connection),
                Arc::clone(&token_provider),
                &settings.stream,
            );
            let write_stream = WriteStream::write(
                Arc::new(RemoteWriteDelegate { inner: weak.clone() }),
                queue.clone(),
                connection,
                token_provider,
                &settings.stream,
            );
            let tracker_owner = weak.clone();
            let online_state_tracker = OnlineStateTracker::new(
                queue.clone(),
                settings.max_watch_stream_failures,
                settings.online_state_timeout,
                Arc::new(move |online_state| {
                    if let Some(inner) = tracker_owner.upgrade() {
                        if let Some(syncer) = inner.syncer() {
                            syncer.apply_online_state_change(online_state);
                        }
                    }
                }),
            );
            RemoteStoreInner {
                local_store,
                queue,
                watch_stream,
                write_stream,
                online_state_tracker,
                max_pending_writes: settings.max_pending_writes,
                stream_settings: settings.stream.clone(),
                state: Mutex::new(RemoteStoreState {
                    listen_targets: BTreeMap::new(),
                    aggregator: None,
                    write_pipeline: VecDeque::new(),
                    offline_causes: BTreeSet::from([OfflineCause::IsSecondary]),
                }),
                syncer: StdMutex::new(None),
            }
        });
        Self { inner }
    }

    /// Registers the sync engine. Held weakly since the sync engine owns the remote store.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        *self.inner.syncer.lock().unwrap_or_else(|poison| poison.into_inner()) = Some(syncer);
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.online_state_tracker.state()
    }

    pub async fn can_use_network(&self) -> bool {
        self.inner.state.lock().await.offline_causes.is_empty()
    }

    /// Starts watching a target. A target that is already watched is left alone.
    pub async fn listen(&self, target_data: TargetData) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock().await;
            if state.listen_targets.contains_key(&target_data.target_id) {
                return;
            }
            state.listen_targets.insert(target_data.target_id, target_data.clone());
        }
        if inner.should_start_watch_stream().await {
            inner.start_watch_stream().await;
        } else if inner.watch_stream.is_open() {
            inner.send_watch_request(&target_data).await;
        }
    }

    pub async fn unlisten(&self, target_id: TargetId) {
        let inner = &self.inner;
        let (no_targets, can_use_network) = {
            let mut state = inner.state.lock().await;
            state.listen_targets.remove(&target_id);
            (state.listen_targets.is_empty(), state.offline_causes.is_empty())
        };
        if inner.watch_stream.is_open() {
            inner.send_unwatch_request(target_id).await;
        }
        if no_targets {
            if inner.watch_stream.is_open() {
                inner.watch_stream.mark_idle();
            } else if can_use_network {
                // No stream will report connectivity; fall back to unknown.
                inner.online_state_tracker.set(OnlineState::Unknown);
            }
        }
    }

    pub async fn enable_network(&self) {
        self.inner.state.lock().await.offline_causes.remove(&OfflineCause::UserDisabled);
        self.inner.enable_network_internal().await;
    }

    /// Closes both streams and reports the client offline. Unacknowledged
    /// batches stay in the mutation queue and are resent on reconnect.
    pub async fn disable_network(&self) {
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::UserDisabled);
        self.inner.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Offline);
    }

    pub async fn shutdown(&self) {
        log::debug!("Remote store shutting down");
        self.inner.state.lock().await.offline_causes.insert(OfflineCause::Shutdown);
        self.inner.disable_network_internal().await;
        self.inner.online_state_tracker.set(OnlineState::Unknown);
    }

    /// Restarts the streams around the user switch so no request is sent
    /// with stale credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        let inner = &self.inner;
        inner.state.lock().await.offline_causes.insert(OfflineCause::CredentialChange);
        inner.disable_network_internal().await;
        inner.online_state_tracker.set(OnlineState::Unknown);
        let result = match inner.syncer() {
            Some(syncer) => syncer.handle_credential_change(user).await,
            None => Ok(()),
        };
        inner.state.lock().await.offline_causes.remove(&OfflineCause::CredentialChange);
        inner.enable_network_internal().await;
        result
    }

    /// Only the primary instance talks to the backend.
    pub async fn apply_primary_state(&self, is_primary: bool) {
        let inner = &self.inner;
        if is_primary {
            inner.state.lock().await.offline_causes.remove(&OfflineCause::IsSecondary);
            inner.enable_network_internal().await;
        } else {
            inner.state.lock().await.offline_causes.insert(OfflineCause::IsSecondary);
            inner.disable_network_internal().await;
            inner.online_state_tracker.set(OnlineState::Unknown);
        }
    }

    /// Moves queued batches from the mutation queue into the write pipeline.
    pub async fn fill_write_pipeline(&self) {
        self.inner.fill_write_pipeline().await;
    }
}

impl RemoteStoreInner {
    fn syncer(&self) -> Option<Arc<dyn RemoteSyncer>> {
        self.syncer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    async fn should_start_watch_stream(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && !state.listen_targets.is_empty() && !self.watch_stream.is_started()
    }

    async fn should_start_write_stream(&self) -> bool {
        let state = self.state.lock().await;
        state.offline_causes.is_empty() && !state.write_pipeline.is_empty() && !self.write_stream.is_started()
    }

    async fn start_watch_stream(&self) {
        self.state.lock().await.aggregator = Some(WatchChangeAggregator::new());
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    async fn send_watch_request(&self, target_data: &TargetData) {
        if let Some(aggregator) = self.state.lock().await.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_data.target_id);
        }
        if let Err(err) = self.watch_stream.watch(target_data).await {
            log::debug!("Failed to watch target {}: {err}", target_data.target_id);
        }
    }

    async fn send_unwatch_request(&self, target_id: TargetId) {
        if let Some(aggregator) = self.state.lock().await.aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        if let Err(err) = self.watch_stream.unwatch(target_id).await {
            log::debug!("Failed to unwatch target {target_id}: {err}");
        }
    }

    fn enable_network_internal(self: &Arc<Self>) -> RemoteStoreFuture<'_, ()> {
        box_remote_store_future(async move {
            if !self.state.lock().await.offline_causes.is_empty() {
                return;
            }
            if self.should_start_watch_stream().await {
                self.start_watch_stream().await;
            } else {
                self.online_state_tracker.set(OnlineState::Unknown);
            }
            self.fill_write_pipeline().await;
        })
    }

    async fn disable_network_internal(&self) {
        self.write_stream.stop().await;
        self.watch_stream.stop().await;
        let mut state = self.state.lock().await;
        if !state.write_pipeline.is_empty() {
            log::debug!(
                "Stopping write stream with {} pending writes",
                state.write_pipeline.len()
            );
            state.write_pipeline.clear();
        }
        state.aggregator = None;
    }

    /// Takes the network down after a storage failure and brings it back once
    /// storage works again. Other errors are only logged.
    async fn disable_network_until_recovery(self: &Arc<Self>, error: FirestoreError) {
        if !is_retryable_storage_error(&error) {
            log::error!("Unexpected error in the remote store: {error}");
            return;
        }
        log::debug!("Disabling the network until storage recovers: {error}");
        self.state.lock().await.offline_causes.insert(OfflineCause::StorageFailed);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline);

        let weak = Arc::downgrade(self);
        let backoff = ExponentialBackoff::new(
            self.stream_settings.initial_backoff,
            self.stream_settings.backoff_factor,
            self.stream_settings.max_backoff,
        );
        self.queue.enqueue_retryable(
            move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return Ok(());
                    };
                    inner.local_store.last_remote_snapshot_version()?;
                    inner.state.lock().await.offline_causes.remove(&OfflineCause::StorageFailed);
                    inner.enable_network_internal().await;
                    Ok(())
                }
            },
            backoff,
        );
    }

    async fn on_watch_stream_open(&self) {
        let targets: Vec<TargetData> = self.state.lock().await.listen_targets.values().cloned().collect();
        for target_data in &targets {
            self.send_watch_request(target_data).await;
        }
    }

    async fn on_watch_stream_close(&self, error: Option<FirestoreError>) {
        self.state.lock().await.aggregator = None;
        if self.should_start_watch_stream().await {
            self.online_state_tracker.handle_watch_stream_failure(error.as_ref());
            self.start_watch_stream().await;
        } else {
            self.online_state_tracker.set(OnlineState::Unknown);
        }
    }

    async fn on_watch_change(self: &Arc<Self>, change: WatchChange, snapshot_version: SnapshotVersion) {
        self.online_state_tracker.set(OnlineState::Online);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == TargetChangeState::Removed {
                if let Some(cause) = target_change.cause.clone() {
                    if let Err(err) = self.handle_target_error(&target_change.target_ids, cause).await {
                        self.disable_network_until_recovery(err).await;
                    }
                    return;
                }
            }
        }

        let syncer = self.syncer();
        {
            let mut state = self.state.lock().await;
            let RemoteStoreState {
                aggregator,
                listen_targets,
                ..
            } = &mut *state;
            let Some(aggregator) = aggregator.as_mut() else {
                return;
            };
            let metadata = ListenTargetMetadata {
                listen_targets,
                syncer: syncer.as_deref(),
            };
            aggregator.handle_watch_change(&metadata, change);
        }

        if snapshot_version.is_min() {
            return;
        }
        let result = match self.local_store.last_remote_snapshot_version() {
            Ok(last_remote) if snapshot_version >= last_remote => self.raise_watch_snapshot(snapshot_version).await,
            Ok(last_remote) => {
                log::debug!("Ignoring watch snapshot {snapshot_version:?} older than {last_remote:?}");
                Ok(())
            }
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.disable_network_until_recovery(err).await;
        }
    }

    /// Turns the aggregated changes into a remote event and hands it to the sync engine.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let syncer = self.syncer();
        let (event, resets) = {
            let mut state = self.state.lock().await;
            let RemoteStoreState {
                aggregator,
                listen_targets,
                ..
            } = &mut *state;
            let Some(aggregator) = aggregator.as_mut() else {
                return Ok(());
            };
            let metadata = ListenTargetMetadata {
                listen_targets,
                syncer: syncer.as_deref(),
            };
            let event = aggregator.create_remote_event(&metadata, snapshot_version);

            for (target_id, change) in &event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = listen_targets.get_mut(target_id) {
                    *target_data = target_data
                        .clone()
                        .with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            let mut resets = Vec::new();
            for (target_id, purpose) in &event.target_mismatches {
                let Some(target_data) = listen_targets.get_mut(target_id) else {
                    continue;
                };
                // Clearing the token makes the backend resend the whole result set.
                let snapshot = target_data.snapshot_version;
                *target_data = target_data.clone().with_resume_token(Vec::new(), snapshot);
                resets.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
            (event, resets)
        };

        for target_data in &resets {
            self.send_unwatch_request(target_data.target_id).await;
            self.send_watch_request(target_data).await;
        }

        match syncer {
            Some(syncer) => syncer.apply_remote_event(event).await,
            None => Ok(()),
        }
    }

    async fn handle_target_error(&self, target_ids: &[TargetId], cause: FirestoreError) -> FirestoreResult<()> {
        for target_id in target_ids {
            let known = self.state.lock().await.listen_targets.contains_key(target_id);
            if !known {
                continue;
            }
            if let Some(syncer) = self.syncer() {
                syncer.reject_listen(*target_id, cause.clone()).await?;
            }
            let mut state = self.state.lock().await;
            state.listen_targets.remove(target_id);
            if let Some(aggregator) = state.aggregator.as_mut() {
                aggregator.remove_target(*target_id);
            }
        }
        Ok(())
    }

    async fn fill_write_pipeline(self: &Arc<Self>) {
        let mut last_batch_id = {
            let state = self.state.lock().await;
            state
                .write_pipeline
                .back()
                .map(|batch| batch.batch_id)
                .unwrap_or(BATCH_ID_UNKNOWN)
        };
        loop {
            {
                let state = self.state.lock().await;
                if !state.offline_causes.is_empty() || state.write_pipeline.len() >= self.max_pending_writes {
                    break;
                }
            }
            match self.local_store.next_mutation_batch(last_batch_id) {
                Ok(Some(batch)) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch).await;
                }
                Ok(None) => {
                    if self.state.lock().await.write_pipeline.is_empty() {
                        self.write_stream.mark_idle();
                    }
                    break;
                }
                Err(err) => {
                    self.disable_network_until_recovery(err).await;
                    break;
                }
            }
        }
        if self.should_start_write_stream().await {
            self.write_stream.start();
        }
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) {
        let mutations = batch.mutations.clone();
        self.state.lock().await.write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            if let Err(err) = self.write_stream.write_mutations(mutations).await {
                log::debug!("Failed to send mutation batch: {err}");
            }
        }
    }

    async fn on_write_stream_open(&self) {
        if let Err(err) = self.write_stream.write_handshake().await {
            log::debug!("Failed to send the write handshake: {err}");
        }
    }

    async fn on_write_handshake_complete(&self) {
        let token = self.write_stream.last_stream_token();
        if let Err(err) = self.local_store.set_last_stream_token(token) {
            log::debug!("Failed to persist the write stream token: {err}");
        }
        let batches: Vec<MutationBatch> = self.state.lock().await.write_pipeline.iter().cloned().collect();
        for batch in batches {
            if let Err(err) = self.write_stream.write_mutations(batch.mutations).await {
                log::debug!("Failed to send mutation batch {}: {err}", batch.batch_id);
            }
        }
    }

    async fn on_mutation_result(self: &Arc<Self>, commit_version: SnapshotVersion, results: Vec<MutationResult>) {
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            log::error!("Received a write acknowledgement with no batch in flight");
            return;
        };
        let batch_id = batch.batch_id;
        let result = MutationBatchResult::from(batch, commit_version, results, self.write_stream.last_stream_token());
        let applied = match (result, self.syncer()) {
            (Ok(result), Some(syncer)) => syncer.apply_successful_write(result).await,
            (Ok(_), None) => Ok(()),
            (Err(err), _) => Err(err),
        };
        if let Err(err) = applied {
            log::warn!("Failed to apply acknowledgement for batch {batch_id}: {err}");
        }
        self.fill_write_pipeline().await;
    }

    async fn on_write_stream_close(self: &Arc<Self>, error: Option<FirestoreError>) {
        let Some(error) = error else {
            return;
        };
        if self.state.lock().await.write_pipeline.is_empty() {
            return;
        }
        if self.write_stream.handshake_complete() {
            self.handle_write_error(error).await;
        } else {
            self.handle_handshake_error(&error);
        }
        if self.should_start_write_stream().await {
            self.write_stream.start();
        }
    }

    /// A permanent handshake failure means the persisted stream token is bad.
    fn handle_handshake_error(&self, error: &FirestoreError) {
        if !is_permanent_error(error.code) {
            return;
        }
        log::debug!("Write stream handshake failed, resetting the stream token: {error}");
        self.write_stream.set_last_stream_token(Vec::new());
        if let Err(err) = self.local_store.set_last_stream_token(Vec::new()) {
            if err.code != FirestoreErrorCode::PrimaryLeaseLost {
                log::warn!("Failed to reset the write stream token: {err}");
            }
        }
    }

    /// Permanent errors reject the batch at the head of the pipeline; transient
    /// ones leave it in place to be resent after backoff.
    async fn handle_write_error(self: &Arc<Self>, error: FirestoreError) {
        if !is_permanent_write_error(error.code) {
            return;
        }
        let Some(batch) = self.state.lock().await.write_pipeline.pop_front() else {
            return;
        };
        log::warn!("Write batch {} rejected by the backend: {error}", batch.batch_id);
        // The error came from the batch, not the connection; reconnect right away.
        self.write_stream.inhibit_backoff();
        if let Some(syncer) = self.syncer() {
            if let Err(err) = syncer.reject_failed_write(batch.batch_id, error).await {
                log::warn!("Failed to reject batch {}: {err}", batch.batch_id);
            }
        }
        self.fill_write_pipeline().await;
    }
}

struct RemoteListenDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl ListenStreamListener for RemoteListenDelegate {
    async fn on_open(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_stream_open().await;
        }
    }

    async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_change(change, snapshot_version).await;
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_watch_stream_close(error).await;
        }
    }
}

struct RemoteWriteDelegate {
    inner: Weak<RemoteStoreInner>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl WriteStreamListener for RemoteWriteDelegate {
    async fn on_open(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_stream_open().await;
        }
    }

    async fn on_handshake_complete(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_handshake_complete().await;
        }
    }

    async fn on_mutation_result(&self, commit_version: SnapshotVersion, results: Vec<MutationResult>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_mutation_result(commit_version, results).await;
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_write_stream_close(error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::error::{permission_denied, unavailable};
    use crate::local::{MemoryKvStore, Persistence};
    use crate::model::{BatchId, Document, DocumentKey, Mutation, ResourcePath, Timestamp};
    use crate::remote::connection::{InMemoryConnection, InMemoryServer, ListenRequest, NoopTokenProvider, WriteRequest, WriteResponse};
    use crate::remote::remote_event::RemoteEvent;
    use crate::local::TargetPurpose;
    use crate::remote::watch_change::{DocumentChange, ExistenceFilterChange, WatchTargetChange};
    use crate::value::MapValue;

    #[derive(Debug)]
    enum SyncerEvent {
        RemoteEvent(RemoteEvent),
        Rejected(TargetId),
        Acknowledged(BatchId),
        WriteRejected(BatchId, FirestoreErrorCode),
        Online(OnlineState),
    }

    struct RecordingSyncer {
        local_store: LocalStore,
        events: async_channel::Sender<SyncerEvent>,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.local_store.apply_remote_event(&event)?;
                let _ = self.events.send(SyncerEvent::RemoteEvent(event)).await;
                Ok(())
            })
        }

        fn reject_listen(&self, target_id: TargetId, _error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self.events.send(SyncerEvent::Rejected(target_id)).await;
                Ok(())
            })
        }

        fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.local_store.acknowledge_batch(&result)?;
                let _ = self.events.send(SyncerEvent::Acknowledged(result.batch.batch_id)).await;
                Ok(())
            })
        }

        fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.local_store.reject_batch(batch_id)?;
                let _ = self.events.send(SyncerEvent::WriteRejected(batch_id, error.code)).await;
                Ok(())
            })
        }

        fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move { self.local_store.handle_user_change(&user).map(|_| ()) })
        }

        fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.local_store.remote_document_keys(target_id).unwrap_or_default()
        }

        fn apply_online_state_change(&self, online_state: OnlineState) {
            let _ = self.events.try_send(SyncerEvent::Online(online_state));
        }
    }

    struct Harness {
        remote_store: RemoteStore,
        local_store: LocalStore,
        server: InMemoryServer,
        events: async_channel::Receiver<SyncerEvent>,
        queue: AsyncQueue,
        _syncer: Arc<RecordingSyncer>,
    }

    impl Harness {
        fn new() -> Self {
            let settings = SyncSettings::default();
            let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", &settings);
            persistence.start().unwrap();
            let local_store = LocalStore::new(persistence, User::unauthenticated(), &settings);
            let (connection, server) = InMemoryConnection::new();
            let queue = AsyncQueue::new();
            let remote_store = RemoteStore::new(
                local_store.clone(),
                Arc::new(connection),
                Arc::new(NoopTokenProvider),
                queue.clone(),
                &settings,
            );
            let (sender, events) = async_channel::unbounded();
            let syncer = Arc::new(RecordingSyncer {
                local_store: local_store.clone(),
                events: sender,
            });
            let weak: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<dyn RemoteSyncer>;
            remote_store.set_syncer(weak);
            Self {
                remote_store,
                local_store,
                server,
                events,
                queue,
                _syncer: syncer,
            }
        }

        async fn run<F, Fut>(&self, op: F)
        where
            F: FnOnce(RemoteStore) -> Fut,
            Fut: std::future::Future<Output = ()> + Send + 'static,
        {
            let future = op(self.remote_store.clone());
            self.queue
                .enqueue(async move {
                    future.await;
                    Ok(())
                })
                .await
                .unwrap();
        }

        async fn next_remote_event(&self) -> RemoteEvent {
            loop {
                if let SyncerEvent::RemoteEvent(event) = self.events.recv().await.unwrap() {
                    return event;
                }
            }
        }

        async fn next_matching(&self, matches: impl Fn(&SyncerEvent) -> bool) -> SyncerEvent {
            loop {
                let event = self.events.recv().await.unwrap();
                if matches(&event) {
                    return event;
                }
            }
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[tokio::test]
    async fn watch_snapshot_reaches_the_syncer() {
        let harness = Harness::new();
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let target_data = harness.local_store.allocate_target(query.to_target()).unwrap();
        let target_id = target_data.target_id;
        harness
            .run(move |store| async move {
                store.apply_primary_state(true).await;
                store.listen(target_data).await;
            })
            .await;

        let backend = harness.server.next_listen_stream().await.unwrap();
        match backend.recv().await.unwrap() {
            ListenRequest::AddTarget { target_id: id, .. } => assert_eq!(id, target_id),
            other => panic!("unexpected request {other:?}"),
        }

        let changes = vec![
            WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Added, vec![target_id])),
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: Vec::new(),
                document: Document::found(key("rooms/a"), version(1), MapValue::empty()),
            }),
            WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![target_id]).with_resume_token(b"r1".to_vec()),
            ),
            WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::NoChange, vec![]).with_read_time(version(2))),
        ];
        for change in changes {
            assert!(backend.send(change).await);
        }

        let event = harness.next_remote_event().await;
        assert_eq!(event.snapshot_version, version(2));
        assert!(event.target_changes[&target_id].current);
        assert!(event.document_updates.contains_key(&key("rooms/a")));
        assert_eq!(harness.remote_store.online_state(), OnlineState::Online);
    }

    #[tokio::test]
    async fn existence_filter_mismatch_resets_the_target() {
        let harness = Harness::new();
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let target_data = harness.local_store.allocate_target(query.to_target()).unwrap();
        let target_id = target_data.target_id;
        harness
            .run(move |store| async move {
                store.apply_primary_state(true).await;
                store.listen(target_data).await;
            })
            .await;

        let backend = harness.server.next_listen_stream().await.unwrap();
        assert!(matches!(backend.recv().await, Some(ListenRequest::AddTarget { .. })));
        let changes = vec![
            WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Added, vec![target_id])),
            WatchChange::DocumentChange(DocumentChange {
                updated_target_ids: vec![target_id],
                removed_target_ids: Vec::new(),
                document: Document::found(key("rooms/a"), version(1), MapValue::empty()),
            }),
            WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Current, vec![target_id]).with_resume_token(b"r1".to_vec()),
            ),
            WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::NoChange, vec![]).with_read_time(version(2))),
        ];
        for change in changes {
            assert!(backend.send(change).await);
        }
        harness.next_remote_event().await;
        assert_eq!(
            harness.remote_store.inner.state.lock().await.listen_targets[&target_id].resume_token,
            b"r1".to_vec()
        );

        // The backend counts no documents while the client holds one.
        let changes = vec![
            WatchChange::ExistenceFilter(ExistenceFilterChange { target_id, count: 0 }),
            WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::NoChange, vec![]).with_read_time(version(3))),
        ];
        for change in changes {
            assert!(backend.send(change).await);
        }
        let event = harness.next_remote_event().await;
        assert_eq!(
            event.target_mismatches.get(&target_id),
            Some(&TargetPurpose::ExistenceFilterMismatch)
        );

        assert_eq!(backend.recv().await, Some(ListenRequest::RemoveTarget { target_id }));
        match backend.recv().await {
            Some(ListenRequest::AddTarget {
                target_id: id,
                resume_token,
                ..
            }) => {
                assert_eq!(id, target_id);
                assert!(resume_token.is_empty());
            }
            other => panic!("unexpected request {other:?}"),
        }
        assert!(harness.remote_store.inner.state.lock().await.listen_targets[&target_id]
            .resume_token
            .is_empty());
        let local = harness.local_store.get_local_target_data(&query.to_target()).unwrap();
        assert!(local.resume_token.is_empty());
    }

    #[tokio::test]
    async fn rejected_target_is_reported() {
        let harness = Harness::new();
        let query = Query::at_path(ResourcePath::from_string("secret").unwrap());
        let target_data = harness.local_store.allocate_target(query.to_target()).unwrap();
        let target_id = target_data.target_id;
        harness
            .run(move |store| async move {
                store.apply_primary_state(true).await;
                store.listen(target_data).await;
            })
            .await;

        let backend = harness.server.next_listen_stream().await.unwrap();
        backend.recv().await.unwrap();
        backend
            .send(WatchChange::TargetChange(
                WatchTargetChange::new(TargetChangeState::Removed, vec![target_id])
                    .with_cause(permission_denied("no access")),
            ))
            .await;
        let rejected = harness
            .next_matching(|event| matches!(event, SyncerEvent::Rejected(_)))
            .await;
        assert!(matches!(rejected, SyncerEvent::Rejected(id) if id == target_id));
    }

    #[tokio::test]
    async fn writes_are_sent_after_the_handshake_and_acknowledged() {
        let harness = Harness::new();
        let batch = harness
            .local_store
            .local_write(vec![Mutation::set(key("rooms/a"), MapValue::empty())])
            .unwrap();
        harness
            .run(|store| async move {
                store.apply_primary_state(true).await;
            })
            .await;

        let backend = harness.server.next_write_stream().await.unwrap();
        assert_eq!(backend.recv().await, Some(WriteRequest::Handshake));
        backend.send(WriteResponse::handshake(b"s1".to_vec())).await;
        match backend.recv().await.unwrap() {
            WriteRequest::Write { stream_token, mutations } => {
                assert_eq!(stream_token, b"s1".to_vec());
                assert_eq!(mutations.len(), 1);
            }
            other => panic!("unexpected request {other:?}"),
        }
        backend
            .send(WriteResponse {
                stream_token: b"s2".to_vec(),
                commit_version: version(3),
                mutation_results: vec![MutationResult::new(version(3), Vec::new())],
            })
            .await;

        let acknowledged = harness
            .next_matching(|event| matches!(event, SyncerEvent::Acknowledged(_)))
            .await;
        assert!(matches!(acknowledged, SyncerEvent::Acknowledged(id) if id == batch.batch_id));
        assert_eq!(harness.local_store.last_stream_token().unwrap(), b"s2".to_vec());
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_the_batch() {
        let harness = Harness::new();
        let batch = harness
            .local_store
            .local_write(vec![Mutation::delete(key("rooms/a"))])
            .unwrap();
        harness
            .run(|store| async move {
                store.apply_primary_state(true).await;
            })
            .await;

        let backend = harness.server.next_write_stream().await.unwrap();
        backend.recv().await.unwrap();
        backend.send(WriteResponse::handshake(b"s1".to_vec())).await;
        backend.recv().await.unwrap();
        backend.fail(permission_denied("denied")).await;

        let rejected = harness
            .next_matching(|event| matches!(event, SyncerEvent::WriteRejected(..)))
            .await;
        assert!(matches!(
            rejected,
            SyncerEvent::WriteRejected(id, FirestoreErrorCode::PermissionDenied) if id == batch.batch_id
        ));
        assert!(harness.local_store.next_mutation_batch(BATCH_ID_UNKNOWN).unwrap().is_none());
    }

    #[tokio::test]
    async fn transient_watch_failure_goes_offline_and_reconnects() {
        let harness = Harness::new();
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let target_data = harness.local_store.allocate_target(query.to_target()).unwrap();
        harness
            .run(move |store| async move {
                store.apply_primary_state(true).await;
                store.listen(target_data).await;
            })
            .await;

        let first = harness.server.next_listen_stream().await.unwrap();
        first.recv().await.unwrap();
        first.fail(unavailable("network down")).await;
        harness
            .next_matching(|event| matches!(event, SyncerEvent::Online(OnlineState::Offline)))
            .await;

        let second = harness.server.next_listen_stream().await.unwrap();
        assert!(matches!(second.recv().await, Some(ListenRequest::AddTarget { .. })));
    }

    #[tokio::test]
    async fn disable_network_closes_streams() {
        let harness = Harness::new();
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap());
        let target_data = harness.local_store.allocate_target(query.to_target()).unwrap();
        harness
            .run(move |store| async move {
                store.apply_primary_state(true).await;
                store.listen(target_data).await;
            })
            .await;
        let backend = harness.server.next_listen_stream().await.unwrap();
        backend.recv().await.unwrap();

        harness.run(|store| async move { store.disable_network().await }).await;
        assert_eq!(harness.remote_store.online_state(), OnlineState::Offline);
        assert!(backend.recv().await.is_none());
        assert!(!harness.remote_store.can_use_network().await);
    }
}
