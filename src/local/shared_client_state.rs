//! State shared between instances that open the same store.
//!
//! Each instance publishes its active targets, the outcome of the mutation
//! batches it wrote and (when primary) the online state on a broadcast
//! key/value channel. Changes made by other instances are delivered to the
//! registered [`SharedClientStateSyncer`] on the async queue.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use async_channel::{Receiver, Sender};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::model::{BatchId, TargetId, User};
use crate::platform::runtime;
use crate::remote::{OnlineState, RemoteStoreFuture};
use crate::util::AsyncQueue;

const CLIENT_STATE_PREFIX: &str = "firestore_clients_";
const MUTATION_STATE_PREFIX: &str = "firestore_mutations_";
const QUERY_TARGET_PREFIX: &str = "firestore_targets_";
const ONLINE_STATE_KEY: &str = "firestore_online_state";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SharedChannelEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub value: Option<String>,
}

/// Broadcast key/value storage visible to every instance. Writes made through
/// one handle are reported to the subscribers of all other handles.
pub trait SharedChannel: Send + Sync + 'static {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: String);

    fn remove(&self, key: &str);

    fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, String)>;

    fn subscribe(&self) -> Receiver<SharedChannelEvent>;

    /// Ends every subscription of this handle.
    fn close(&self);
}

struct ChannelHub {
    items: StdMutex<BTreeMap<String, String>>,
    subscribers: StdMutex<Vec<(u64, Sender<SharedChannelEvent>)>>,
    next_endpoint: AtomicU64,
}

/// In-process [`SharedChannel`]; [`MemorySharedChannel::connect`] opens
/// another handle on the same storage.
#[derive(Clone)]
pub struct MemorySharedChannel {
    hub: Arc<ChannelHub>,
    endpoint: u64,
}

impl MemorySharedChannel {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(ChannelHub {
                items: StdMutex::new(BTreeMap::new()),
                subscribers: StdMutex::new(Vec::new()),
                next_endpoint: AtomicU64::new(1),
            }),
            endpoint: 0,
        }
    }

    pub fn connect(&self) -> Self {
        Self {
            hub: Arc::clone(&self.hub),
            endpoint: self.hub.next_endpoint.fetch_add(1, Ordering::SeqCst),
        }
    }

    fn items(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.hub.items.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, Sender<SharedChannelEvent>)>> {
        self.hub.subscribers.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn broadcast(&self, event: SharedChannelEvent) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|(_, sender)| !sender.is_closed());
        for (endpoint, sender) in subscribers.iter() {
            if *endpoint != self.endpoint {
                let _ = sender.try_send(event.clone());
            }
        }
    }
}

impl Default for MemorySharedChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedChannel for MemorySharedChannel {
    fn get(&self, key: &str) -> Option<String> {
        self.items().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.items().insert(key.to_string(), value.clone());
        self.broadcast(SharedChannelEvent {
            key: key.to_string(),
            value: Some(value),
        });
    }

    fn remove(&self, key: &str) {
        if self.items().remove(key).is_some() {
            self.broadcast(SharedChannelEvent {
                key: key.to_string(),
                value: None,
            });
        }
    }

    fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.items()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn subscribe(&self) -> Receiver<SharedChannelEvent> {
        let (sender, receiver) = async_channel::unbounded();
        self.subscribers().push((self.endpoint, sender));
        receiver
    }

    fn close(&self) {
        self.subscribers().retain(|(endpoint, sender)| {
            if *endpoint == self.endpoint {
                sender.close();
                false
            } else {
                true
            }
        });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

#[derive(Serialize, Deserialize)]
struct ErrorRecord {
    code: FirestoreErrorCode,
    message: String,
}

impl ErrorRecord {
    fn from_error(error: &FirestoreError) -> Self {
        Self {
            code: error.code,
            message: error.message().to_string(),
        }
    }

    fn into_error(self) -> FirestoreError {
        FirestoreError::new(self.code, self.message)
    }
}

#[derive(Serialize, Deserialize)]
struct ClientRecord {
    active_target_ids: BTreeSet<TargetId>,
    update_time_ms: i64,
}

#[derive(Serialize, Deserialize)]
struct MutationRecord {
    state: MutationBatchState,
    error: Option<ErrorRecord>,
}

#[derive(Serialize, Deserialize)]
struct QueryTargetRecord {
    state: QueryTargetState,
    error: Option<ErrorRecord>,
}

#[derive(Serialize, Deserialize)]
struct OnlineStateRecord {
    client_id: String,
    online_state: OnlineState,
}

/// Receives changes published by other instances. Runs on the async queue.
pub trait SharedClientStateSyncer: Send + Sync + 'static {
    /// A batch written by the current user changed state in another instance.
    fn apply_batch_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_target_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The union of all instances' active targets changed.
    fn apply_active_targets_change(
        &self,
        added: Vec<TargetId>,
        removed: Vec<TargetId>,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The primary published a new online state.
    fn apply_shared_online_state(&self, online_state: OnlineState);
}

struct SharedState {
    user: User,
    started: bool,
    local_targets: BTreeSet<TargetId>,
    remote_clients: BTreeMap<String, BTreeSet<TargetId>>,
}

impl SharedState {
    fn all_active_targets(&self) -> BTreeSet<TargetId> {
        let mut targets = self.local_targets.clone();
        for client_targets in self.remote_clients.values() {
            targets.extend(client_targets.iter().copied());
        }
        targets
    }
}

struct SharedClientStateInner {
    client_id: String,
    channel: Arc<dyn SharedChannel>,
    queue: AsyncQueue,
    state: StdMutex<SharedState>,
    syncer: StdMutex<Option<Weak<dyn SharedClientStateSyncer>>>,
}

#[derive(Clone)]
pub struct SharedClientState {
    inner: Arc<SharedClientStateInner>,
}

impl SharedClientState {
    pub fn new(channel: Arc<dyn SharedChannel>, queue: AsyncQueue, client_id: impl Into<String>, user: User) -> Self {
        Self {
            inner: Arc::new(SharedClientStateInner {
                client_id: client_id.into(),
                channel,
                queue,
                state: StdMutex::new(SharedState {
                    user,
                    started: false,
                    local_targets: BTreeSet::new(),
                    remote_clients: BTreeMap::new(),
                }),
                syncer: StdMutex::new(None),
            }),
        }
    }

    pub fn set_syncer(&self, syncer: Weak<dyn SharedClientStateSyncer>) {
        *self.inner.syncer.lock().unwrap_or_else(|poison| poison.into_inner()) = Some(syncer);
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Loads the other instances' state, publishes this one and starts
    /// listening for changes.
    pub fn start(&self) -> FirestoreResult<()> {
        let receiver = self.inner.channel.subscribe();
        let mut remote_clients = BTreeMap::new();
        for (key, value) in self.inner.channel.entries_with_prefix(CLIENT_STATE_PREFIX) {
            let client_id = &key[CLIENT_STATE_PREFIX.len()..];
            if client_id == self.inner.client_id {
                continue;
            }
            match decode::<ClientRecord>(&value) {
                Ok(record) => {
                    remote_clients.insert(client_id.to_string(), record.active_target_ids);
                }
                Err(err) => log::warn!("Ignoring malformed state of client {client_id}: {err}"),
            }
        }
        {
            let mut state = self.lock();
            state.remote_clients = remote_clients;
            state.started = true;
        }
        self.persist_client_state()?;
        self.spawn_event_reader(receiver);
        Ok(())
    }

    pub fn shutdown(&self) {
        let was_started = std::mem::replace(&mut self.lock().started, false);
        if was_started {
            self.inner.channel.remove(&client_state_key(&self.inner.client_id));
            self.inner.channel.close();
        }
    }

    pub fn add_pending_mutation(&self, batch_id: BatchId) -> FirestoreResult<()> {
        self.update_mutation_state(batch_id, MutationBatchState::Pending, None)
    }

    pub fn update_mutation_state(
        &self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<&FirestoreError>,
    ) -> FirestoreResult<()> {
        let key = mutation_state_key(&self.lock().user, batch_id);
        let record = MutationRecord {
            state,
            error: error.map(ErrorRecord::from_error),
        };
        self.inner.channel.set(&key, encode(&record)?);
        Ok(())
    }

    pub fn remove_mutation_state(&self, batch_id: BatchId) {
        let key = mutation_state_key(&self.lock().user, batch_id);
        self.inner.channel.remove(&key);
    }

    /// Marks the target active in this instance and returns the state another
    /// instance last published for it.
    pub fn add_local_query_target(&self, target_id: TargetId) -> FirestoreResult<QueryTargetState> {
        let active_elsewhere = self
            .lock()
            .remote_clients
            .values()
            .any(|targets| targets.contains(&target_id));
        let mut query_state = QueryTargetState::NotCurrent;
        if active_elsewhere {
            if let Some(value) = self.inner.channel.get(&query_target_key(target_id)) {
                match decode::<QueryTargetRecord>(&value) {
                    Ok(record) => query_state = record.state,
                    Err(err) => log::warn!("Ignoring malformed state of target {target_id}: {err}"),
                }
            }
        }
        self.lock().local_targets.insert(target_id);
        self.persist_client_state()?;
        Ok(query_state)
    }

    pub fn remove_local_query_target(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.lock().local_targets.remove(&target_id);
        self.persist_client_state()
    }

    pub fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.lock().local_targets.contains(&target_id)
    }

    /// Whether any instance, this one included, listens to the target.
    pub fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.lock().all_active_targets().contains(&target_id)
    }

    pub fn get_all_active_query_targets(&self) -> BTreeSet<TargetId> {
        self.lock().all_active_targets()
    }

    pub fn update_query_state(
        &self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<&FirestoreError>,
    ) -> FirestoreResult<()> {
        let record = QueryTargetRecord {
            state,
            error: error.map(ErrorRecord::from_error),
        };
        self.inner.channel.set(&query_target_key(target_id), encode(&record)?);
        Ok(())
    }

    pub fn clear_query_state(&self, target_id: TargetId) {
        self.inner.channel.remove(&query_target_key(target_id));
    }

    /// Drops the previous user's pending batches and publishes the new user's.
    pub fn handle_user_change(
        &self,
        user: User,
        removed_batch_ids: &[BatchId],
        added_batch_ids: &[BatchId],
    ) -> FirestoreResult<()> {
        for batch_id in removed_batch_ids {
            self.remove_mutation_state(*batch_id);
        }
        self.lock().user = user;
        for batch_id in added_batch_ids {
            self.add_pending_mutation(*batch_id)?;
        }
        Ok(())
    }

    /// Published by the primary for the secondaries.
    pub fn set_online_state(&self, online_state: OnlineState) -> FirestoreResult<()> {
        let record = OnlineStateRecord {
            client_id: self.inner.client_id.clone(),
            online_state,
        };
        self.inner.channel.set(ONLINE_STATE_KEY, encode(&record)?);
        Ok(())
    }

    fn persist_client_state(&self) -> FirestoreResult<()> {
        let record = {
            let state = self.lock();
            if !state.started {
                return Ok(());
            }
            ClientRecord {
                active_target_ids: state.local_targets.clone(),
                update_time_ms: runtime::now_millis(),
            }
        };
        self.inner
            .channel
            .set(&client_state_key(&self.inner.client_id), encode(&record)?);
        Ok(())
    }

    fn spawn_event_reader(&self, receiver: Receiver<SharedChannelEvent>) {
        let weak = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            while let Ok(event) = receiver.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let queue = inner.queue.clone();
                let shared = SharedClientState { inner };
                queue.enqueue_and_forget(async move {
                    if let Err(err) = shared.handle_event(event).await {
                        log::warn!("Failed to apply a change from another client: {err}");
                    }
                });
            }
        });
    }

    async fn handle_event(&self, event: SharedChannelEvent) -> FirestoreResult<()> {
        if !self.lock().started {
            return Ok(());
        }
        let Some(syncer) = self.syncer() else {
            return Ok(());
        };

        if let Some(client_id) = event.key.strip_prefix(CLIENT_STATE_PREFIX) {
            if client_id == self.inner.client_id {
                return Ok(());
            }
            let targets = match &event.value {
                Some(value) => Some(decode::<ClientRecord>(value)?.active_target_ids),
                None => None,
            };
            let (added, removed) = {
                let mut state = self.lock();
                let before = state.all_active_targets();
                match targets {
                    Some(targets) => state.remote_clients.insert(client_id.to_string(), targets),
                    None => state.remote_clients.remove(client_id),
                };
                let after = state.all_active_targets();
                (
                    after.difference(&before).copied().collect::<Vec<_>>(),
                    before.difference(&after).copied().collect::<Vec<_>>(),
                )
            };
            if added.is_empty() && removed.is_empty() {
                return Ok(());
            }
            return syncer.apply_active_targets_change(added, removed).await;
        }

        if let Some(rest) = event.key.strip_prefix(MUTATION_STATE_PREFIX) {
            let Some(value) = event.value else {
                return Ok(());
            };
            let Some((user_key, batch_id)) = rest.rsplit_once('_') else {
                return Ok(());
            };
            if user_key != self.lock().user.key() {
                return Ok(());
            }
            let batch_id: BatchId = batch_id
                .parse()
                .map_err(|_| internal_error(format!("Invalid mutation state key {}", event.key)))?;
            let record: MutationRecord = decode(&value)?;
            return syncer
                .apply_batch_state(batch_id, record.state, record.error.map(ErrorRecord::into_error))
                .await;
        }

        if let Some(target_id) = event.key.strip_prefix(QUERY_TARGET_PREFIX) {
            let Some(value) = event.value else {
                return Ok(());
            };
            let target_id: TargetId = target_id
                .parse()
                .map_err(|_| internal_error(format!("Invalid query target key {}", event.key)))?;
            let record: QueryTargetRecord = decode(&value)?;
            return syncer
                .apply_target_state(target_id, record.state, record.error.map(ErrorRecord::into_error))
                .await;
        }

        if event.key == ONLINE_STATE_KEY {
            if let Some(value) = event.value {
                let record: OnlineStateRecord = decode(&value)?;
                if record.client_id != self.inner.client_id {
                    syncer.apply_shared_online_state(record.online_state);
                }
            }
        }
        Ok(())
    }

    fn syncer(&self) -> Option<Arc<dyn SharedClientStateSyncer>> {
        self.inner
            .syncer
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

fn client_state_key(client_id: &str) -> String {
    format!("{CLIENT_STATE_PREFIX}{client_id}")
}

fn mutation_state_key(user: &User, batch_id: BatchId) -> String {
    format!("{MUTATION_STATE_PREFIX}{}_{batch_id}", user.key())
}

fn query_target_key(target_id: TargetId) -> String {
    format!("{QUERY_TARGET_PREFIX}{target_id}")
}

fn encode<T: Serialize>(value: &T) -> FirestoreResult<String> {
    serde_json::to_string(value).map_err(|err| internal_error(format!("Failed to encode shared state: {err}")))
}

fn decode<T: DeserializeOwned>(value: &str) -> FirestoreResult<T> {
    serde_json::from_str(value).map_err(|err| internal_error(format!("Failed to decode shared state: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::permission_denied;
    use crate::remote::box_remote_store_future;

    #[derive(Debug, PartialEq)]
    enum Applied {
        Batch(BatchId, MutationBatchState, Option<FirestoreErrorCode>),
        Target(TargetId, QueryTargetState),
        ActiveTargets(Vec<TargetId>, Vec<TargetId>),
        Online(OnlineState),
    }

    struct RecordingSyncer {
        sender: Sender<Applied>,
    }

    impl SharedClientStateSyncer for RecordingSyncer {
        fn apply_batch_state(
            &self,
            batch_id: BatchId,
            state: MutationBatchState,
            error: Option<FirestoreError>,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self
                    .sender
                    .send(Applied::Batch(batch_id, state, error.map(|err| err.code)))
                    .await;
                Ok(())
            })
        }

        fn apply_target_state(
            &self,
            target_id: TargetId,
            state: QueryTargetState,
            _error: Option<FirestoreError>,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self.sender.send(Applied::Target(target_id, state)).await;
                Ok(())
            })
        }

        fn apply_active_targets_change(
            &self,
            added: Vec<TargetId>,
            removed: Vec<TargetId>,
        ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let _ = self.sender.send(Applied::ActiveTargets(added, removed)).await;
                Ok(())
            })
        }

        fn apply_shared_online_state(&self, online_state: OnlineState) {
            let _ = self.sender.try_send(Applied::Online(online_state));
        }
    }

    fn client(
        channel: MemorySharedChannel,
        client_id: &str,
    ) -> (SharedClientState, Arc<RecordingSyncer>, Receiver<Applied>) {
        let shared = SharedClientState::new(Arc::new(channel), AsyncQueue::new(), client_id, User::new("alice"));
        let (sender, receiver) = async_channel::unbounded();
        let syncer = Arc::new(RecordingSyncer { sender });
        let weak: Weak<dyn SharedClientStateSyncer> = Arc::downgrade(&syncer) as Weak<dyn SharedClientStateSyncer>;
        shared.set_syncer(weak);
        shared.start().unwrap();
        (shared, syncer, receiver)
    }

    #[tokio::test]
    async fn mutation_outcomes_reach_other_clients() {
        let channel = MemorySharedChannel::new();
        let (first, _first_syncer, first_events) = client(channel.clone(), "first");
        let (second, _second_syncer, second_events) = client(channel.connect(), "second");

        first.add_pending_mutation(1).unwrap();
        assert_eq!(
            second_events.recv().await.unwrap(),
            Applied::Batch(1, MutationBatchState::Pending, None)
        );

        second
            .update_mutation_state(1, MutationBatchState::Rejected, Some(&permission_denied("denied")))
            .unwrap();
        assert_eq!(
            first_events.recv().await.unwrap(),
            Applied::Batch(1, MutationBatchState::Rejected, Some(FirestoreErrorCode::PermissionDenied))
        );
    }

    #[tokio::test]
    async fn mutations_of_another_user_are_ignored() {
        let channel = MemorySharedChannel::new();
        let (first, _first_syncer, _first_events) = client(channel.clone(), "first");
        let (_second, _second_syncer, second_events) = client(channel.connect(), "second");

        first.handle_user_change(User::new("bob"), &[], &[7]).unwrap();
        first.set_online_state(OnlineState::Online).unwrap();
        // Ordered after the ignored mutation event.
        assert_eq!(second_events.recv().await.unwrap(), Applied::Online(OnlineState::Online));
    }

    #[tokio::test]
    async fn active_targets_are_unioned_across_clients() {
        let channel = MemorySharedChannel::new();
        let (first, _first_syncer, _first_events) = client(channel.clone(), "first");
        let (second, _second_syncer, second_events) = client(channel.connect(), "second");

        first.add_local_query_target(2).unwrap();
        assert_eq!(
            second_events.recv().await.unwrap(),
            Applied::ActiveTargets(vec![2], vec![])
        );
        assert!(second.is_active_query_target(2));
        assert!(!second.is_local_query_target(2));

        first.shutdown();
        assert_eq!(
            second_events.recv().await.unwrap(),
            Applied::ActiveTargets(vec![], vec![2])
        );
        assert!(second.get_all_active_query_targets().is_empty());
    }

    #[tokio::test]
    async fn joining_a_current_target_reuses_its_state() {
        let channel = MemorySharedChannel::new();
        let (first, _first_syncer, _first_events) = client(channel.clone(), "first");
        first.add_local_query_target(4).unwrap();
        first.update_query_state(4, QueryTargetState::Current, None).unwrap();

        let (second, _second_syncer, _second_events) = client(channel.connect(), "second");
        assert_eq!(second.add_local_query_target(4).unwrap(), QueryTargetState::Current);
        assert_eq!(second.add_local_query_target(6).unwrap(), QueryTargetState::NotCurrent);
    }

    #[test]
    fn prefix_scan_only_returns_matching_keys() {
        let channel = MemorySharedChannel::new();
        channel.set("firestore_clients_a", "1".into());
        channel.set("firestore_clients_b", "2".into());
        channel.set("firestore_online_state", "3".into());
        let entries = channel.entries_with_prefix(CLIENT_STATE_PREFIX);
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(key, _)| key.starts_with(CLIENT_STATE_PREFIX)));
    }
}
