//! Fans view snapshots out to the listeners registered for each query.
//!
//! Several listeners may watch the same query; the sync engine only sees one
//! listen per query. Each listener decides on its own whether a snapshot is
//! worth raising, depending on its [`ListenOptions`] and on the online state.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use async_channel::Sender;

use crate::core::sync_engine::{SyncEngine, SyncEngineListener};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::core::Query;
use crate::error::{FirestoreError, FirestoreResult};
use crate::remote::OnlineState;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is in metadata (`from_cache`,
    /// `has_pending_writes`).
    pub include_metadata_changes: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

pub type SnapshotSender = Sender<FirestoreResult<ViewSnapshot>>;

struct QueryListener {
    options: ListenOptions,
    sender: SnapshotSender,
    raised_initial_event: bool,
    /// Last snapshot seen, raised or not.
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    fn new(options: ListenOptions, sender: SnapshotSender, online_state: OnlineState) -> Self {
        Self {
            options,
            sender,
            raised_initial_event: false,
            snapshot: None,
            online_state,
        }
    }

    /// Returns the snapshot to deliver, if any.
    fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot) -> Option<ViewSnapshot> {
        let mut snapshot = snapshot.clone();
        if !self.options.include_metadata_changes {
            snapshot
                .document_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            snapshot.excludes_metadata_changes = true;
        }

        let raised = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                Some(self.initial_event(&snapshot))
            } else {
                None
            }
        } else if self.should_raise_event(&snapshot) {
            Some(snapshot.clone())
        } else {
            None
        };
        self.snapshot = Some(snapshot);
        raised
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) -> Option<ViewSnapshot> {
        self.online_state = online_state;
        let snapshot = self.snapshot.clone()?;
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            return Some(self.initial_event(&snapshot));
        }
        None
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        // Cached results are shown right away; an empty cache waits until
        // the backend answers or the client is known to be offline.
        !snapshot.documents.is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|last| last.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn initial_event(&mut self, snapshot: &ViewSnapshot) -> ViewSnapshot {
        self.raised_initial_event = true;
        let mut initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.documents.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
        );
        initial.excludes_metadata_changes = snapshot.excludes_metadata_changes;
        initial
    }
}

struct QueryListenersInfo {
    query: Query,
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<ListenerId>,
}

#[derive(Default)]
struct EventManagerState {
    queries: BTreeMap<String, QueryListenersInfo>,
    listeners: BTreeMap<ListenerId, QueryListener>,
    next_listener_id: u64,
    online_state: OnlineState,
}

type Deliveries = Vec<(SnapshotSender, FirestoreResult<ViewSnapshot>)>;

pub struct EventManager {
    sync_engine: Arc<SyncEngine>,
    state: StdMutex<EventManagerState>,
}

impl EventManager {
    pub fn new(sync_engine: Arc<SyncEngine>) -> Arc<Self> {
        let manager = Arc::new(Self {
            sync_engine,
            state: StdMutex::new(EventManagerState::default()),
        });
        let weak: Weak<EventManager> = Arc::downgrade(&manager);
        manager.sync_engine.set_listener(weak);
        manager
    }

    /// Registers a listener for `query`. Snapshots and the terminal error are
    /// delivered through `sender`.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        sender: SnapshotSender,
    ) -> FirestoreResult<ListenerId> {
        let canonical_id = query.canonical_id();
        let (listener_id, first) = {
            let mut state = self.lock();
            let listener_id = ListenerId(state.next_listener_id);
            state.next_listener_id += 1;
            let online_state = state.online_state;
            state
                .listeners
                .insert(listener_id, QueryListener::new(options, sender.clone(), online_state));
            let info = state
                .queries
                .entry(canonical_id.clone())
                .or_insert_with(|| QueryListenersInfo {
                    query: query.clone(),
                    view_snapshot: None,
                    listeners: Vec::new(),
                });
            info.listeners.push(listener_id);
            (listener_id, info.listeners.len() == 1)
        };

        if first {
            match self.sync_engine.listen(query, true).await {
                Ok(snapshot) => {
                    if let Some(info) = self.lock().queries.get_mut(&canonical_id) {
                        info.view_snapshot = Some(snapshot);
                    }
                }
                Err(err) => {
                    log::warn!("Failed to listen to query {canonical_id}: {err}");
                    let mut state = self.lock();
                    state.queries.remove(&canonical_id);
                    state.listeners.remove(&listener_id);
                    drop(state);
                    let _ = sender.try_send(Err(err.clone()));
                    sender.close();
                    return Err(err);
                }
            }
        }

        let deliveries = {
            let mut state = self.lock();
            let snapshot = state
                .queries
                .get(&canonical_id)
                .and_then(|info| info.view_snapshot.clone());
            let mut deliveries = Deliveries::new();
            if let (Some(listener), Some(snapshot)) = (state.listeners.get_mut(&listener_id), snapshot) {
                if let Some(raised) = listener.on_view_snapshot(&snapshot) {
                    deliveries.push((listener.sender.clone(), Ok(raised)));
                }
            }
            deliveries
        };
        deliver(deliveries);
        Ok(listener_id)
    }

    /// Removes a listener; the query is unlistened once its last listener is gone.
    pub async fn unlisten(&self, listener_id: ListenerId) -> FirestoreResult<()> {
        let last_query = {
            let mut state = self.lock();
            let Some(listener) = state.listeners.remove(&listener_id) else {
                return Ok(());
            };
            listener.sender.close();
            let mut emptied = None;
            for (canonical_id, info) in state.queries.iter_mut() {
                if let Some(position) = info.listeners.iter().position(|id| *id == listener_id) {
                    info.listeners.remove(position);
                    if info.listeners.is_empty() {
                        emptied = Some(canonical_id.clone());
                    }
                    break;
                }
            }
            emptied.and_then(|canonical_id| state.queries.remove(&canonical_id))
        };
        match last_query {
            Some(info) => self.sync_engine.unlisten(&info.query, true).await,
            None => Ok(()),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    fn lock(&self) -> MutexGuard<'_, EventManagerState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let deliveries = {
            let mut state = self.lock();
            let EventManagerState { queries, listeners, .. } = &mut *state;
            let mut deliveries = Deliveries::new();
            for snapshot in snapshots {
                let Some(info) = queries.get_mut(&snapshot.query.canonical_id()) else {
                    continue;
                };
                for listener_id in &info.listeners {
                    let Some(listener) = listeners.get_mut(listener_id) else {
                        continue;
                    };
                    if let Some(raised) = listener.on_view_snapshot(&snapshot) {
                        deliveries.push((listener.sender.clone(), Ok(raised)));
                    }
                }
                info.view_snapshot = Some(snapshot);
            }
            deliveries
        };
        deliver(deliveries);
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let senders: Vec<SnapshotSender> = {
            let mut state = self.lock();
            let Some(info) = state.queries.remove(&query.canonical_id()) else {
                return;
            };
            info.listeners
                .iter()
                .filter_map(|listener_id| state.listeners.remove(listener_id))
                .map(|listener| listener.sender)
                .collect()
        };
        for sender in senders {
            let _ = sender.try_send(Err(error.clone()));
            sender.close();
        }
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let deliveries = {
            let mut state = self.lock();
            state.online_state = online_state;
            let mut deliveries = Deliveries::new();
            for listener in state.listeners.values_mut() {
                if let Some(raised) = listener.apply_online_state_change(online_state) {
                    deliveries.push((listener.sender.clone(), Ok(raised)));
                }
            }
            deliveries
        };
        deliver(deliveries);
    }
}

fn deliver(deliveries: Deliveries) {
    for (sender, event) in deliveries {
        if sender.try_send(event).is_err() {
            log::debug!("Dropping snapshot for a closed listener");
        }
    }
}
