//! Caller-facing entry point that wires the sync components together.
//!
//! Every operation is funneled through the client's [`AsyncQueue`] so the
//! components only ever see one operation at a time. Results that depend on
//! the backend (write acknowledgements, pending-write barriers) are awaited
//! outside the queue.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use async_channel::Receiver;
use futures::Stream;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

use crate::core::event_manager::{EventManager, ListenOptions, ListenerId};
use crate::core::sync_engine::{SyncEngine, WriteReceiver};
use crate::core::view::View;
use crate::core::view_snapshot::ViewSnapshot;
use crate::core::Query;
use crate::error::{cancelled, internal_error, unavailable, FirestoreErrorCode, FirestoreResult};
use crate::local::{
    KvStore, LocalStore, LruScheduler, MemoryKvStore, MemorySharedChannel, Persistence, SharedChannel,
    SharedClientState,
};
use crate::model::{DatabaseId, Document, DocumentKey, Mutation, User};
use crate::remote::{Connection, NoopTokenProvider, OnlineState, RemoteStore, TokenProviderArc};
use crate::settings::SyncSettings;
use crate::util::AsyncQueue;

fn generate_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(20)
        .collect()
}

pub struct FirestoreClientBuilder {
    database_id: DatabaseId,
    connection: Arc<dyn Connection>,
    token_provider: TokenProviderArc,
    store: Option<Arc<dyn KvStore>>,
    shared_channel: Option<Arc<dyn SharedChannel>>,
    settings: SyncSettings,
    client_id: Option<String>,
    user: User,
}

impl FirestoreClientBuilder {
    pub fn new(database_id: DatabaseId, connection: Arc<dyn Connection>) -> Self {
        Self {
            database_id,
            connection,
            token_provider: Arc::new(NoopTokenProvider),
            store: None,
            shared_channel: None,
            settings: SyncSettings::default(),
            client_id: None,
            user: User::unauthenticated(),
        }
    }

    pub fn with_token_provider(mut self, token_provider: TokenProviderArc) -> Self {
        self.token_provider = token_provider;
        self
    }

    /// Durable storage; defaults to a private in-memory store.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Channel shared with the other instances using the same store.
    pub fn with_shared_channel(mut self, channel: Arc<dyn SharedChannel>) -> Self {
        self.shared_channel = Some(channel);
        self
    }

    pub fn with_settings(mut self, settings: SyncSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_user(mut self, user: User) -> Self {
        self.user = user;
        self
    }

    /// Starts persistence and the sync components on a fresh queue.
    ///
    /// Falls back to in-memory storage when the configured store reports
    /// `PersistenceUnavailable`.
    pub async fn build(self) -> FirestoreResult<FirestoreClient> {
        self.settings.validate()?;
        let queue = AsyncQueue::new();
        let client_id = self.client_id.clone().unwrap_or_else(generate_client_id);
        let database_id = self.database_id.clone();
        log::debug!(
            "Initializing client {client_id} for {}",
            database_id.persistence_key()
        );
        let components = queue
            .enqueue(Components::initialize(self, client_id.clone(), queue.clone()))
            .await?;
        Ok(FirestoreClient {
            inner: Arc::new(ClientInner {
                database_id,
                client_id,
                queue,
                components,
            }),
        })
    }
}

struct Components {
    persistence: Arc<Persistence>,
    local_store: LocalStore,
    remote_store: RemoteStore,
    shared_client_state: SharedClientState,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    lru_scheduler: Arc<LruScheduler>,
}

impl Components {
    async fn initialize(builder: FirestoreClientBuilder, client_id: String, queue: AsyncQueue) -> FirestoreResult<Self> {
        let settings = builder.settings;
        let mut shared_channel = builder.shared_channel;
        let store = builder.store.unwrap_or_else(|| Arc::new(MemoryKvStore::new()));

        let mut persistence = Persistence::new(store, client_id.clone(), &settings);
        if let Err(err) = persistence.start() {
            if err.code != FirestoreErrorCode::PersistenceUnavailable {
                return Err(err);
            }
            log::warn!("Error enabling durable storage; falling back to memory: {err}");
            persistence = Persistence::new(Arc::new(MemoryKvStore::new()), client_id.clone(), &settings);
            persistence.start()?;
            // Other instances cannot see the in-memory store.
            shared_channel = None;
        }

        let local_store = LocalStore::new(persistence.clone(), builder.user.clone(), &settings);
        let channel = shared_channel.unwrap_or_else(|| Arc::new(MemorySharedChannel::new()));
        let shared_client_state = SharedClientState::new(channel, queue.clone(), client_id, builder.user);
        let remote_store = RemoteStore::new(
            local_store.clone(),
            builder.connection,
            builder.token_provider,
            queue.clone(),
            &settings,
        );
        let sync_engine = SyncEngine::new(
            local_store.clone(),
            remote_store.clone(),
            shared_client_state.clone(),
            settings.max_concurrent_limbo_resolutions,
        );
        let event_manager = EventManager::new(sync_engine.clone());
        shared_client_state.start()?;

        let lru_scheduler = LruScheduler::new(
            queue.clone(),
            local_store.clone(),
            settings.gc_initial_delay,
            settings.gc_regular_delay,
        );

        let weak_engine: Weak<SyncEngine> = Arc::downgrade(&sync_engine);
        let weak_scheduler: Weak<LruScheduler> = Arc::downgrade(&lru_scheduler);
        let listener_queue = queue.clone();
        persistence.set_primary_state_listener(Arc::new(move |is_primary| {
            let weak_engine = weak_engine.clone();
            let weak_scheduler = weak_scheduler.clone();
            listener_queue.enqueue_and_forget(async move {
                let Some(sync_engine) = weak_engine.upgrade() else {
                    return;
                };
                if let Err(err) = sync_engine.apply_primary_state(is_primary).await {
                    log::warn!("Failed to apply primary state {is_primary}: {err}");
                }
                if let Some(scheduler) = weak_scheduler.upgrade() {
                    if is_primary {
                        scheduler.start();
                    } else {
                        scheduler.stop();
                    }
                }
            });
        }));
        persistence.start_heartbeat(&queue);

        Ok(Self {
            persistence,
            local_store,
            remote_store,
            shared_client_state,
            sync_engine,
            event_manager,
            lru_scheduler,
        })
    }
}

struct ClientInner {
    database_id: DatabaseId,
    client_id: String,
    queue: AsyncQueue,
    components: Components,
}

/// One instance of the offline sync core.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

impl FirestoreClient {
    pub fn builder(database_id: DatabaseId, connection: Arc<dyn Connection>) -> FirestoreClientBuilder {
        FirestoreClientBuilder::new(database_id, connection)
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_primary(&self) -> bool {
        self.inner.components.persistence.is_primary()
    }

    pub fn online_state(&self) -> OnlineState {
        self.inner.components.remote_store.online_state()
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.queue.is_shutting_down()
    }

    /// Applies `mutations` locally and resolves once the backend accepted them.
    ///
    /// Local listeners see the change before this resolves. A permanent
    /// backend error is returned here and the change is rolled back.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let sync_engine = self.inner.components.sync_engine.clone();
        let receiver = self
            .inner
            .queue
            .enqueue(async move { sync_engine.write(mutations).await })
            .await?;
        await_receiver(receiver).await
    }

    /// Starts listening to `query`. Dropping the stream stops the listen.
    pub async fn listen(&self, query: Query, options: ListenOptions) -> FirestoreResult<SnapshotStream> {
        let (sender, receiver) = async_channel::unbounded();
        let event_manager = self.inner.components.event_manager.clone();
        let listener_id = self
            .inner
            .queue
            .enqueue(async move { event_manager.listen(query, options, sender).await })
            .await?;
        Ok(SnapshotStream {
            receiver: Box::pin(receiver),
            listener_id,
            queue: self.inner.queue.clone(),
            event_manager: Arc::downgrade(&self.inner.components.event_manager),
        })
    }

    /// Reads one document from the local cache, pending writes included.
    ///
    /// Returns `None` for a document known to be deleted and `Unavailable`
    /// when the cache knows nothing about it.
    pub async fn get_document_from_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        let local_store = self.inner.components.local_store.clone();
        let document = self
            .inner
            .queue
            .enqueue(async move { local_store.read_document(&key) })
            .await?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() && (document.has_local_mutations() || !document.version().is_min()) {
            Ok(None)
        } else {
            Err(unavailable(
                "Failed to get document from cache. The document may exist on the server but the client is offline.",
            ))
        }
    }

    /// Runs `query` against the local cache only.
    pub async fn get_from_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = self.inner.components.local_store.clone();
        self.inner
            .queue
            .enqueue(async move {
                let result = local_store.execute_query(&query, true)?;
                let mut view = View::new(query, result.remote_keys);
                let doc_changes = view.compute_doc_changes(&result.documents, None);
                view.apply_changes(doc_changes, false, None)
                    .snapshot
                    .ok_or_else(|| internal_error("A new view must produce an initial snapshot"))
            })
            .await
    }

    /// Resolves once every write issued so far has been acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let sync_engine = self.inner.components.sync_engine.clone();
        let receiver = self
            .inner
            .queue
            .enqueue(async move { sync_engine.register_pending_writes_callback().await })
            .await?;
        await_receiver(receiver).await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let persistence = self.inner.components.persistence.clone();
        let remote_store = self.inner.components.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move {
                persistence.set_network_enabled(true)?;
                remote_store.enable_network().await;
                Ok(())
            })
            .await
    }

    /// Stops talking to the backend; listeners get snapshots from cache and
    /// writes stay queued until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let persistence = self.inner.components.persistence.clone();
        let remote_store = self.inner.components.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move {
                persistence.set_network_enabled(false)?;
                remote_store.disable_network().await;
                Ok(())
            })
            .await
    }

    /// Switches to `user`; pending writes of the previous user stay queued for them.
    pub async fn set_user(&self, user: User) -> FirestoreResult<()> {
        let remote_store = self.inner.components.remote_store.clone();
        self.inner
            .queue
            .enqueue(async move { remote_store.handle_credential_change(user).await })
            .await
    }

    pub async fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        let persistence = self.inner.components.persistence.clone();
        self.inner
            .queue
            .enqueue(async move { persistence.set_in_foreground(in_foreground) })
            .await
    }

    /// Shuts the client down. Later operations fail; pending writes remain
    /// in durable storage.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        let components = &self.inner.components;
        let remote_store = components.remote_store.clone();
        let shared_client_state = components.shared_client_state.clone();
        let lru_scheduler = components.lru_scheduler.clone();
        let persistence = components.persistence.clone();
        self.inner
            .queue
            .enqueue_and_initiate_shutdown(async move {
                remote_store.shutdown().await;
                shared_client_state.shutdown();
                lru_scheduler.stop();
                if let Err(err) = persistence.shutdown() {
                    log::warn!("Failed to release persistence: {err}");
                }
            })
            .await
    }
}

async fn await_receiver(receiver: WriteReceiver) -> FirestoreResult<()> {
    receiver
        .await
        .unwrap_or_else(|_| Err(cancelled("The client was terminated before the operation completed")))
}

/// Snapshots of one listen, ending with an error if the listen fails.
pub struct SnapshotStream {
    receiver: Pin<Box<Receiver<FirestoreResult<ViewSnapshot>>>>,
    listener_id: ListenerId,
    queue: AsyncQueue,
    event_manager: Weak<EventManager>,
}

impl SnapshotStream {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }
}

impl Stream for SnapshotStream {
    type Item = FirestoreResult<ViewSnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.as_mut().poll_next(cx)
    }
}

impl Drop for SnapshotStream {
    fn drop(&mut self) {
        let Some(event_manager) = self.event_manager.upgrade() else {
            return;
        };
        let listener_id = self.listener_id;
        self.queue.enqueue_and_forget(async move {
            if let Err(err) = event_manager.unlisten(listener_id).await {
                log::debug!("Failed to stop listen {listener_id:?}: {err}");
            }
        });
    }
}
