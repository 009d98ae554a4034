//! Reconnecting wrapper around one backend stream.
//!
//! Callbacks from the transport (open result, messages, errors) are delivered
//! on the [`AsyncQueue`] and tagged with the close count that was current when
//! the underlying stream was opened. Anything arriving for an older stream is
//! dropped.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{failed_precondition, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::platform::runtime;
use crate::remote::connection::{Connection, StreamConnection, TokenProviderArc};
use crate::settings::StreamSettings;
use crate::util::{AsyncQueue, DelayedOperation, ExponentialBackoff, TimerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    /// Not started, or stopped cleanly. `start` opens a new stream immediately.
    Initial,
    /// Fetching credentials and opening the underlying stream.
    Auth,
    Open,
    /// Closed by an error; the next `start` goes through backoff.
    Error,
    /// Waiting for the backoff timer before reconnecting.
    Backoff,
}

/// Stream-specific behavior plugged into a [`PersistentStream`].
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamKind: Send + Sync + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    fn label(&self) -> &'static str;
    fn idle_timer(&self) -> TimerId;
    fn backoff_timer(&self) -> TimerId;

    async fn open(
        &self,
        connection: &dyn Connection,
        token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamConnection<Self::Request, Self::Response>>>;

    /// Resets per-connection state before a new stream is opened.
    fn on_start(&self) {}

    async fn on_open(&self);

    /// An error closes the stream with that error.
    async fn on_message(&self, message: Self::Response) -> FirestoreResult<()>;

    async fn on_close(&self, error: Option<FirestoreError>);
}

type StreamHandle<K> = Arc<dyn StreamConnection<<K as StreamKind>::Request, <K as StreamKind>::Response>>;

struct StreamState<K: StreamKind> {
    phase: PersistentStreamState,
    close_count: u64,
    stream: Option<StreamHandle<K>>,
    backoff: ExponentialBackoff,
    backoff_timer: Option<DelayedOperation>,
    idle_timer: Option<DelayedOperation>,
}

struct StreamInner<K: StreamKind> {
    kind: K,
    queue: AsyncQueue,
    connection: Arc<dyn Connection>,
    token_provider: TokenProviderArc,
    idle_timeout: Duration,
    state: StdMutex<StreamState<K>>,
}

pub struct PersistentStream<K: StreamKind> {
    inner: Arc<StreamInner<K>>,
}

impl<K: StreamKind> Clone for PersistentStream<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: StreamKind> PersistentStream<K> {
    pub fn new(
        kind: K,
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        settings: &StreamSettings,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                kind,
                queue,
                connection,
                token_provider,
                idle_timeout: settings.idle_timeout,
                state: StdMutex::new(StreamState {
                    phase: PersistentStreamState::Initial,
                    close_count: 0,
                    stream: None,
                    backoff: ExponentialBackoff::new(
                        settings.initial_backoff,
                        settings.backoff_factor,
                        settings.max_backoff,
                    ),
                    backoff_timer: None,
                    idle_timer: None,
                }),
            }),
        }
    }

    pub(crate) fn kind(&self) -> &K {
        &self.inner.kind
    }

    pub fn state(&self) -> PersistentStreamState {
        self.lock().phase
    }

    /// True from `start` until the stream is stopped or fails, including while backing off.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Auth | PersistentStreamState::Open | PersistentStreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == PersistentStreamState::Open
    }

    /// Opens the stream. After an error this waits for the backoff delay first.
    pub fn start(&self) {
        let close_count = {
            let mut state = self.lock();
            match state.phase {
                PersistentStreamState::Error => {
                    drop(state);
                    self.perform_backoff();
                    return;
                }
                PersistentStreamState::Initial => {}
                phase => {
                    log::debug!("{} stream already started ({phase:?})", self.inner.kind.label());
                    return;
                }
            }
            state.phase = PersistentStreamState::Auth;
            state.close_count
        };
        self.inner.kind.on_start();

        let stream = self.clone();
        runtime::spawn_detached(async move {
            let result = match stream.inner.token_provider.get_token().await {
                Ok(token) => stream.inner.kind.open(stream.inner.connection.as_ref(), token).await,
                Err(err) => Err(err),
            };
            let handler = stream.clone();
            stream.inner.queue.enqueue_and_forget(async move {
                handler.handle_open_result(close_count, result).await;
            });
        });
    }

    /// Closes the stream cleanly; a later `start` reconnects without backoff.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    /// Lets the next `start` skip the backoff delay after an error.
    pub fn inhibit_backoff(&self) {
        let mut state = self.lock();
        state.phase = PersistentStreamState::Initial;
        state.backoff.reset();
    }

    /// Closes the stream after the idle timeout unless it is used again first.
    pub fn mark_idle(&self) {
        let mut state = self.lock();
        if state.phase != PersistentStreamState::Open || state.idle_timer.is_some() {
            return;
        }
        let stream = self.clone();
        state.idle_timer = Some(self.inner.queue.enqueue_after_delay(
            self.inner.kind.idle_timer(),
            self.inner.idle_timeout,
            move || async move {
                stream.lock().idle_timer = None;
                if stream.is_open() {
                    log::debug!("Closing idle {} stream", stream.inner.kind.label());
                    stream.close(PersistentStreamState::Initial, None).await;
                }
            },
        ));
    }

    pub(crate) async fn send(&self, request: K::Request) -> FirestoreResult<()> {
        let stream = {
            let mut state = self.lock();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            state.stream.clone()
        };
        let stream = stream
            .ok_or_else(|| failed_precondition(format!("{} stream is not open", self.inner.kind.label())))?;
        stream.send(request).await
    }

    async fn handle_open_result(&self, close_count: u64, result: FirestoreResult<StreamHandle<K>>) {
        if self.lock().close_count != close_count {
            if let Ok(stream) = result {
                stream.close();
            }
            return;
        }
        match result {
            Ok(stream) => {
                {
                    let mut state = self.lock();
                    state.stream = Some(Arc::clone(&stream));
                    state.phase = PersistentStreamState::Open;
                }
                log::debug!("{} stream opened", self.inner.kind.label());
                self.spawn_reader(stream, close_count);
                self.inner.kind.on_open().await;
            }
            Err(err) => self.close(PersistentStreamState::Error, Some(err)).await,
        }
    }

    fn spawn_reader(&self, stream: StreamHandle<K>, close_count: u64) {
        let reader = self.clone();
        runtime::spawn_detached(async move {
            loop {
                let (message, done) = match stream.next().await {
                    Some(Ok(message)) => (Ok(message), false),
                    Some(Err(err)) => (Err(err), true),
                    None => (Err(unavailable("Stream closed")), true),
                };
                let handler = reader.clone();
                reader.inner.queue.enqueue_and_forget(async move {
                    handler.handle_incoming(close_count, message).await;
                });
                if done {
                    break;
                }
            }
        });
    }

    async fn handle_incoming(&self, close_count: u64, message: FirestoreResult<K::Response>) {
        if self.lock().close_count != close_count {
            return;
        }
        match message {
            Ok(message) => {
                self.lock().backoff.reset();
                if let Err(err) = self.inner.kind.on_message(message).await {
                    self.close(PersistentStreamState::Error, Some(err)).await;
                }
            }
            Err(err) => {
                log::debug!("{} stream closed: {err}", self.inner.kind.label());
                self.close(PersistentStreamState::Error, Some(err)).await;
            }
        }
    }

    async fn close(&self, final_state: PersistentStreamState, error: Option<FirestoreError>) {
        let stream = {
            let mut state = self.lock();
            if let Some(timer) = state.idle_timer.take() {
                timer.cancel();
            }
            if let Some(timer) = state.backoff_timer.take() {
                timer.cancel();
            }
            state.close_count += 1;

            match error.as_ref().map(|err| err.code) {
                _ if final_state != PersistentStreamState::Error => state.backoff.reset(),
                Some(FirestoreErrorCode::ResourceExhausted) => {
                    log::warn!(
                        "{} stream hit a resource limit, using maximum backoff",
                        self.inner.kind.label()
                    );
                    state.backoff.reset_to_max();
                }
                Some(FirestoreErrorCode::Unauthenticated) => self.inner.token_provider.invalidate_token(),
                _ => {}
            }
            state.phase = final_state;
            state.stream.take()
        };
        if let Some(stream) = stream {
            stream.close();
        }
        self.inner.kind.on_close(error).await;
    }

    fn perform_backoff(&self) {
        let mut state = self.lock();
        state.phase = PersistentStreamState::Backoff;
        let delay = state.backoff.next_delay();
        log::debug!("{} stream reconnecting in {delay:?}", self.inner.kind.label());
        let stream = self.clone();
        state.backoff_timer = Some(self.inner.queue.enqueue_after_delay(
            self.inner.kind.backoff_timer(),
            delay,
            move || async move {
                {
                    let mut state = stream.lock();
                    state.backoff_timer = None;
                    if state.phase != PersistentStreamState::Backoff {
                        return;
                    }
                    state.phase = PersistentStreamState::Initial;
                }
                stream.start();
            },
        ));
    }

    fn lock(&self) -> MutexGuard<'_, StreamState<K>> {
        self.inner.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::resource_exhausted;
    use crate::remote::connection::{InMemoryConnection, ListenRequest, NoopTokenProvider};
    use crate::remote::watch_change::{TargetChangeState, WatchChange, WatchTargetChange};

    #[derive(Debug, PartialEq)]
    enum Event {
        Open,
        Message(TargetChangeState),
        Close(Option<FirestoreErrorCode>),
    }

    struct RecordingKind {
        events: async_channel::Sender<Event>,
    }

    #[async_trait]
    impl StreamKind for RecordingKind {
        type Request = ListenRequest;
        type Response = WatchChange;

        fn label(&self) -> &'static str {
            "test"
        }

        fn idle_timer(&self) -> TimerId {
            TimerId::ListenStreamIdle
        }

        fn backoff_timer(&self) -> TimerId {
            TimerId::ListenStreamConnectionBackoff
        }

        async fn open(
            &self,
            connection: &dyn Connection,
            token: Option<String>,
        ) -> FirestoreResult<Arc<dyn StreamConnection<ListenRequest, WatchChange>>> {
            connection.open_listen_stream(token).await
        }

        async fn on_open(&self) {
            let _ = self.events.send(Event::Open).await;
        }

        async fn on_message(&self, message: WatchChange) -> FirestoreResult<()> {
            if let WatchChange::TargetChange(change) = message {
                let _ = self.events.send(Event::Message(change.state)).await;
            }
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) {
            let _ = self.events.send(Event::Close(error.map(|err| err.code))).await;
        }
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            initial_backoff: Duration::from_millis(5),
            backoff_factor: 1.5,
            max_backoff: Duration::from_millis(20),
            idle_timeout: Duration::from_millis(20),
        }
    }

    fn stream() -> (
        PersistentStream<RecordingKind>,
        crate::remote::connection::InMemoryServer,
        async_channel::Receiver<Event>,
    ) {
        let (connection, server) = InMemoryConnection::new();
        let (events, receiver) = async_channel::unbounded();
        let stream = PersistentStream::new(
            RecordingKind { events },
            AsyncQueue::new(),
            Arc::new(connection),
            Arc::new(NoopTokenProvider),
            &settings(),
        );
        (stream, server, receiver)
    }

    #[tokio::test]
    async fn delivers_messages_in_order() {
        let (stream, server, events) = stream();
        stream.start();
        assert_eq!(events.recv().await.unwrap(), Event::Open);
        assert!(stream.is_open());

        let backend = server.next_listen_stream().await.unwrap();
        for state in [TargetChangeState::Added, TargetChangeState::Current] {
            backend
                .send(WatchChange::TargetChange(WatchTargetChange::new(state, vec![2])))
                .await;
        }
        assert_eq!(events.recv().await.unwrap(), Event::Message(TargetChangeState::Added));
        assert_eq!(events.recv().await.unwrap(), Event::Message(TargetChangeState::Current));
    }

    #[tokio::test]
    async fn reconnects_after_an_error() {
        let (stream, server, events) = stream();
        server.fail_next_open(resource_exhausted("quota"));
        stream.start();
        assert_eq!(
            events.recv().await.unwrap(),
            Event::Close(Some(FirestoreErrorCode::ResourceExhausted))
        );
        assert_eq!(stream.state(), PersistentStreamState::Error);

        stream.start();
        assert_eq!(events.recv().await.unwrap(), Event::Open);
        assert!(server.next_listen_stream().await.is_some());
    }

    #[tokio::test]
    async fn stop_ignores_late_messages() {
        let (stream, server, events) = stream();
        stream.start();
        assert_eq!(events.recv().await.unwrap(), Event::Open);
        let backend = server.next_listen_stream().await.unwrap();

        stream.stop().await;
        assert_eq!(events.recv().await.unwrap(), Event::Close(None));
        assert_eq!(stream.state(), PersistentStreamState::Initial);
        assert!(!backend
            .send(WatchChange::TargetChange(WatchTargetChange::new(TargetChangeState::Added, vec![2])))
            .await);
        assert!(backend.recv().await.is_none());
    }

    #[tokio::test]
    async fn idle_stream_closes() {
        let (stream, _server, events) = stream();
        stream.start();
        assert_eq!(events.recv().await.unwrap(), Event::Open);
        stream.mark_idle();
        assert_eq!(events.recv().await.unwrap(), Event::Close(None));
        assert!(!stream.is_started());
    }
}
