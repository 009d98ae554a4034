use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use async_trait::async_trait;

use crate::error::{internal_error, FirestoreError, FirestoreResult};
use crate::model::{Mutation, MutationResult, SnapshotVersion};
use crate::remote::connection::{Connection, StreamConnection, TokenProviderArc, WriteRequest, WriteResponse};
use crate::remote::persistent_stream::{PersistentStream, StreamKind};
use crate::settings::StreamSettings;
use crate::util::{AsyncQueue, TimerId};

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait WriteStreamListener: Send + Sync + 'static {
    async fn on_open(&self);

    async fn on_handshake_complete(&self);

    /// The backend committed the oldest in-flight batch.
    async fn on_mutation_result(&self, commit_version: SnapshotVersion, results: Vec<MutationResult>);

    async fn on_close(&self, error: Option<FirestoreError>);
}

#[derive(Default)]
struct HandshakeState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

pub struct WriteKind {
    listener: Arc<dyn WriteStreamListener>,
    state: StdMutex<HandshakeState>,
}

impl WriteKind {
    fn lock(&self) -> MutexGuard<'_, HandshakeState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamKind for WriteKind {
    type Request = WriteRequest;
    type Response = WriteResponse;

    fn label(&self) -> &'static str {
        "write"
    }

    fn idle_timer(&self) -> TimerId {
        TimerId::WriteStreamIdle
    }

    fn backoff_timer(&self) -> TimerId {
        TimerId::WriteStreamConnectionBackoff
    }

    async fn open(
        &self,
        connection: &dyn Connection,
        token: Option<String>,
    ) -> FirestoreResult<Arc<dyn StreamConnection<WriteRequest, WriteResponse>>> {
        connection.open_write_stream(token).await
    }

    fn on_start(&self) {
        self.lock().handshake_complete = false;
    }

    async fn on_open(&self) {
        self.listener.on_open().await;
    }

    async fn on_message(&self, response: WriteResponse) -> FirestoreResult<()> {
        let was_complete = {
            let mut state = self.lock();
            state.last_stream_token = response.stream_token;
            std::mem::replace(&mut state.handshake_complete, true)
        };
        if !was_complete {
            if !response.mutation_results.is_empty() {
                return Err(internal_error("Got mutation results for the write handshake"));
            }
            self.listener.on_handshake_complete().await;
        } else {
            self.listener
                .on_mutation_result(response.commit_version, response.mutation_results)
                .await;
        }
        Ok(())
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        self.listener.on_close(error).await;
    }
}

/// The write stream: a handshake, then one request per mutation batch, each
/// acknowledged in order with a fresh stream token.
pub type WriteStream = PersistentStream<WriteKind>;

impl PersistentStream<WriteKind> {
    pub fn write(
        listener: Arc<dyn WriteStreamListener>,
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        settings: &StreamSettings,
    ) -> Self {
        let kind = WriteKind {
            listener,
            state: StdMutex::new(HandshakeState::default()),
        };
        PersistentStream::new(kind, queue, connection, token_provider, settings)
    }

    pub fn handshake_complete(&self) -> bool {
        self.kind().lock().handshake_complete
    }

    /// Token from the most recent response, persisted so a restarted client can resume.
    pub fn last_stream_token(&self) -> Vec<u8> {
        self.kind().lock().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        self.kind().lock().last_stream_token = token;
    }

    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        self.send(WriteRequest::Handshake).await
    }

    pub async fn write_mutations(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        if !self.handshake_complete() {
            return Err(internal_error("Cannot write mutations before the handshake completes"));
        }
        let stream_token = self.last_stream_token();
        self.send(WriteRequest::Write {
            stream_token,
            mutations,
        })
        .await
    }
}
