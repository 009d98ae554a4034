//! Transport seam between the remote store and a backend.
//!
//! Requests and responses are typed; encoding them for a real wire protocol
//! is the job of a [`Connection`] implementation. [`InMemoryConnection`] is a
//! loopback backend whose server side is driven by tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::core::Target;
use crate::error::{unavailable, FirestoreError, FirestoreResult};
use crate::model::{Mutation, MutationResult, SnapshotVersion, TargetId};
use crate::remote::watch_change::WatchChange;

#[derive(Debug, Clone, PartialEq)]
pub enum ListenRequest {
    AddTarget {
        target_id: TargetId,
        target: Target,
        /// Empty for a fresh listen.
        resume_token: Vec<u8>,
        /// Used by the backend only when `resume_token` is empty.
        read_time: SnapshotVersion,
    },
    RemoveTarget {
        target_id: TargetId,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteRequest {
    /// First request on a write stream; the backend answers with a stream token.
    Handshake,
    Write {
        stream_token: Vec<u8>,
        mutations: Vec<Mutation>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteResponse {
    pub stream_token: Vec<u8>,
    pub commit_version: SnapshotVersion,
    /// One result per mutation of the acknowledged batch; empty for the handshake.
    pub mutation_results: Vec<MutationResult>,
}

impl WriteResponse {
    pub fn handshake(stream_token: Vec<u8>) -> Self {
        Self {
            stream_token,
            commit_version: SnapshotVersion::min(),
            mutation_results: Vec::new(),
        }
    }
}

/// One open bidirectional stream.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait StreamConnection<Req, Resp>: Send + Sync + 'static
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn send(&self, request: Req) -> FirestoreResult<()>;

    /// Next message from the backend. `None` once the stream is closed.
    async fn next(&self) -> Option<FirestoreResult<Resp>>;

    fn close(&self);
}

pub type ListenConnection = Arc<dyn StreamConnection<ListenRequest, WatchChange>>;
pub type WriteConnection = Arc<dyn StreamConnection<WriteRequest, WriteResponse>>;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Connection: Send + Sync + 'static {
    async fn open_listen_stream(&self, token: Option<String>) -> FirestoreResult<ListenConnection>;
    async fn open_write_stream(&self, token: Option<String>) -> FirestoreResult<WriteConnection>;
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;

    /// Forces the next `get_token` to fetch a fresh token.
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;

struct ChannelStream<Req, Resp> {
    outbound: Sender<Req>,
    inbound: Receiver<FirestoreResult<Resp>>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl<Req, Resp> StreamConnection<Req, Resp> for ChannelStream<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn send(&self, request: Req) -> FirestoreResult<()> {
        self.outbound
            .send(request)
            .await
            .map_err(|_| unavailable("Stream closed by the backend"))
    }

    async fn next(&self) -> Option<FirestoreResult<Resp>> {
        self.inbound.recv().await.ok()
    }

    fn close(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

/// Backend end of an in-memory stream.
pub struct ServerStream<Req, Resp> {
    requests: Receiver<Req>,
    responses: Sender<FirestoreResult<Resp>>,
    token: Option<String>,
}

impl<Req, Resp> ServerStream<Req, Resp> {
    /// Next request from the client, `None` once the client closed the stream.
    pub async fn recv(&self) -> Option<Req> {
        self.requests.recv().await.ok()
    }

    pub fn try_recv(&self) -> Option<Req> {
        self.requests.try_recv().ok()
    }

    /// Returns `false` when the client already closed the stream.
    pub async fn send(&self, response: Resp) -> bool {
        self.responses.send(Ok(response)).await.is_ok()
    }

    /// Terminates the stream with `error`.
    pub async fn fail(&self, error: FirestoreError) {
        let _ = self.responses.send(Err(error)).await;
        self.responses.close();
    }

    pub fn close(&self) {
        self.responses.close();
        self.requests.close();
    }

    pub fn is_closed(&self) -> bool {
        self.requests.is_closed()
    }

    /// Token the client presented when it opened the stream.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }
}

pub type ServerListenStream = ServerStream<ListenRequest, WatchChange>;
pub type ServerWriteStream = ServerStream<WriteRequest, WriteResponse>;

#[derive(Default)]
struct OpenFailures {
    pending: VecDeque<FirestoreError>,
}

/// Loopback connection; every opened stream is handed to the paired [`InMemoryServer`].
#[derive(Clone)]
pub struct InMemoryConnection {
    listen_streams: Sender<ServerListenStream>,
    write_streams: Sender<ServerWriteStream>,
    failures: Arc<StdMutex<OpenFailures>>,
}

/// Server side of an [`InMemoryConnection`].
#[derive(Clone)]
pub struct InMemoryServer {
    listen_streams: Receiver<ServerListenStream>,
    write_streams: Receiver<ServerWriteStream>,
    failures: Arc<StdMutex<OpenFailures>>,
}

impl InMemoryConnection {
    pub fn new() -> (Self, InMemoryServer) {
        let (listen_tx, listen_rx) = async_channel::unbounded();
        let (write_tx, write_rx) = async_channel::unbounded();
        let failures = Arc::new(StdMutex::new(OpenFailures::default()));
        (
            Self {
                listen_streams: listen_tx,
                write_streams: write_tx,
                failures: failures.clone(),
            },
            InMemoryServer {
                listen_streams: listen_rx,
                write_streams: write_rx,
                failures,
            },
        )
    }

    fn take_failure(&self) -> Option<FirestoreError> {
        let mut failures = self.failures.lock().unwrap_or_else(|poison| poison.into_inner());
        failures.pending.pop_front()
    }

    async fn open<Req, Resp>(
        &self,
        registry: &Sender<ServerStream<Req, Resp>>,
        token: Option<String>,
    ) -> FirestoreResult<Arc<ChannelStream<Req, Resp>>>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        if let Some(error) = self.take_failure() {
            return Err(error);
        }
        let (request_tx, request_rx) = async_channel::unbounded();
        let (response_tx, response_rx) = async_channel::unbounded();
        registry
            .send(ServerStream {
                requests: request_rx,
                responses: response_tx,
                token,
            })
            .await
            .map_err(|_| unavailable("In-memory backend is gone"))?;
        Ok(Arc::new(ChannelStream {
            outbound: request_tx,
            inbound: response_rx,
        }))
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl Connection for InMemoryConnection {
    async fn open_listen_stream(&self, token: Option<String>) -> FirestoreResult<ListenConnection> {
        let stream = self.open(&self.listen_streams, token).await?;
        Ok(stream as ListenConnection)
    }

    async fn open_write_stream(&self, token: Option<String>) -> FirestoreResult<WriteConnection> {
        let stream = self.open(&self.write_streams, token).await?;
        Ok(stream as WriteConnection)
    }
}

impl InMemoryServer {
    pub async fn next_listen_stream(&self) -> Option<ServerListenStream> {
        self.listen_streams.recv().await.ok()
    }

    pub async fn next_write_stream(&self) -> Option<ServerWriteStream> {
        self.write_streams.recv().await.ok()
    }

    /// Makes the next stream open attempt fail with `error`.
    pub fn fail_next_open(&self, error: FirestoreError) {
        let mut failures = self.failures.lock().unwrap_or_else(|poison| poison.into_inner());
        failures.pending.push_back(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FirestoreErrorCode;

    #[tokio::test]
    async fn loopback_delivers_both_directions() {
        let (connection, server) = InMemoryConnection::new();
        let client = connection
            .open_write_stream(Some("token".to_string()))
            .await
            .unwrap();
        let backend = server.next_write_stream().await.unwrap();
        assert_eq!(backend.token(), Some("token"));

        client.send(WriteRequest::Handshake).await.unwrap();
        assert_eq!(backend.recv().await, Some(WriteRequest::Handshake));

        assert!(backend.send(WriteResponse::handshake(b"s1".to_vec())).await);
        let response = client.next().await.unwrap().unwrap();
        assert_eq!(response.stream_token, b"s1".to_vec());

        client.close();
        assert_eq!(backend.recv().await, None);
    }

    #[tokio::test]
    async fn scripted_open_failure() {
        let (connection, server) = InMemoryConnection::new();
        server.fail_next_open(unavailable("offline"));
        let err = connection.open_listen_stream(None).await.err().unwrap();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
        assert!(connection.open_listen_stream(None).await.is_ok());
    }

    #[tokio::test]
    async fn server_failure_ends_the_stream() {
        let (connection, server) = InMemoryConnection::new();
        let client = connection.open_listen_stream(None).await.unwrap();
        let backend = server.next_listen_stream().await.unwrap();
        backend.fail(unavailable("gone")).await;
        assert!(client.next().await.unwrap().is_err());
        assert!(client.next().await.is_none());
    }
}
