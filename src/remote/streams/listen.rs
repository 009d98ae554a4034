use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{FirestoreError, FirestoreResult};
use crate::local::TargetData;
use crate::model::{SnapshotVersion, TargetId};
use crate::remote::connection::{Connection, ListenRequest, StreamConnection, TokenProviderArc};
use crate::remote::persistent_stream::{PersistentStream, StreamKind};
use crate::remote::watch_change::WatchChange;
use crate::settings::StreamSettings;
use crate::util::{AsyncQueue, TimerId};

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait ListenStreamListener: Send + Sync + 'static {
    async fn on_open(&self);

    /// `snapshot_version` is non-min only for a global target change marking a consistent snapshot.
    async fn on_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion);

    async fn on_close(&self, error: Option<FirestoreError>);
}

pub struct ListenKind {
    listener: Arc<dyn ListenStreamListener>,
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl StreamKind for ListenKind {
    type Request = ListenRequest;
    type Response = WatchChange;

    fn label(&self) -> &'static str {
        "listen"
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
        self.listener.on_open().await;
    }

    async fn on_message(&self, change: WatchChange) -> FirestoreResult<()> {
        let snapshot_version = change.snapshot_version();
        self.listener.on_watch_change(change, snapshot_version).await;
        Ok(())
    }

    async fn on_close(&self, error: Option<FirestoreError>) {
        self.listener.on_close(error).await;
    }
}

/// The watch stream: adds and removes targets and reports [`WatchChange`]s.
pub type ListenStream = PersistentStream<ListenKind>;

impl PersistentStream<ListenKind> {
    pub fn listen(
        listener: Arc<dyn ListenStreamListener>,
        queue: AsyncQueue,
        connection: Arc<dyn Connection>,
        token_provider: TokenProviderArc,
        settings: &StreamSettings,
    ) -> Self {
        PersistentStream::new(ListenKind { listener }, queue, connection, token_provider, settings)
    }

    /// Starts watching a target, resuming from its resume token when it has one.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let read_time = if target_data.resume_token.is_empty() {
            target_data.snapshot_version
        } else {
            SnapshotVersion::min()
        };
        self.send(ListenRequest::AddTarget {
            target_id: target_data.target_id,
            target: target_data.target.clone(),
            resume_token: target_data.resume_token.clone(),
            read_time,
        })
        .await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.send(ListenRequest::RemoveTarget { target_id }).await
    }
}
