use futures::FutureExt;

use crate::error::{FirestoreError, FirestoreResult};
use crate::model::{BatchId, DocumentKeySet, MutationBatchResult, TargetId, User};
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_event::RemoteEvent;

#[cfg(target_arch = "wasm32")]
pub type RemoteStoreFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks from the remote store into the sync engine.
///
/// Every method runs on the async queue. Implementations may call back into
/// the remote store (e.g. to listen to limbo targets).
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot from the watch stream.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend refused to serve a target.
    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend rejected a batch with a permanent error.
    fn reject_failed_write(&self, batch_id: BatchId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Switches local state to `user`; the remote store restarts its streams around this call.
    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the backend last reported for the target, used for existence filters.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    fn apply_online_state_change(&self, online_state: OnlineState);
}
