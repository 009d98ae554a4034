pub mod connection;
mod online_state_tracker;
mod persistent_stream;
mod remote_event;
mod remote_store;
mod remote_syncer;
pub mod streams;
mod watch_change;
mod watch_change_aggregator;

pub use connection::{
    Connection, InMemoryConnection, InMemoryServer, ListenRequest, NoopTokenProvider, TokenProvider, TokenProviderArc,
    WriteRequest, WriteResponse,
};
pub use online_state_tracker::{OnlineState, OnlineStateHandler, OnlineStateTracker};
pub use persistent_stream::{PersistentStream, PersistentStreamState, StreamKind};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use watch_change::{
    DocumentChange, DocumentDelete, DocumentRemove, ExistenceFilterChange, TargetChangeState, WatchChange,
    WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
