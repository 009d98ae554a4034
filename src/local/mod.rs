//! Durable client-side state: the mutation queue, the document and target
//! caches, and the local store that coordinates them.

pub mod kv_store;
mod local_documents_view;
mod local_serializer;
mod local_store;
mod local_view_changes;
mod lru_garbage_collector;
mod mutation_queue;
mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod shared_client_state;
mod target_cache;
mod target_data;

pub use kv_store::{KvStore, KvTransaction, MemoryKvStore};
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalWriteResult, QueryResult, UserChangeResult};
pub use local_view_changes::LocalViewChanges;
pub use lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults, LruScheduler};
pub use mutation_queue::MutationQueue;
pub use persistence::{
    ignore_if_primary_lease_loss, Persistence, PersistenceTransaction, PrimaryStateListener, TransactionMode,
};
pub use query_engine::QueryEngine;
pub use reference_set::ReferenceSet;
pub use remote_document_cache::RemoteDocumentCache;
pub use shared_client_state::{
    MemorySharedChannel, MutationBatchState, QueryTargetState, SharedChannel, SharedChannelEvent, SharedClientState,
    SharedClientStateSyncer,
};
pub use target_cache::TargetCache;
pub use target_data::{TargetData, TargetPurpose};
