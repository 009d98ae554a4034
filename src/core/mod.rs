//! Query model, views and the engine that keeps them in sync.

pub mod document_set;
pub mod event_manager;
pub mod firestore_client;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod view;
pub mod view_snapshot;

pub use document_set::DocumentSet;
pub use event_manager::{EventManager, ListenOptions, ListenerId};
pub use firestore_client::{FirestoreClient, FirestoreClientBuilder, SnapshotStream};
pub use query::{Bound, Direction, FieldFilter, FilterOperator, LimitType, OrderBy, Query};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteReceiver};
pub use target::Target;
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, ViewSnapshot};
