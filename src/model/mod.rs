mod database_id;
mod document;
mod document_key;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod user;

pub use database_id::DatabaseId;
pub use document::{Document, DocumentKind};
pub use document_key::DocumentKey;
pub use field_path::{FieldPath, IntoFieldPath};
pub use geo_point::GeoPoint;
pub use mutation::{FieldTransform, Mutation, MutationKind, MutationResult, Precondition, TransformOperation};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use user::User;

pub type TargetId = i32;
pub type BatchId = i32;
pub type ListenSequenceNumber = i64;

pub const BATCH_ID_UNKNOWN: BatchId = -1;
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;

/// Persistent ordered key set with structural sharing.
pub type DocumentKeySet = im::OrdSet<DocumentKey>;
/// Persistent ordered map from key to document.
pub type DocumentMap = im::OrdMap<DocumentKey, Document>;
