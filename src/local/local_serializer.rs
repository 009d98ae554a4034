//! Row layouts and key encodings for the local stores.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::local::kv_store::{KeyPart, KvKey};
use crate::model::{
    BatchId, Document, DocumentKey, ListenSequenceNumber, Mutation, ResourcePath, SnapshotVersion,
    TargetId, Timestamp,
};

pub(crate) const MUTATION_QUEUES: &str = "mutation_queues";
pub(crate) const MUTATIONS: &str = "mutations";
pub(crate) const DOCUMENT_MUTATIONS: &str = "document_mutations";
pub(crate) const REMOTE_DOCUMENTS: &str = "remote_documents";
pub(crate) const REMOTE_DOCUMENT_READ_TIME: &str = "remote_document_read_time";
pub(crate) const TARGETS: &str = "targets";
pub(crate) const TARGET_CANONICAL_IDS: &str = "target_canonical_ids";
pub(crate) const TARGET_DOCUMENTS: &str = "target_documents";
pub(crate) const DOCUMENT_TARGETS: &str = "document_targets";
pub(crate) const CLIENT_METADATA: &str = "client_metadata";
pub(crate) const GLOBALS: &str = "globals";

pub(crate) const TARGET_GLOBAL_KEY: &str = "target_global";
pub(crate) const REMOTE_DOCUMENT_GLOBAL_KEY: &str = "remote_document_global";
pub(crate) const MUTATION_GLOBAL_KEY: &str = "mutation_global";
pub(crate) const PRIMARY_CLIENT_KEY: &str = "owner";

/// Target id of the sentinel rows that record when a document was last touched.
pub(crate) const SENTINEL_TARGET_ID: TargetId = 0;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DbMutationQueue {
    pub last_acknowledged_batch_id: BatchId,
    pub last_stream_token: Vec<u8>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct DbMutationBatch {
    pub user_id: String,
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DbMutationGlobal {
    pub next_batch_id: BatchId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct DbRemoteDocument {
    pub document: Document,
    pub read_time: SnapshotVersion,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DbRemoteDocumentGlobal {
    pub byte_size: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DbTargetDocument {
    /// Set on sentinel rows only.
    pub sequence_number: Option<ListenSequenceNumber>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct DbTargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct DbClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct DbPrimaryClient {
    pub owner_id: String,
    pub allow_tab_synchronization: bool,
    pub lease_timestamp_ms: i64,
}

pub(crate) fn encode<T: Serialize>(value: &T) -> FirestoreResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|err| FirestoreError::new(FirestoreErrorCode::Internal, format!("Failed to encode row: {err}")))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> FirestoreResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|err| FirestoreError::new(FirestoreErrorCode::DataLoss, format!("Corrupt row: {err}")))
}

pub(crate) fn path_part(path: &ResourcePath) -> KeyPart {
    KeyPart::Text(path.canonical_string())
}

pub(crate) fn global_key(name: &str) -> KvKey {
    vec![KeyPart::from(name)]
}

pub(crate) fn remote_document_key(key: &DocumentKey) -> KvKey {
    vec![path_part(&key.collection_path()), KeyPart::from(key.id())]
}

pub(crate) fn read_time_parts(version: SnapshotVersion) -> [KeyPart; 2] {
    let ts = version.timestamp();
    [KeyPart::Int(ts.seconds), KeyPart::Int(i64::from(ts.nanos))]
}

pub(crate) fn remote_document_read_time_key(key: &DocumentKey, read_time: SnapshotVersion) -> KvKey {
    let [seconds, nanos] = read_time_parts(read_time);
    vec![path_part(&key.collection_path()), seconds, nanos, KeyPart::from(key.id())]
}

pub(crate) fn mutation_key(user_id: &str, batch_id: BatchId) -> KvKey {
    vec![KeyPart::from(user_id), KeyPart::from(batch_id)]
}

pub(crate) fn document_mutation_key(user_id: &str, key: &DocumentKey, batch_id: BatchId) -> KvKey {
    vec![KeyPart::from(user_id), path_part(key.path()), KeyPart::from(batch_id)]
}

pub(crate) fn target_key(target_id: TargetId) -> KvKey {
    vec![KeyPart::from(target_id)]
}

pub(crate) fn target_document_key(target_id: TargetId, key: &DocumentKey) -> KvKey {
    vec![KeyPart::from(target_id), path_part(key.path())]
}

pub(crate) fn document_target_key(key: &DocumentKey, target_id: TargetId) -> KvKey {
    vec![path_part(key.path()), KeyPart::from(target_id)]
}

pub(crate) fn document_key_from_part(part: Option<&KeyPart>) -> FirestoreResult<DocumentKey> {
    match part {
        Some(KeyPart::Text(path)) => DocumentKey::from_string(path),
        _ => Err(FirestoreError::new(
            FirestoreErrorCode::DataLoss,
            "Expected a document path in index key",
        )),
    }
}

pub(crate) fn int_from_part(part: Option<&KeyPart>) -> FirestoreResult<i64> {
    match part {
        Some(KeyPart::Int(value)) => Ok(*value),
        _ => Err(FirestoreError::new(
            FirestoreErrorCode::DataLoss,
            "Expected an integer component in index key",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_rows_group_by_collection() {
        let a = DocumentKey::from_string("rooms/a").unwrap();
        let nested = DocumentKey::from_string("rooms/a/messages/1").unwrap();
        assert_eq!(remote_document_key(&a)[0], KeyPart::from("rooms"));
        assert_eq!(remote_document_key(&nested)[0], KeyPart::from("rooms/a/messages"));
    }

    #[test]
    fn read_time_keys_sort_by_version() {
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let early = remote_document_read_time_key(&key, SnapshotVersion::new(Timestamp::new(1, 5)));
        let late = remote_document_read_time_key(&key, SnapshotVersion::new(Timestamp::new(2, 0)));
        assert!(early < late);
    }

    #[test]
    fn decoding_garbage_reports_data_loss() {
        let err = decode::<DbTargetGlobal>(b"not json").unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::DataLoss);
    }
}
