//! Last known server state of every cached document.
//!
//! Rows are keyed by collection so collection queries read a single prefix.
//! A secondary index ordered by read time serves "changed since" scans.

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::kv_store::{KeyPart, KeyRange};
use crate::local::local_serializer::{
    decode, encode, global_key, path_part, read_time_parts, remote_document_key, remote_document_read_time_key,
    DbRemoteDocument, DbRemoteDocumentGlobal, GLOBALS, REMOTE_DOCUMENTS, REMOTE_DOCUMENT_GLOBAL_KEY,
    REMOTE_DOCUMENT_READ_TIME,
};
use crate::local::persistence::PersistenceTransaction;
use crate::model::{Document, DocumentKey, DocumentKeySet, DocumentMap, SnapshotVersion};

#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    pub fn new() -> Self {
        Self
    }

    /// Adds or replaces `document`, stamping it with the version it was read at.
    pub fn set(
        &self,
        txn: &mut PersistenceTransaction,
        document: &Document,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let key = document.key();
        let previous_size = self.remove_row(txn, key)?;
        let row = DbRemoteDocument {
            document: document.clone(),
            read_time,
        };
        let bytes = encode(&row)?;
        let size = bytes.len() as i64;
        txn.put_raw(REMOTE_DOCUMENTS, remote_document_key(key), bytes)?;
        txn.put_raw(
            REMOTE_DOCUMENT_READ_TIME,
            remote_document_read_time_key(key, read_time),
            Vec::new(),
        )?;
        self.adjust_byte_size(txn, size - previous_size)
    }

    pub fn remove(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<()> {
        let removed = self.remove_row(txn, key)?;
        self.adjust_byte_size(txn, -removed)
    }

    pub fn get(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        Ok(txn
            .get::<DbRemoteDocument>(REMOTE_DOCUMENTS, &remote_document_key(key))?
            .map(|row| row.document))
    }

    /// Cached entries for `keys`; keys without a row are left out.
    pub fn get_all(&self, txn: &PersistenceTransaction, keys: &DocumentKeySet) -> FirestoreResult<DocumentMap> {
        let mut documents = DocumentMap::new();
        for key in keys {
            if let Some(document) = self.get(txn, key)? {
                documents.insert(key.clone(), document);
            }
        }
        Ok(documents)
    }

    /// Found documents matching `query` whose read time is strictly after `since`.
    pub fn get_matching(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        let mut documents = DocumentMap::new();
        if query.is_collection_group_query() {
            for (_, row) in txn.scan::<DbRemoteDocument>(REMOTE_DOCUMENTS, &KeyRange::all())? {
                if row.read_time > since && query.matches(&row.document) {
                    documents.insert(row.document.key().clone(), row.document);
                }
            }
            return Ok(documents);
        }

        let collection = vec![path_part(query.path())];
        if since.is_min() {
            for (_, row) in txn.scan::<DbRemoteDocument>(REMOTE_DOCUMENTS, &KeyRange::prefix(collection))? {
                if query.matches(&row.document) {
                    documents.insert(row.document.key().clone(), row.document);
                }
            }
            return Ok(documents);
        }

        let [seconds, nanos] = read_time_parts(since);
        let start = vec![path_part(query.path()), seconds, nanos];
        for (index_key, _) in txn.scan_raw(REMOTE_DOCUMENT_READ_TIME, &KeyRange::prefix_from(collection, start))? {
            let Some(KeyPart::Text(id)) = index_key.get(3) else {
                continue;
            };
            let key = DocumentKey::from_path(query.path().child([id.as_str()]))?;
            let Some(row) = txn.get::<DbRemoteDocument>(REMOTE_DOCUMENTS, &remote_document_key(&key))? else {
                continue;
            };
            if row.read_time > since && query.matches(&row.document) {
                documents.insert(key, row.document);
            }
        }
        Ok(documents)
    }

    /// Approximate size of all cached rows, used to decide when to collect garbage.
    pub fn byte_size(&self, txn: &PersistenceTransaction) -> FirestoreResult<i64> {
        Ok(txn
            .get::<DbRemoteDocumentGlobal>(GLOBALS, &global_key(REMOTE_DOCUMENT_GLOBAL_KEY))?
            .map(|global| global.byte_size)
            .unwrap_or(0))
    }

    fn remove_row(&self, txn: &mut PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<i64> {
        let row_key = remote_document_key(key);
        let Some(bytes) = txn.get_raw(REMOTE_DOCUMENTS, &row_key)? else {
            return Ok(0);
        };
        let previous: DbRemoteDocument = decode(&bytes)?;
        txn.delete(REMOTE_DOCUMENTS, &row_key)?;
        txn.delete(
            REMOTE_DOCUMENT_READ_TIME,
            &remote_document_read_time_key(key, previous.read_time),
        )?;
        Ok(bytes.len() as i64)
    }

    fn adjust_byte_size(&self, txn: &mut PersistenceTransaction, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut global = txn
            .get::<DbRemoteDocumentGlobal>(GLOBALS, &global_key(REMOTE_DOCUMENT_GLOBAL_KEY))?
            .unwrap_or_default();
        global.byte_size = (global.byte_size + delta).max(0);
        txn.put(GLOBALS, global_key(REMOTE_DOCUMENT_GLOBAL_KEY), &global)
    }
}
