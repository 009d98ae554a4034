//! Remote documents with the user's pending mutations applied on top.

use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::mutation_queue::MutationQueue;
use crate::local::persistence::PersistenceTransaction;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::model::{Document, DocumentKey, DocumentKeySet, DocumentMap, MutationBatch, SnapshotVersion};

#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
}

impl LocalDocumentsView {
    pub fn new(mutation_queue: MutationQueue) -> Self {
        Self {
            remote_documents: RemoteDocumentCache::new(),
            mutation_queue,
        }
    }

    /// Local view of `key`; a missing entry reads as a document that does not exist.
    pub fn get_document(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<Document> {
        let batches = self.mutation_queue.all_batches_affecting_key(txn, key)?;
        let remote = self.remote_documents.get(txn, key)?;
        Ok(apply_batches(key, remote, &batches))
    }

    pub fn get_documents(&self, txn: &PersistenceTransaction, keys: &DocumentKeySet) -> FirestoreResult<DocumentMap> {
        let remote = self.remote_documents.get_all(txn, keys)?;
        self.get_local_view_of_documents(txn, &remote, keys)
    }

    /// Applies pending batches to `base` for every key in `keys`.
    pub fn get_local_view_of_documents(
        &self,
        txn: &PersistenceTransaction,
        base: &DocumentMap,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        let batches = self.mutation_queue.all_batches_affecting_keys(txn, keys)?;
        Ok(keys
            .iter()
            .map(|key| (key.clone(), apply_batches(key, base.get(key).cloned(), &batches)))
            .collect())
    }

    /// Found documents matching `query` in the local view, considering only
    /// remote entries read after `since`.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        since: SnapshotVersion,
    ) -> FirestoreResult<DocumentMap> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key)?;
            let mut results = DocumentMap::new();
            if document.is_found_document() {
                results.insert(key, document);
            }
            return Ok(results);
        }

        let mut results = self.remote_documents.get_matching(txn, query, since)?;
        for batch in self.mutation_queue.all_batches_affecting_query(txn, query)? {
            for mutation in &batch.mutations {
                let key = mutation.key();
                if !query.matches_path_and_collection_group(key) {
                    continue;
                }
                let base = match results.get(key) {
                    Some(document) => Some(document.clone()),
                    None => self.remote_documents.get(txn, key)?,
                };
                match mutation.apply_to_local_view(base, batch.local_write_time) {
                    Some(document) => {
                        results.insert(key.clone(), document);
                    }
                    None => {
                        results.remove(key);
                    }
                }
            }
        }
        Ok(results
            .into_iter()
            .filter(|(_, document)| query.matches(document))
            .collect())
    }
}

fn apply_batches(key: &DocumentKey, base: Option<Document>, batches: &[MutationBatch]) -> Document {
    batches
        .iter()
        .fold(base, |document, batch| batch.apply_to_local_view(key, document))
        .unwrap_or_else(|| Document::no_document(key.clone(), SnapshotVersion::min()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::query::FilterOperator;
    use crate::local::kv_store::MemoryKvStore;
    use crate::local::persistence::{Persistence, TransactionMode};
    use crate::model::{FieldPath, Mutation, ResourcePath, Timestamp, User};
    use crate::settings::SyncSettings;
    use crate::value::{FirestoreValue, MapValue};
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(n: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        map
    }

    fn setup() -> (Arc<Persistence>, LocalDocumentsView, MutationQueue) {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", &SyncSettings::default());
        persistence.start().unwrap();
        let queue = MutationQueue::new(&User::unauthenticated());
        (persistence, LocalDocumentsView::new(queue.clone()), queue)
    }

    #[test]
    fn overlays_pending_writes_on_remote_documents() {
        let (persistence, view, queue) = setup();
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        let (a, missing) = persistence
            .run_transaction("overlay", TransactionMode::ReadWrite, |txn| {
                RemoteDocumentCache::new().set(txn, &Document::found(key("rooms/a"), version, data(1)), version)?;
                queue.add_batch(
                    txn,
                    Timestamp::now(),
                    vec![Mutation::patch(key("rooms/a"), data(2), vec![FieldPath::from_dot_separated("n")?])],
                )?;
                Ok((view.get_document(txn, &key("rooms/a"))?, view.get_document(txn, &key("rooms/z"))?))
            })
            .unwrap();
        assert!(a.has_local_mutations());
        assert_eq!(a.version(), version);
        assert_eq!(
            a.field(&FieldPath::from_dot_separated("n").unwrap()),
            Some(&FirestoreValue::from_integer(2))
        );
        assert!(missing.is_no_document());
        assert!(missing.version().is_min());
    }

    #[test]
    fn query_sees_local_inserts_and_hides_local_deletes() {
        let (persistence, view, queue) = setup();
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        let query = Query::at_path(ResourcePath::from_string("rooms").unwrap()).filter(
            FieldPath::from_dot_separated("n").unwrap(),
            FilterOperator::GreaterThanOrEqual,
            FirestoreValue::from_integer(1),
        );
        let results = persistence
            .run_transaction("query", TransactionMode::ReadWrite, |txn| {
                let cache = RemoteDocumentCache::new();
                cache.set(txn, &Document::found(key("rooms/a"), version, data(1)), version)?;
                cache.set(txn, &Document::found(key("rooms/b"), version, data(0)), version)?;
                queue.add_batch(
                    txn,
                    Timestamp::now(),
                    vec![
                        Mutation::delete(key("rooms/a")),
                        Mutation::set(key("rooms/c"), data(3)),
                        Mutation::patch(key("rooms/b"), data(5), vec![FieldPath::from_dot_separated("n")?]),
                        Mutation::set(key("other/d"), data(3)),
                    ],
                )?;
                view.get_documents_matching_query(txn, &query, SnapshotVersion::min())
            })
            .unwrap();
        let keys: Vec<String> = results.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["rooms/b", "rooms/c"]);
    }
}
