//! Durable per-user queue of mutation batches awaiting acknowledgement.

use std::collections::BTreeSet;

use crate::core::Query;
use crate::error::{internal_error, FirestoreResult};
use crate::local::kv_store::{KeyPart, KeyRange};
use crate::local::local_serializer::{
    document_mutation_key, global_key, int_from_part, mutation_key, path_part, DbMutationBatch,
    DbMutationGlobal, DbMutationQueue, DOCUMENT_MUTATIONS, GLOBALS, MUTATIONS, MUTATION_GLOBAL_KEY,
    MUTATION_QUEUES,
};
use crate::local::lru_garbage_collector::write_sentinel_key;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{
    BatchId, DocumentKey, DocumentKeySet, Mutation, MutationBatch, Timestamp, User, BATCH_ID_UNKNOWN,
};

#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_id: String,
}

impl MutationQueue {
    pub fn new(user: &User) -> Self {
        Self {
            user_id: user.key().to_string(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Assigns the next batch id and persists the batch with its per-document index rows.
    pub fn add_batch(
        &self,
        txn: &mut PersistenceTransaction,
        local_write_time: Timestamp,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let mut global: DbMutationGlobal = txn
            .get(GLOBALS, &global_key(MUTATION_GLOBAL_KEY))?
            .unwrap_or_default();
        let batch_id = global.next_batch_id.max(1);
        global.next_batch_id = batch_id + 1;
        txn.put(GLOBALS, global_key(MUTATION_GLOBAL_KEY), &global)?;

        let queue = self.queue_metadata(txn)?;
        txn.put(MUTATION_QUEUES, self.queue_key(), &queue)?;

        let batch = MutationBatch::new(batch_id, local_write_time, mutations);
        let row = DbMutationBatch {
            user_id: self.user_id.clone(),
            batch_id,
            local_write_time,
            mutations: batch.mutations.clone(),
        };
        txn.put(MUTATIONS, mutation_key(&self.user_id, batch_id), &row)?;
        for key in batch.keys() {
            txn.put_raw(
                DOCUMENT_MUTATIONS,
                document_mutation_key(&self.user_id, &key, batch_id),
                Vec::new(),
            )?;
        }
        Ok(batch)
    }

    pub fn lookup_batch(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        Ok(txn
            .get::<DbMutationBatch>(MUTATIONS, &mutation_key(&self.user_id, batch_id))?
            .map(to_batch))
    }

    /// First batch with an id greater than `batch_id`.
    pub fn next_batch_after(
        &self,
        txn: &PersistenceTransaction,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let start_id = if batch_id == BATCH_ID_UNKNOWN { 0 } else { batch_id + 1 };
        let range = KeyRange::prefix_from(self.queue_key(), mutation_key(&self.user_id, start_id));
        Ok(txn
            .scan::<DbMutationBatch>(MUTATIONS, &range)?
            .into_iter()
            .next()
            .map(|(_, row)| to_batch(row)))
    }

    pub fn all_batches(&self, txn: &PersistenceTransaction) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(txn
            .scan::<DbMutationBatch>(MUTATIONS, &KeyRange::prefix(self.queue_key()))?
            .into_iter()
            .map(|(_, row)| to_batch(row))
            .collect())
    }

    pub fn highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction) -> FirestoreResult<BatchId> {
        Ok(self
            .all_batches(txn)?
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn is_empty(&self, txn: &PersistenceTransaction) -> FirestoreResult<bool> {
        Ok(txn
            .scan_raw(MUTATIONS, &KeyRange::prefix(self.queue_key()))?
            .is_empty())
    }

    /// Records the acknowledgement and the stream token that came with it.
    pub fn acknowledge_batch(
        &self,
        txn: &mut PersistenceTransaction,
        batch: &MutationBatch,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<()> {
        let mut queue = self.queue_metadata(txn)?;
        queue.last_acknowledged_batch_id = batch.batch_id;
        queue.last_stream_token = stream_token;
        txn.put(MUTATION_QUEUES, self.queue_key(), &queue)
    }

    /// Deletes the batch and its index rows; touched documents become GC candidates.
    pub fn remove_batch(&self, txn: &mut PersistenceTransaction, batch: &MutationBatch) -> FirestoreResult<()> {
        let key = mutation_key(&self.user_id, batch.batch_id);
        if txn.get_raw(MUTATIONS, &key)?.is_none() {
            return Err(internal_error(format!(
                "Cannot remove mutation batch {} that is not in the queue",
                batch.batch_id
            )));
        }
        txn.delete(MUTATIONS, &key)?;
        for document in batch.keys() {
            txn.delete(
                DOCUMENT_MUTATIONS,
                &document_mutation_key(&self.user_id, &document, batch.batch_id),
            )?;
            write_sentinel_key(txn, &document)?;
        }
        Ok(())
    }

    pub fn last_stream_token(&self, txn: &PersistenceTransaction) -> FirestoreResult<Vec<u8>> {
        Ok(self.queue_metadata(txn)?.last_stream_token)
    }

    pub fn set_last_stream_token(&self, txn: &mut PersistenceTransaction, token: Vec<u8>) -> FirestoreResult<()> {
        let mut queue = self.queue_metadata(txn)?;
        queue.last_stream_token = token;
        txn.put(MUTATION_QUEUES, self.queue_key(), &queue)
    }

    /// Whether this user has a pending mutation for `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
        let prefix = vec![KeyPart::from(self.user_id.as_str()), path_part(key.path())];
        Ok(!txn.scan_raw(DOCUMENT_MUTATIONS, &KeyRange::prefix(prefix))?.is_empty())
    }

    pub fn all_batches_affecting_key(
        &self,
        txn: &PersistenceTransaction,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut keys = DocumentKeySet::new();
        keys.insert(key.clone());
        self.all_batches_affecting_keys(txn, &keys)
    }

    /// Batches touching any of `keys`, in batch order.
    pub fn all_batches_affecting_keys(
        &self,
        txn: &PersistenceTransaction,
        keys: &DocumentKeySet,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            let prefix = vec![KeyPart::from(self.user_id.as_str()), path_part(key.path())];
            for (row_key, _) in txn.scan_raw(DOCUMENT_MUTATIONS, &KeyRange::prefix(prefix))? {
                batch_ids.insert(int_from_part(row_key.get(2))? as BatchId);
            }
        }
        self.load_batches(txn, batch_ids)
    }

    /// Batches that may change the result of `query`.
    pub fn all_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let rows = if query.is_collection_group_query() {
            txn.scan_raw(DOCUMENT_MUTATIONS, &KeyRange::prefix(self.queue_key()))?
        } else {
            // Paths under the query path are contiguous in string order.
            let prefix = format!("{}/", query.path().canonical_string());
            let start = vec![KeyPart::from(self.user_id.as_str()), KeyPart::from(prefix.as_str())];
            txn.scan_raw(DOCUMENT_MUTATIONS, &KeyRange::prefix_from(self.queue_key(), start))?
                .into_iter()
                .take_while(|(row_key, _)| {
                    matches!(row_key.get(1), Some(KeyPart::Text(path)) if path.starts_with(&prefix))
                })
                .collect()
        };

        let mut batch_ids = BTreeSet::new();
        for (row_key, _) in rows {
            let Some(KeyPart::Text(path)) = row_key.get(1) else {
                continue;
            };
            let key = DocumentKey::from_string(path)?;
            if query.matches_path_and_collection_group(&key) {
                batch_ids.insert(int_from_part(row_key.get(2))? as BatchId);
            }
        }
        self.load_batches(txn, batch_ids)
    }

    fn load_batches(
        &self,
        txn: &PersistenceTransaction,
        batch_ids: BTreeSet<BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.lookup_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => {
                    return Err(internal_error(format!(
                        "Dangling document-mutation reference to batch {batch_id}"
                    )))
                }
            }
        }
        Ok(batches)
    }

    fn queue_metadata(&self, txn: &PersistenceTransaction) -> FirestoreResult<DbMutationQueue> {
        Ok(txn.get(MUTATION_QUEUES, &self.queue_key())?.unwrap_or_default())
    }

    fn queue_key(&self) -> Vec<KeyPart> {
        vec![KeyPart::from(self.user_id.as_str())]
    }
}

/// Whether any user's queue holds a mutation for `key`.
pub(crate) fn mutation_queues_contain_key(txn: &PersistenceTransaction, key: &DocumentKey) -> FirestoreResult<bool> {
    for (queue_key, _) in txn.scan_raw(MUTATION_QUEUES, &KeyRange::all())? {
        let mut prefix = queue_key;
        prefix.push(path_part(key.path()));
        if !txn.scan_raw(DOCUMENT_MUTATIONS, &KeyRange::prefix(prefix))?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

fn to_batch(row: DbMutationBatch) -> MutationBatch {
    MutationBatch::new(row.batch_id, row.local_write_time, row.mutations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::local::kv_store::MemoryKvStore;
    use crate::local::persistence::{Persistence, TransactionMode};
    use crate::model::ResourcePath;
    use crate::settings::SyncSettings;
    use crate::value::MapValue;
    use std::sync::Arc;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn persistence() -> Arc<Persistence> {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", &SyncSettings::default());
        persistence.start().unwrap();
        persistence
    }

    fn add(persistence: &Persistence, queue: &MutationQueue, paths: &[&str]) -> MutationBatch {
        persistence
            .run_transaction("add", TransactionMode::ReadWrite, |txn| {
                let mutations = paths
                    .iter()
                    .map(|path| Mutation::set(key(path), MapValue::empty()))
                    .collect();
                queue.add_batch(txn, Timestamp::now(), mutations)
            })
            .unwrap()
    }

    #[test]
    fn batch_ids_increase_across_users() {
        let persistence = persistence();
        let alice = MutationQueue::new(&User::new("alice"));
        let bob = MutationQueue::new(&User::new("bob"));
        let first = add(&persistence, &alice, &["rooms/a"]);
        let second = add(&persistence, &bob, &["rooms/a"]);
        let third = add(&persistence, &alice, &["rooms/b"]);
        assert_eq!(first.batch_id, 1);
        assert!(second.batch_id > first.batch_id);
        assert!(third.batch_id > second.batch_id);

        let batches = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| alice.all_batches(txn))
            .unwrap();
        assert_eq!(batches.iter().map(|b| b.batch_id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn finds_batches_by_key_and_query() {
        let persistence = persistence();
        let queue = MutationQueue::new(&User::unauthenticated());
        add(&persistence, &queue, &["rooms/a"]);
        add(&persistence, &queue, &["rooms/a/messages/1", "users/x"]);
        add(&persistence, &queue, &["roomsx/c"]);

        let (by_key, by_query, by_group) = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                let by_key = queue.all_batches_affecting_key(txn, &key("rooms/a"))?;
                let by_query =
                    queue.all_batches_affecting_query(txn, &Query::at_path(ResourcePath::from_string("rooms")?))?;
                let by_group = queue.all_batches_affecting_query(txn, &Query::collection_group("messages"))?;
                Ok((by_key, by_query, by_group))
            })
            .unwrap();
        assert_eq!(by_key.iter().map(|b| b.batch_id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(by_query.iter().map(|b| b.batch_id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(by_group.iter().map(|b| b.batch_id).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn removing_a_batch_drops_its_index_rows() {
        let persistence = persistence();
        let queue = MutationQueue::new(&User::unauthenticated());
        let batch = add(&persistence, &queue, &["rooms/a"]);
        persistence
            .run_transaction("ack", TransactionMode::ReadWrite, |txn| {
                queue.acknowledge_batch(txn, &batch, b"token".to_vec())?;
                queue.remove_batch(txn, &batch)
            })
            .unwrap();
        let (empty, affecting, token, contains) = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    queue.is_empty(txn)?,
                    queue.all_batches_affecting_key(txn, &key("rooms/a"))?,
                    queue.last_stream_token(txn)?,
                    mutation_queues_contain_key(txn, &key("rooms/a"))?,
                ))
            })
            .unwrap();
        assert!(empty);
        assert!(affecting.is_empty());
        assert_eq!(token, b"token".to_vec());
        assert!(!contains);
    }

    #[test]
    fn next_batch_after_skips_earlier_batches() {
        let persistence = persistence();
        let queue = MutationQueue::new(&User::unauthenticated());
        add(&persistence, &queue, &["rooms/a"]);
        add(&persistence, &queue, &["rooms/b"]);
        let (first, second, none) = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    queue.next_batch_after(txn, BATCH_ID_UNKNOWN)?,
                    queue.next_batch_after(txn, 1)?,
                    queue.next_batch_after(txn, 2)?,
                ))
            })
            .unwrap();
        assert_eq!(first.map(|b| b.batch_id), Some(1));
        assert_eq!(second.map(|b| b.batch_id), Some(2));
        assert!(none.is_none());
    }
}
