use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{internal_error, FirestoreResult};
use crate::model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, Mutation, MutationResult,
    SnapshotVersion, Timestamp,
};

/// Atomic group of mutations written by one call, applied in order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(batch_id: BatchId, local_write_time: Timestamp, mutations: Vec<Mutation>) -> Self {
        Self {
            batch_id,
            local_write_time,
            mutations,
        }
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn apply_to_local_view(&self, key: &DocumentKey, document: Option<Document>) -> Option<Document> {
        self.mutations
            .iter()
            .filter(|mutation| mutation.key() == key)
            .fold(document, |doc, mutation| {
                mutation.apply_to_local_view(doc, self.local_write_time)
            })
    }

    /// Applies the batch to every document it touches in `documents`.
    pub fn apply_to_local_document_set(&self, documents: &DocumentMap) -> DocumentMap {
        let mut result = documents.clone();
        for key in self.keys() {
            let base = documents.get(&key).cloned();
            if let Some(doc) = self.apply_to_local_view(&key, base) {
                result.insert(key, doc);
            }
        }
        result
    }

    pub fn apply_to_remote_document(
        &self,
        key: &DocumentKey,
        document: Option<Document>,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<Option<Document>> {
        self.mutations
            .iter()
            .zip(&batch_result.mutation_results)
            .filter(|(mutation, _)| mutation.key() == key)
            .try_fold(document, |doc, (mutation, result)| {
                mutation.apply_to_remote_document(doc, result)
            })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Per-document version assigned by the commit.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutation batch {} expected {} results, got {}",
                batch.batch_id,
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldPath;
    use crate::value::{FirestoreValue, MapValue};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(value: i64) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated("v").unwrap(), FirestoreValue::from_integer(value));
        map
    }

    #[test]
    fn applies_mutations_in_order_per_key() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            vec![
                Mutation::set(key("c/a"), data(1)),
                Mutation::set(key("c/b"), data(2)),
                Mutation::delete(key("c/a")),
            ],
        );
        assert_eq!(batch.keys().len(), 2);
        let result = batch.apply_to_local_document_set(&DocumentMap::new());
        assert!(result.get(&key("c/a")).unwrap().is_no_document());
        assert!(result.get(&key("c/b")).unwrap().is_found_document());
    }

    #[test]
    fn result_requires_one_entry_per_mutation() {
        let batch = MutationBatch::new(1, Timestamp::now(), vec![Mutation::delete(key("c/a"))]);
        assert!(MutationBatchResult::from(batch.clone(), SnapshotVersion::min(), vec![], vec![]).is_err());
        let version = SnapshotVersion::new(Timestamp::new(3, 0));
        let result =
            MutationBatchResult::from(batch, version, vec![MutationResult::new(version, vec![])], vec![])
                .unwrap();
        assert_eq!(result.doc_versions.get(&key("c/a")), Some(&version));
    }
}
