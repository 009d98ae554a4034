//! Chooses how to execute a query against the local cache.
//!
//! When a target was last seen consistent (no limbo documents) at some
//! version, its previous result set is reused and only documents read after
//! that version are scanned. Limit queries fall back to a full scan whenever
//! the reused set might be missing a document at the edge of the limit.

use crate::core::query::LimitType;
use crate::core::Query;
use crate::error::FirestoreResult;
use crate::local::local_documents_view::LocalDocumentsView;
use crate::local::persistence::PersistenceTransaction;
use crate::model::{Document, DocumentKeySet, DocumentMap, SnapshotVersion};

#[derive(Clone, Debug)]
pub struct QueryEngine {
    local_documents: LocalDocumentsView,
}

impl QueryEngine {
    pub fn new(local_documents: LocalDocumentsView) -> Self {
        Self { local_documents }
    }

    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<DocumentMap> {
        if query.matches_all_documents() || last_limbo_free_snapshot_version.is_min() {
            return self.full_scan(txn, query);
        }
        match self.from_previous_results(txn, query, last_limbo_free_snapshot_version, remote_keys)? {
            Some(results) => Ok(results),
            None => self.full_scan(txn, query),
        }
    }

    pub(crate) fn full_scan(&self, txn: &PersistenceTransaction, query: &Query) -> FirestoreResult<DocumentMap> {
        log::trace!("Using full collection scan to execute query {}", query.canonical_id());
        self.local_documents
            .get_documents_matching_query(txn, query, SnapshotVersion::min())
    }

    /// Previous results merged with documents updated since they were computed,
    /// or `None` when a full scan is required.
    pub(crate) fn from_previous_results(
        &self,
        txn: &PersistenceTransaction,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> FirestoreResult<Option<DocumentMap>> {
        let documents = self.local_documents.get_documents(txn, remote_keys)?;
        let mut previous: Vec<Document> = documents
            .values()
            .filter(|document| query.matches(document))
            .cloned()
            .collect();
        previous.sort_by(|left, right| query.compare_documents(left, right));

        if needs_refill(query, &previous, remote_keys, last_limbo_free_snapshot_version) {
            return Ok(None);
        }

        log::trace!(
            "Re-using previous result from {last_limbo_free_snapshot_version} to execute query {}",
            query.canonical_id()
        );
        let mut results =
            self.local_documents
                .get_documents_matching_query(txn, query, last_limbo_free_snapshot_version)?;
        for document in previous {
            results.insert(document.key().clone(), document);
        }
        Ok(Some(results))
    }
}

/// A limit query must be re-run when the previous result may have lost a
/// document at its edge: a member stopped matching, or the edge document was
/// edited locally or remotely after the limbo-free snapshot.
fn needs_refill(
    query: &Query,
    sorted_previous: &[Document],
    remote_keys: &DocumentKeySet,
    last_limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != sorted_previous.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous.last(),
        LimitType::Last => sorted_previous.first(),
    };
    edge.is_some_and(|document| {
        document.has_pending_writes() || document.version() > last_limbo_free_snapshot_version
    })
}
