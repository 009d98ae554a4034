//! Transactional key/value substrate the local caches are written against.
//!
//! Keys are tuples of integers and strings ordered component by component so
//! related rows (all batches of a user, all documents of a collection) can be
//! read with a single prefix scan.

use std::ops::Bound;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::error::{internal_error, transaction_aborted, FirestoreResult};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyPart {
    Int(i64),
    Text(String),
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        KeyPart::Int(value)
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        KeyPart::Int(i64::from(value))
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Text(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Text(value)
    }
}

pub type KvKey = Vec<KeyPart>;

/// Keys sharing `prefix`, optionally starting past a lower bound.
#[derive(Clone, Debug)]
pub struct KeyRange {
    start: Bound<KvKey>,
    prefix: KvKey,
}

impl KeyRange {
    pub fn prefix(prefix: KvKey) -> Self {
        Self {
            start: Bound::Included(prefix.clone()),
            prefix,
        }
    }

    pub fn all() -> Self {
        Self::prefix(Vec::new())
    }

    /// Keys with `prefix` that sort at or after `start`.
    pub fn prefix_from(prefix: KvKey, start: KvKey) -> Self {
        Self {
            start: Bound::Included(start),
            prefix,
        }
    }

    pub fn contains(&self, key: &KvKey) -> bool {
        let after_start = match &self.start {
            Bound::Included(start) => key >= start,
            Bound::Excluded(start) => key > start,
            Bound::Unbounded => true,
        };
        after_start && key.starts_with(&self.prefix)
    }
}

pub trait KvTransaction: Send {
    fn get(&self, store: &str, key: &KvKey) -> FirestoreResult<Option<Vec<u8>>>;

    fn put(&mut self, store: &str, key: KvKey, value: Vec<u8>) -> FirestoreResult<()>;

    fn delete(&mut self, store: &str, key: &KvKey) -> FirestoreResult<()>;

    /// Rows in `range`, in key order.
    fn scan(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(KvKey, Vec<u8>)>>;

    fn delete_range(&mut self, store: &str, range: &KeyRange) -> FirestoreResult<()> {
        for (key, _) in self.scan(store, range)? {
            self.delete(store, &key)?;
        }
        Ok(())
    }

    /// Makes the writes durable; fails with `TransactionAborted` on a conflicting commit.
    fn commit(self: Box<Self>) -> FirestoreResult<()>;
}

pub trait KvStore: Send + Sync {
    fn begin(&self, read_only: bool) -> FirestoreResult<Box<dyn KvTransaction>>;
}

type Table = im::OrdMap<KvKey, Arc<Vec<u8>>>;

#[derive(Default)]
struct MemoryState {
    tables: im::OrdMap<String, Table>,
    version: u64,
}

/// In-process store with snapshot reads and optimistic commits.
///
/// Clones share the same data, which lets several clients run against one store.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    state: Arc<StdMutex<MemoryState>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

impl KvStore for MemoryKvStore {
    fn begin(&self, read_only: bool) -> FirestoreResult<Box<dyn KvTransaction>> {
        let state = self.lock();
        Ok(Box::new(MemoryKvTransaction {
            store: self.state.clone(),
            base_version: state.version,
            tables: state.tables.clone(),
            read_only,
            dirty: false,
        }))
    }
}

struct MemoryKvTransaction {
    store: Arc<StdMutex<MemoryState>>,
    base_version: u64,
    tables: im::OrdMap<String, Table>,
    read_only: bool,
    dirty: bool,
}

impl MemoryKvTransaction {
    fn check_writable(&self) -> FirestoreResult<()> {
        if self.read_only {
            return Err(internal_error("Write attempted in a read-only transaction"));
        }
        Ok(())
    }
}

impl KvTransaction for MemoryKvTransaction {
    fn get(&self, store: &str, key: &KvKey) -> FirestoreResult<Option<Vec<u8>>> {
        Ok(self
            .tables
            .get(store)
            .and_then(|table| table.get(key))
            .map(|value| (**value).clone()))
    }

    fn put(&mut self, store: &str, key: KvKey, value: Vec<u8>) -> FirestoreResult<()> {
        self.check_writable()?;
        self.dirty = true;
        let mut table = self.tables.get(store).cloned().unwrap_or_default();
        table.insert(key, Arc::new(value));
        self.tables.insert(store.to_string(), table);
        Ok(())
    }

    fn delete(&mut self, store: &str, key: &KvKey) -> FirestoreResult<()> {
        self.check_writable()?;
        if let Some(table) = self.tables.get(store) {
            if table.contains_key(key) {
                let mut table = table.clone();
                table.remove(key);
                self.tables.insert(store.to_string(), table);
                self.dirty = true;
            }
        }
        Ok(())
    }

    fn scan(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(KvKey, Vec<u8>)>> {
        let Some(table) = self.tables.get(store) else {
            return Ok(Vec::new());
        };
        Ok(table
            .range((range.start.clone(), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(&range.prefix))
            .map(|(key, value)| (key.clone(), (**value).clone()))
            .collect())
    }

    fn commit(self: Box<Self>) -> FirestoreResult<()> {
        if self.read_only || !self.dirty {
            return Ok(());
        }
        let mut state = self.store.lock().unwrap_or_else(|poison| poison.into_inner());
        if state.version != self.base_version {
            return Err(transaction_aborted(
                "Store was modified by a concurrent transaction",
            ));
        }
        state.tables = self.tables;
        state.version += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[KeyPart]) -> KvKey {
        parts.to_vec()
    }

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let store = MemoryKvStore::new();
        let mut txn = store.begin(false).unwrap();
        txn.put("rows", key(&["u".into(), 2.into()]), b"b".to_vec()).unwrap();
        txn.put("rows", key(&["u".into(), 1.into()]), b"a".to_vec()).unwrap();
        txn.put("rows", key(&["v".into(), 1.into()]), b"c".to_vec()).unwrap();
        txn.commit().unwrap();

        let txn = store.begin(true).unwrap();
        let rows = txn.scan("rows", &KeyRange::prefix(vec!["u".into()])).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].1, b"a".to_vec());

        let later = txn
            .scan("rows", &KeyRange::prefix_from(vec!["u".into()], key(&["u".into(), 2.into()])))
            .unwrap();
        assert_eq!(later.len(), 1);
        assert!(txn.scan("missing", &KeyRange::all()).unwrap().is_empty());
    }

    #[test]
    fn uncommitted_writes_are_invisible() {
        let store = MemoryKvStore::new();
        let mut txn = store.begin(false).unwrap();
        txn.put("rows", vec!["a".into()], vec![1]).unwrap();
        drop(txn);
        let reader = store.begin(true).unwrap();
        assert!(reader.get("rows", &vec!["a".into()]).unwrap().is_none());
    }

    #[test]
    fn concurrent_commit_aborts() {
        let store = MemoryKvStore::new();
        let mut first = store.begin(false).unwrap();
        let mut second = store.clone().begin(false).unwrap();
        first.put("rows", vec!["a".into()], vec![1]).unwrap();
        second.put("rows", vec!["b".into()], vec![2]).unwrap();
        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert_eq!(err.code_str(), "firestore/transaction-aborted");
    }

    #[test]
    fn read_only_rejects_writes() {
        let store = MemoryKvStore::new();
        let mut txn = store.begin(true).unwrap();
        assert!(txn.put("rows", vec!["a".into()], vec![]).is_err());
    }
}
