//! Transaction runner over the key/value substrate and primary election
//! between clients that share one store.
//!
//! Every client writes a heartbeat row into `client_metadata`. At most one of
//! them holds the lease row under `globals/owner`; only that client may run
//! `ReadWritePrimary` transactions, open network streams or collect garbage.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{
    failed_precondition, is_retryable_storage_error, primary_lease_lost, FirestoreErrorCode,
    FirestoreResult,
};
use crate::local::kv_store::{KeyPart, KeyRange, KvKey, KvStore, KvTransaction};
use crate::local::local_serializer::{
    decode, encode, global_key, DbClientMetadata, DbPrimaryClient, DbTargetGlobal, CLIENT_METADATA,
    GLOBALS, PRIMARY_CLIENT_KEY, TARGET_GLOBAL_KEY,
};
use crate::model::{ListenSequenceNumber, INVALID_SEQUENCE_NUMBER};
use crate::platform::runtime;
use crate::settings::{LeaseSettings, SyncSettings};
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

const PRIMARY_LEASE_EXCLUSIVE_MESSAGE: &str =
    "Another client has exclusive access to the persistence layer. To allow shared access, \
     enable tab synchronization on every client.";

/// Invoked with the new value whenever this client gains or loses the primary lease.
pub type PrimaryStateListener = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write work that requires the primary lease; fails with `PrimaryLeaseLost` otherwise.
    ReadWritePrimary,
}

/// Handle passed to transaction bodies. Rows are serde-encoded.
pub struct PersistenceTransaction {
    kv: Box<dyn KvTransaction>,
    sequence_number: ListenSequenceNumber,
}

impl PersistenceTransaction {
    /// Sequence number stamped on every target or document touched by this transaction.
    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, store: &str, key: &KvKey) -> FirestoreResult<Option<T>> {
        self.kv
            .get(store, key)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub(crate) fn get_raw(&self, store: &str, key: &KvKey) -> FirestoreResult<Option<Vec<u8>>> {
        self.kv.get(store, key)
    }

    pub(crate) fn put<T: Serialize>(&mut self, store: &str, key: KvKey, value: &T) -> FirestoreResult<()> {
        let bytes = encode(value)?;
        self.kv.put(store, key, bytes)
    }

    pub(crate) fn put_raw(&mut self, store: &str, key: KvKey, bytes: Vec<u8>) -> FirestoreResult<()> {
        self.kv.put(store, key, bytes)
    }

    pub(crate) fn delete(&mut self, store: &str, key: &KvKey) -> FirestoreResult<()> {
        self.kv.delete(store, key)
    }

    pub(crate) fn delete_range(&mut self, store: &str, range: &KeyRange) -> FirestoreResult<()> {
        self.kv.delete_range(store, range)
    }

    pub(crate) fn scan<T: DeserializeOwned>(
        &self,
        store: &str,
        range: &KeyRange,
    ) -> FirestoreResult<Vec<(KvKey, T)>> {
        self.kv
            .scan(store, range)?
            .into_iter()
            .map(|(key, bytes)| Ok((key, decode(&bytes)?)))
            .collect()
    }

    pub(crate) fn scan_raw(&self, store: &str, range: &KeyRange) -> FirestoreResult<Vec<(KvKey, Vec<u8>)>> {
        self.kv.scan(store, range)
    }
}

struct PersistenceState {
    started: bool,
    is_primary: bool,
    network_enabled: bool,
    in_foreground: bool,
    last_sequence_number: ListenSequenceNumber,
    primary_listener: Option<PrimaryStateListener>,
    heartbeat: Option<DelayedOperation>,
}

pub struct Persistence {
    store: Arc<dyn KvStore>,
    client_id: String,
    lease: LeaseSettings,
    max_attempts: u32,
    allow_tab_synchronization: bool,
    state: StdMutex<PersistenceState>,
}

impl Persistence {
    pub fn new(store: Arc<dyn KvStore>, client_id: impl Into<String>, settings: &SyncSettings) -> Arc<Self> {
        Arc::new(Self {
            store,
            client_id: client_id.into(),
            lease: settings.lease.clone(),
            max_attempts: settings.max_transaction_attempts,
            allow_tab_synchronization: settings.synchronize_tabs,
            state: StdMutex::new(PersistenceState {
                started: false,
                is_primary: false,
                network_enabled: true,
                in_foreground: true,
                last_sequence_number: INVALID_SEQUENCE_NUMBER,
                primary_listener: None,
                heartbeat: None,
            }),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn is_primary(&self) -> bool {
        self.lock().is_primary
    }

    /// Registers the client heartbeat and attempts to take the primary lease.
    ///
    /// Fails with `FailedPrecondition` when another client holds an exclusive lease.
    pub fn start(&self) -> FirestoreResult<()> {
        self.update_client_metadata_and_try_become_primary()?;
        let highest = self.run_transaction("Read sequence number", TransactionMode::ReadOnly, |txn| {
            Ok(txn
                .get::<DbTargetGlobal>(GLOBALS, &global_key(TARGET_GLOBAL_KEY))?
                .map(|global| global.highest_listen_sequence_number)
                .unwrap_or(0))
        })?;
        let mut state = self.lock();
        state.last_sequence_number = state.last_sequence_number.max(highest);
        state.started = true;
        Ok(())
    }

    /// Refreshes the heartbeat periodically on `queue` until shutdown.
    pub fn start_heartbeat(self: &Arc<Self>, queue: &AsyncQueue) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let heartbeat_queue = queue.clone();
        let operation = queue.enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            self.lease.refresh_interval,
            move || async move {
                let Some(persistence) = weak.upgrade() else {
                    return;
                };
                if !persistence.is_started() {
                    return;
                }
                if let Err(err) = persistence.update_client_metadata_and_try_become_primary() {
                    log::debug!("Failed to refresh client metadata: {err}");
                }
                persistence.start_heartbeat(&heartbeat_queue);
            },
        );
        self.lock().heartbeat = Some(operation);
    }

    /// Registers the primary-state listener and immediately reports the current state.
    pub fn set_primary_state_listener(&self, listener: PrimaryStateListener) {
        let is_primary = {
            let mut state = self.lock();
            state.primary_listener = Some(listener.clone());
            state.is_primary
        };
        listener(is_primary);
    }

    /// Network availability is one input of the primary election.
    pub fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.lock();
            let changed = state.network_enabled != enabled;
            state.network_enabled = enabled;
            changed && state.started
        };
        if changed {
            self.update_client_metadata_and_try_become_primary()?;
        }
        Ok(())
    }

    pub fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        let changed = {
            let mut state = self.lock();
            let changed = state.in_foreground != in_foreground;
            state.in_foreground = in_foreground;
            changed && state.started
        };
        if changed {
            self.update_client_metadata_and_try_become_primary()?;
        }
        Ok(())
    }

    /// Releases the lease and removes this client's heartbeat row.
    pub fn shutdown(&self) -> FirestoreResult<()> {
        {
            let mut state = self.lock();
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.cancel();
            }
            state.started = false;
            state.is_primary = false;
        }
        self.run_kv_transaction("Shutdown", false, |kv| {
            self.release_primary_lease_if_held(kv)?;
            kv.delete(CLIENT_METADATA, &self.client_key())
        })
    }

    /// Runs `body` in one storage transaction, retrying aborted commits.
    ///
    /// `body` may run several times and must not have side effects outside the transaction.
    pub fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode, mut body: F) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction) -> FirestoreResult<T>,
    {
        log::trace!("Starting transaction: {action}");
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt_transaction(mode, &mut body) {
                Ok(value) => return Ok(value),
                Err(err) if is_retryable_storage_error(&err) && attempt < self.max_attempts => {
                    log::debug!("Transaction '{action}' failed on attempt {attempt}: {err}; retrying");
                }
                Err(err) => {
                    if err.code == FirestoreErrorCode::PrimaryLeaseLost {
                        self.demote();
                    }
                    return Err(err);
                }
            }
        }
    }

    fn attempt_transaction<T, F>(&self, mode: TransactionMode, body: &mut F) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction) -> FirestoreResult<T>,
    {
        let read_only = mode == TransactionMode::ReadOnly;
        let kv = self.store.begin(read_only)?;
        let mut txn = PersistenceTransaction {
            kv,
            sequence_number: INVALID_SEQUENCE_NUMBER,
        };
        if !read_only {
            txn.sequence_number = self.next_sequence_number(&txn)?;
        }
        if mode == TransactionMode::ReadWritePrimary && !self.holds_primary_lease(&*txn.kv)? {
            return Err(primary_lease_lost(
                "The current client no longer holds the primary lease.",
            ));
        }
        let value = body(&mut txn)?;
        if mode == TransactionMode::ReadWritePrimary {
            self.acquire_or_extend_primary_lease(&mut *txn.kv, runtime::now_millis())?;
        }
        txn.kv.commit()?;
        Ok(value)
    }

    fn run_kv_transaction<T, F>(&self, action: &str, read_only: bool, mut body: F) -> FirestoreResult<T>
    where
        F: FnMut(&mut dyn KvTransaction) -> FirestoreResult<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.store.begin(read_only).and_then(|mut kv| {
                let value = body(&mut *kv)?;
                kv.commit()?;
                Ok(value)
            });
            match result {
                Err(err) if is_retryable_storage_error(&err) && attempt < self.max_attempts => {
                    log::debug!("Transaction '{action}' failed on attempt {attempt}: {err}; retrying");
                }
                other => return other,
            }
        }
    }

    fn next_sequence_number(&self, txn: &PersistenceTransaction) -> FirestoreResult<ListenSequenceNumber> {
        let stored = txn
            .get::<DbTargetGlobal>(GLOBALS, &global_key(TARGET_GLOBAL_KEY))?
            .map(|global| global.highest_listen_sequence_number)
            .unwrap_or(0);
        let mut state = self.lock();
        let next = state.last_sequence_number.max(stored) + 1;
        state.last_sequence_number = next;
        Ok(next)
    }

    /// Writes the heartbeat row and takes, keeps or releases the lease.
    pub fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<()> {
        let (network_enabled, in_foreground, was_primary) = {
            let state = self.lock();
            (state.network_enabled, state.in_foreground, state.is_primary)
        };
        let now = runtime::now_millis();
        let result = self.run_kv_transaction("Update client metadata", false, |kv| {
            let metadata = DbClientMetadata {
                client_id: self.client_id.clone(),
                update_time_ms: now,
                network_enabled,
                in_foreground,
            };
            kv.put(CLIENT_METADATA, self.client_key(), encode(&metadata)?)?;

            let can_act = self.can_act_as_primary(kv, now, network_enabled, in_foreground)?;
            if can_act {
                self.acquire_or_extend_primary_lease(kv, now)?;
                self.remove_stale_clients(kv, now)?;
            } else {
                self.release_primary_lease_if_held(kv)?;
            }
            Ok(can_act)
        });

        let is_primary = match result {
            Ok(can_act) => can_act,
            Err(err) if is_retryable_storage_error(&err) => {
                log::debug!("Failed to extend primary lease: {err}");
                false
            }
            Err(err) => return Err(err),
        };
        if is_primary != was_primary {
            log::debug!(
                "Client {} {} eligible for the primary lease",
                self.client_id,
                if is_primary { "is" } else { "is not" }
            );
            self.set_primary(is_primary);
        }
        Ok(())
    }

    fn can_act_as_primary(
        &self,
        kv: &mut dyn KvTransaction,
        now: i64,
        network_enabled: bool,
        in_foreground: bool,
    ) -> FirestoreResult<bool> {
        let owner: Option<DbPrimaryClient> = kv
            .get(GLOBALS, &global_key(PRIMARY_CLIENT_KEY))?
            .map(|bytes| decode(&bytes))
            .transpose()?;
        if let Some(owner) = owner.filter(|owner| self.is_lease_valid(owner, now)) {
            if owner.owner_id == self.client_id && network_enabled {
                return Ok(true);
            }
            if owner.owner_id != self.client_id {
                if !self.allow_tab_synchronization || !owner.allow_tab_synchronization {
                    return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_MESSAGE));
                }
                return Ok(false);
            }
        }

        if network_enabled && in_foreground {
            return Ok(true);
        }

        // Defer to an active client with a better network or visibility state.
        let max_age = self.lease.max_primary_eligible_age.as_millis() as i64;
        for (_, bytes) in kv.scan(CLIENT_METADATA, &KeyRange::all())? {
            let other: DbClientMetadata = decode(&bytes)?;
            if other.client_id == self.client_id || now - other.update_time_ms > max_age {
                continue;
            }
            let better_network = !network_enabled && other.network_enabled;
            let better_visibility = !in_foreground && other.in_foreground;
            let same_network = network_enabled == other.network_enabled;
            if better_network || (better_visibility && same_network) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn is_lease_valid(&self, owner: &DbPrimaryClient, now: i64) -> bool {
        let max_age = self.lease.max_primary_eligible_age.as_millis() as i64;
        now - owner.lease_timestamp_ms <= max_age
    }

    fn holds_primary_lease(&self, kv: &dyn KvTransaction) -> FirestoreResult<bool> {
        let owner: Option<DbPrimaryClient> = kv
            .get(GLOBALS, &global_key(PRIMARY_CLIENT_KEY))?
            .map(|bytes| decode(&bytes))
            .transpose()?;
        Ok(owner.is_some_and(|owner| owner.owner_id == self.client_id))
    }

    fn acquire_or_extend_primary_lease(&self, kv: &mut dyn KvTransaction, now: i64) -> FirestoreResult<()> {
        let lease = DbPrimaryClient {
            owner_id: self.client_id.clone(),
            allow_tab_synchronization: self.allow_tab_synchronization,
            lease_timestamp_ms: now,
        };
        kv.put(GLOBALS, global_key(PRIMARY_CLIENT_KEY), encode(&lease)?)
    }

    fn release_primary_lease_if_held(&self, kv: &mut dyn KvTransaction) -> FirestoreResult<()> {
        if self.holds_primary_lease(kv)? {
            log::debug!("Releasing primary lease held by {}", self.client_id);
            kv.delete(GLOBALS, &global_key(PRIMARY_CLIENT_KEY))?;
        }
        Ok(())
    }

    fn remove_stale_clients(&self, kv: &mut dyn KvTransaction, now: i64) -> FirestoreResult<()> {
        let max_age = self.lease.max_client_age.as_millis() as i64;
        for (key, bytes) in kv.scan(CLIENT_METADATA, &KeyRange::all())? {
            let metadata: DbClientMetadata = decode(&bytes)?;
            if now - metadata.update_time_ms > max_age {
                log::debug!("Removing metadata of inactive client {}", metadata.client_id);
                kv.delete(CLIENT_METADATA, &key)?;
            }
        }
        Ok(())
    }

    fn demote(&self) {
        if self.is_primary() {
            log::warn!("Client {} lost the primary lease", self.client_id);
            self.set_primary(false);
        }
    }

    fn set_primary(&self, is_primary: bool) {
        let listener = {
            let mut state = self.lock();
            state.is_primary = is_primary;
            state.primary_listener.clone()
        };
        if let Some(listener) = listener {
            listener(is_primary);
        }
    }

    fn client_key(&self) -> KvKey {
        vec![KeyPart::from(self.client_id.as_str())]
    }

    fn lock(&self) -> MutexGuard<'_, PersistenceState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Swallows a lost primary lease; the client demotes itself separately.
pub fn ignore_if_primary_lease_loss(result: FirestoreResult<()>) -> FirestoreResult<()> {
    match result {
        Err(err) if err.code == FirestoreErrorCode::PrimaryLeaseLost => {
            log::debug!("Unexpectedly lost primary lease: {err}");
            Ok(())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::kv_store::MemoryKvStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn shared_settings() -> SyncSettings {
        SyncSettings {
            synchronize_tabs: true,
            ..SyncSettings::default()
        }
    }

    #[test]
    fn single_client_becomes_primary() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "a", &SyncSettings::default());
        persistence.start().unwrap();
        assert!(persistence.is_primary());
        let seq = persistence
            .run_transaction("test", TransactionMode::ReadWritePrimary, |txn| {
                Ok(txn.current_sequence_number())
            })
            .unwrap();
        assert!(seq > 0);
    }

    #[test]
    fn second_client_defers_to_fresh_lease() {
        let store = MemoryKvStore::new();
        let first = Persistence::new(Arc::new(store.clone()), "a", &shared_settings());
        let second = Persistence::new(Arc::new(store), "b", &shared_settings());
        first.start().unwrap();
        second.start().unwrap();
        assert!(first.is_primary());
        assert!(!second.is_primary());

        let err = second
            .run_transaction("test", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::PrimaryLeaseLost);
    }

    #[test]
    fn exclusive_lease_rejects_other_clients() {
        let store = MemoryKvStore::new();
        let first = Persistence::new(Arc::new(store.clone()), "a", &SyncSettings::default());
        let second = Persistence::new(Arc::new(store), "b", &SyncSettings::default());
        first.start().unwrap();
        let err = second.start().unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn lease_moves_after_shutdown() {
        let store = MemoryKvStore::new();
        let first = Persistence::new(Arc::new(store.clone()), "a", &shared_settings());
        let second = Persistence::new(Arc::new(store), "b", &shared_settings());
        first.start().unwrap();
        second.start().unwrap();

        let promoted = Arc::new(AtomicBool::new(false));
        let flag = promoted.clone();
        second.set_primary_state_listener(Arc::new(move |primary| flag.store(primary, Ordering::SeqCst)));

        first.shutdown().unwrap();
        second.update_client_metadata_and_try_become_primary().unwrap();
        assert!(second.is_primary());
        assert!(promoted.load(Ordering::SeqCst));
    }

    #[test]
    fn sequence_numbers_increase_across_transactions() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "a", &SyncSettings::default());
        persistence.start().unwrap();
        let first = persistence
            .run_transaction("one", TransactionMode::ReadWrite, |txn| Ok(txn.current_sequence_number()))
            .unwrap();
        let second = persistence
            .run_transaction("two", TransactionMode::ReadWrite, |txn| Ok(txn.current_sequence_number()))
            .unwrap();
        assert!(second > first);
        let read = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| Ok(txn.current_sequence_number()))
            .unwrap();
        assert_eq!(read, INVALID_SEQUENCE_NUMBER);
    }
}
