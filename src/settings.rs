//! Tunables for the synchronization core.
//!
//! Defaults match the production client; tests shorten the timers.

use std::time::Duration;

use crate::error::{invalid_argument, FirestoreResult};
use crate::local::LruParams;

/// Delay before the first garbage collection run after start-up (1 minute).
pub const DEFAULT_GC_INITIAL_DELAY: Duration = Duration::from_secs(60);
/// Delay between regular garbage collection runs (5 minutes).
pub const DEFAULT_GC_REGULAR_DELAY: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1_000);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.5;
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Idle streams are closed after this long without listen targets or pending writes.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_WATCH_STREAM_FAILURES: u32 = 1;
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;
pub const DEFAULT_LEASE_REFRESH_INTERVAL: Duration = Duration::from_secs(4);
pub const DEFAULT_MAX_PRIMARY_ELIGIBLE_AGE: Duration = Duration::from_secs(5);
/// Client metadata older than this is considered abandoned (30 minutes).
pub const DEFAULT_MAX_CLIENT_AGE: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_MAX_TRANSACTION_ATTEMPTS: u32 = 3;
pub const DEFAULT_RESUME_TOKEN_MAX_AGE: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, PartialEq)]
pub struct StreamSettings {
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
    pub idle_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            max_backoff: DEFAULT_MAX_BACKOFF,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Timing of the primary lease shared between instances on one store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseSettings {
    pub refresh_interval: Duration,
    pub max_primary_eligible_age: Duration,
    pub max_client_age: Duration,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_LEASE_REFRESH_INTERVAL,
            max_primary_eligible_age: DEFAULT_MAX_PRIMARY_ELIGIBLE_AGE,
            max_client_age: DEFAULT_MAX_CLIENT_AGE,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SyncSettings {
    pub lru: LruParams,
    pub gc_initial_delay: Duration,
    pub gc_regular_delay: Duration,
    pub stream: StreamSettings,
    pub online_state_timeout: Duration,
    pub max_watch_stream_failures: u32,
    pub max_concurrent_limbo_resolutions: usize,
    pub max_pending_writes: usize,
    pub lease: LeaseSettings,
    pub max_transaction_attempts: u32,
    pub resume_token_max_age: Duration,
    /// Allow several instances to share one store, electing a primary among them.
    pub synchronize_tabs: bool,
}

impl SyncSettings {
    pub fn validate(&self) -> FirestoreResult<()> {
        self.lru.validate()?;
        if self.stream.backoff_factor < 1.0 {
            return Err(invalid_argument("backoff_factor must be at least 1.0"));
        }
        if self.stream.initial_backoff > self.stream.max_backoff {
            return Err(invalid_argument("initial_backoff must not exceed max_backoff"));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        if self.max_pending_writes == 0 {
            return Err(invalid_argument("max_pending_writes must be greater than zero"));
        }
        if self.max_transaction_attempts == 0 {
            return Err(invalid_argument("max_transaction_attempts must be greater than zero"));
        }
        if self.lease.refresh_interval >= self.lease.max_primary_eligible_age {
            return Err(invalid_argument(
                "lease refresh_interval must be shorter than max_primary_eligible_age",
            ));
        }
        Ok(())
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            lru: LruParams::default(),
            gc_initial_delay: DEFAULT_GC_INITIAL_DELAY,
            gc_regular_delay: DEFAULT_GC_REGULAR_DELAY,
            stream: StreamSettings::default(),
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            max_watch_stream_failures: DEFAULT_MAX_WATCH_STREAM_FAILURES,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
            lease: LeaseSettings::default(),
            max_transaction_attempts: DEFAULT_MAX_TRANSACTION_ATTEMPTS,
            resume_token_max_age: DEFAULT_RESUME_TOKEN_MAX_AGE,
            synchronize_tabs: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let defaults = SyncSettings::default();
        assert!(defaults.validate().is_ok());
        assert_eq!(defaults.max_pending_writes, 10);
        assert_eq!(defaults.stream.backoff_factor, 1.5);
    }

    #[test]
    fn rejects_empty_limbo_pool() {
        let settings = SyncSettings {
            max_concurrent_limbo_resolutions: 0,
            ..SyncSettings::default()
        };
        let err = settings.validate().unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn rejects_lease_refresh_slower_than_expiry() {
        let settings = SyncSettings {
            lease: LeaseSettings {
                refresh_interval: Duration::from_secs(10),
                ..LeaseSettings::default()
            },
            ..SyncSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
