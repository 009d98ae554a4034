use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::time::Duration;

use crate::error::FirestoreError;
use crate::util::{AsyncQueue, DelayedOperation, TimerId};

/// Whether the client believes it can reach the backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum OnlineState {
    /// Neither confirmed online nor offline; the initial state, and the state
    /// while a connection attempt is in flight.
    #[default]
    Unknown,
    Online,
    /// Snapshots are raised from cache without waiting for the backend.
    Offline,
}

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    online_state_timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

struct TrackerInner {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    max_watch_stream_failures: u32,
    online_state_timeout: Duration,
    state: StdMutex<TrackerState>,
}

/// Derives the [`OnlineState`] from watch stream health.
///
/// A successful watch response reports `Online`. Failures only flip to
/// `Offline` after `max_watch_stream_failures` consecutive attempts, or when
/// a connection attempt is not answered within the timeout.
#[derive(Clone)]
pub struct OnlineStateTracker {
    inner: Arc<TrackerInner>,
}

impl OnlineStateTracker {
    pub fn new(
        queue: AsyncQueue,
        max_watch_stream_failures: u32,
        online_state_timeout: Duration,
        handler: OnlineStateHandler,
    ) -> Self {
        Self {
            inner: Arc::new(TrackerInner {
                queue,
                handler,
                max_watch_stream_failures,
                online_state_timeout,
                state: StdMutex::new(TrackerState {
                    state: OnlineState::Unknown,
                    watch_stream_failures: 0,
                    online_state_timer: None,
                    should_warn_client_is_offline: true,
                }),
            }),
        }
    }

    pub fn state(&self) -> OnlineState {
        self.lock().state
    }

    /// Called when the watch stream starts connecting.
    pub fn handle_watch_stream_start(&self) {
        {
            let state = self.lock();
            if state.watch_stream_failures != 0 {
                return;
            }
        }
        self.set_and_broadcast(OnlineState::Unknown);

        let weak: Weak<TrackerInner> = Arc::downgrade(&self.inner);
        let timer = self.inner.queue.enqueue_after_delay(
            TimerId::OnlineStateTimeout,
            self.inner.online_state_timeout,
            move || async move {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let tracker = OnlineStateTracker { inner };
                tracker.lock().online_state_timer = None;
                let timeout = tracker.inner.online_state_timeout;
                tracker.log_offline_warning(&format!("Backend didn't respond within {} seconds.", timeout.as_secs()));
                tracker.set_and_broadcast(OnlineState::Offline);
            },
        );
        self.lock().online_state_timer = Some(timer);
    }

    /// Called when the watch stream failed to connect or closed with an error.
    pub fn handle_watch_stream_failure(&self, error: Option<&FirestoreError>) {
        let offline = {
            let mut state = self.lock();
            if state.state == OnlineState::Online {
                None
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures >= self.inner.max_watch_stream_failures {
                    if let Some(timer) = state.online_state_timer.take() {
                        timer.cancel();
                    }
                    Some(state.watch_stream_failures)
                } else {
                    return;
                }
            }
        };
        match offline {
            None => self.set_and_broadcast(OnlineState::Unknown),
            Some(failures) => {
                let cause = error.map(|err| format!(" Most recent error: {err}")).unwrap_or_default();
                self.log_offline_warning(&format!(
                    "Connection failed {failures} times.{cause}"
                ));
                self.set_and_broadcast(OnlineState::Offline);
            }
        }
    }

    /// Explicitly sets the state, e.g. `Online` once the watch stream delivered
    /// data or `Offline` when the network was disabled.
    pub fn set(&self, new_state: OnlineState) {
        {
            let mut state = self.lock();
            if let Some(timer) = state.online_state_timer.take() {
                timer.cancel();
            }
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                // A client that connected once is not warned again.
                state.should_warn_client_is_offline = false;
            }
        }
        self.set_and_broadcast(new_state);
    }

    fn set_and_broadcast(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.lock();
            let changed = state.state != new_state;
            state.state = new_state;
            changed
        };
        if changed {
            (self.inner.handler)(new_state);
        }
    }

    fn log_offline_warning(&self, details: &str) {
        let warn = {
            let mut state = self.lock();
            std::mem::replace(&mut state.should_warn_client_is_offline, false)
        };
        let message = format!(
            "Could not reach the backend. {details} The client will operate in offline mode until it can establish a connection."
        );
        if warn {
            log::warn!("{message}");
        } else {
            log::debug!("{message}");
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.inner.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}
