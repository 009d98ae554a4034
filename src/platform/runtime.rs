//! Task spawning, timers and the wall clock for native and wasm32 targets.
//!
//! Native builds spawn onto the caller's tokio runtime when there is one and
//! onto a private single-worker runtime otherwise, so the sync components can
//! be driven from synchronous code too.

use std::future::Future;
use std::time::Duration;

#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Runs `future` in the background; its output is discarded.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static SYNC_WORKER: LazyLock<Runtime> = LazyLock::new(|| {
        Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("firestore-sync")
            .enable_all()
            .build()
            .expect("failed to build the sync worker runtime")
    });

    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(future);
        }
        Err(_) => {
            SYNC_WORKER.spawn(future);
        }
    }
}

/// Milliseconds since the Unix epoch. Lease and heartbeat rows are stamped
/// with it, so every instance sharing a store must read the same clock.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    #[cfg(target_arch = "wasm32")]
    gloo_timers::future::sleep(duration).await;
    #[cfg(not(target_arch = "wasm32"))]
    tokio::time::sleep(duration).await;
}
