//! Ordered worker queue that serializes every state mutation of a client.
//!
//! Network callbacks, timers and caller requests never touch shared state
//! directly; they enqueue an operation and the single worker runs operations
//! one at a time in submission order.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{failed_precondition, is_retryable_storage_error, FirestoreResult};
use crate::platform::runtime;
use crate::util::backoff::ExponentialBackoff;

/// Well-known timers so delayed operations can be identified in logs and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    ClientMetadataRefresh,
    LruGarbageCollection,
    RetryTransaction,
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone, Debug)]
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Prevents the operation from running. Safe to call after it already ran.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct QueueInner {
    sender: async_channel::Sender<BoxFuture<'static, ()>>,
    shutting_down: AtomicBool,
}

#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<BoxFuture<'static, ()>>();
        runtime::spawn_detached(async move {
            while let Ok(task) = receiver.recv().await {
                task.await;
            }
        });
        Self {
            inner: Arc::new(QueueInner {
                sender,
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Runs `op` on the worker and resolves with its result.
    ///
    /// Must not be awaited from inside another queued operation.
    pub fn enqueue<F, T>(&self, op: F) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let accepted = !self.is_shutting_down()
            && self
                .push(
                    async move {
                        let _ = tx.send(op.await);
                    }
                    .boxed(),
                )
                .is_ok();
        async move {
            if !accepted {
                return Err(terminated_error());
            }
            rx.await.unwrap_or_else(|_| Err(terminated_error()))
        }
    }

    /// Schedules `op` without waiting for it. Dropped once the queue shuts down.
    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            return;
        }
        if self.push(op.boxed()).is_err() {
            log::debug!("Dropping operation scheduled after the queue closed");
        }
    }

    /// Runs `op` on the worker after `delay` unless cancelled first.
    pub fn enqueue_after_delay<F, Fut>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = DelayedOperation {
            timer_id,
            cancelled: Arc::new(AtomicBool::new(false)),
        };
        let cancelled = handle.cancelled.clone();
        let queue = self.clone();
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if cancelled.load(Ordering::SeqCst) {
                return;
            }
            queue.enqueue_and_forget(async move {
                // Cancellation may have raced with the timer firing.
                if cancelled.swap(true, Ordering::SeqCst) {
                    return;
                }
                op().await;
            });
        });
        handle
    }

    /// Runs `op`, re-enqueueing it with backoff while it fails with a retryable storage error.
    pub fn enqueue_retryable<F, Fut>(&self, op: F, backoff: ExponentialBackoff)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let queue = self.clone();
        self.enqueue_and_forget(run_retryable(queue, op, backoff));
    }

    /// Runs `op` as the last operation; later submissions are rejected.
    pub fn enqueue_and_initiate_shutdown<F>(&self, op: F) -> impl Future<Output = FirestoreResult<()>> + Send + 'static
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let already_shut_down = self.inner.shutting_down.swap(true, Ordering::SeqCst);
        let sender = self.inner.sender.clone();
        let pushed = !already_shut_down
            && self
                .push(
                    async move {
                        op.await;
                        sender.close();
                        let _ = tx.send(());
                    }
                    .boxed(),
                )
                .is_ok();
        async move {
            if pushed {
                rx.await.map_err(|_| terminated_error())?;
            }
            Ok(())
        }
    }

    fn push(&self, task: BoxFuture<'static, ()>) -> Result<(), ()> {
        self.inner.sender.try_send(task).map_err(|_| ())
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn run_retryable<F, Fut>(queue: AsyncQueue, mut op: F, mut backoff: ExponentialBackoff) -> BoxFuture<'static, ()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
{
    async move {
        match op().await {
            Ok(()) => {}
            Err(err) if is_retryable_storage_error(&err) => {
                let delay = backoff.next_delay();
                log::debug!("Operation failed with retryable error {err}; retrying in {delay:?}");
                let retry_queue = queue.clone();
                queue.enqueue_after_delay(TimerId::RetryTransaction, delay, move || {
                    run_retryable(retry_queue, op, backoff)
                });
            }
            Err(err) => log::error!("Queued operation failed: {err}"),
        }
    }
    .boxed()
}

fn terminated_error() -> crate::error::FirestoreError {
    failed_precondition("The client has already been terminated.")
}
