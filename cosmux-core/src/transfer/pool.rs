//! Bounded worker pool
//!
//! Runs part transfers on the tokio runtime with at most `concurrency` in
//! flight. The first failure is kept, cancels the remaining work and is
//! returned from every later `submit` and `join`.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TransferError};

type TaskFn<T> = Arc<dyn Fn(CancellationToken, T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Fail-fast pool of concurrent tasks over items of type `T`
pub struct WorkerPool<T> {
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    first_error: Arc<Mutex<Option<TransferError>>>,
    /// Child of the caller's token; cancelled on the first failure
    cancel: CancellationToken,
    task_fn: TaskFn<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Create a pool running `task_fn` for every submitted item
    pub fn new<F, Fut>(concurrency: usize, cancel: &CancellationToken, task_fn: F) -> Self
    where
        F: Fn(CancellationToken, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            tasks: JoinSet::new(),
            first_error: Arc::new(Mutex::new(None)),
            cancel: cancel.child_token(),
            task_fn: Arc::new(move |token, item| task_fn(token, item).boxed()),
        }
    }

    /// Start a task for `item` once a slot is free
    ///
    /// Returns the first recorded failure instead of starting new work, or
    /// `Cancelled` if the caller's token fired. With `is_final` the task is
    /// run to completion before returning.
    pub async fn submit(&mut self, item: T, is_final: bool) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(self.error_or_cancelled());
        }

        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(self.error_or_cancelled()),
            permit = self.semaphore.clone().acquire_owned() => permit
                .map_err(|_| TransferError::internal("worker pool semaphore closed"))?,
        };

        let token = self.cancel.clone();
        let fut = (self.task_fn)(token.clone(), item);
        let first_error = self.first_error.clone();

        if is_final {
            if let Err(e) = fut.await {
                record_failure(&first_error, &token, e);
            }
            drop(permit);
            return match self.first_error.lock().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            };
        }

        self.tasks.spawn(async move {
            // Record before freeing the slot so no new work starts past a failure
            if let Err(e) = fut.await {
                record_failure(&first_error, &token, e);
            }
            drop(permit);
        });
        Ok(())
    }

    /// Wait for submitted work
    ///
    /// With `wait_for_stragglers` every task is drained before the first
    /// error is returned. Without it the call returns as soon as any task has
    /// failed; the rest keep running until a later `join(true)` or drop.
    pub async fn join(&mut self, wait_for_stragglers: bool) -> Result<()> {
        loop {
            let next = if wait_for_stragglers {
                self.tasks.join_next().await
            } else {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(self.error_or_cancelled()),
                    next = self.tasks.join_next() => next,
                }
            };

            match next {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    let err = if e.is_panic() {
                        TransferError::internal(format!("worker task panicked: {}", e))
                    } else {
                        TransferError::Cancelled
                    };
                    record_failure(&self.first_error, &self.cancel, err);
                }
                None => break,
            }
        }

        if let Some(e) = self.first_error.lock().clone() {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        Ok(())
    }

    /// Cancel every running and future task
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Tasks spawned and not yet joined
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    fn error_or_cancelled(&self) -> TransferError {
        self.first_error
            .lock()
            .clone()
            .unwrap_or(TransferError::Cancelled)
    }
}

impl<T> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        // JoinSet aborts its tasks on drop; the token reaches work already
        // handed to other runtimes
        self.cancel.cancel();
    }
}

fn record_failure(
    slot: &Mutex<Option<TransferError>>,
    cancel: &CancellationToken,
    err: TransferError,
) {
    {
        let mut first = slot.lock();
        match first.as_ref() {
            None => *first = Some(err),
            Some(_) => debug!("Suppressed follow-up worker error: {}", err),
        }
    }
    cancel.cancel();
}
