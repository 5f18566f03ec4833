//! Bounded worker pool for steps, partitions and split flows.
//!
//! Units of work are tokio tasks gated by a semaphore. `submit` waits for a
//! permit inside the spawned task, so callers never block on submission.
//! `spawn_coordinator` skips the permit: coordinators (job controllers, split
//! flows) only wait on other pool work, and holding a permit while waiting on
//! nested work would let a deep definition exhaust the pool and deadlock.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("work '{0}' was cancelled")]
    Cancelled(String),

    #[error("work '{0}' panicked")]
    Panicked(String),

    #[error("worker pool is shut down")]
    Closed,
}

/// Handle to one submitted unit of work.
pub struct WorkHandle<T> {
    label: String,
    join: JoinHandle<Result<T, WorkerError>>,
    cancel: CancellationToken,
}

impl<T> WorkHandle<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the work to finish.
    pub async fn join(self) -> Result<T, WorkerError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(WorkerError::Panicked(self.label)),
            Err(_) => Err(WorkerError::Cancelled(self.label)),
        }
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held by running work.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `work` once a pool permit is free.
    pub fn submit<T, F>(&self, label: impl Into<String>, work: F) -> WorkHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let label = label.into();
        let cancel = CancellationToken::new();
        let permits = Arc::clone(&self.permits);
        let token = cancel.clone();
        let task_label = label.clone();

        let join = tokio::spawn(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(WorkerError::Closed),
                },
                _ = token.cancelled() => return Err(WorkerError::Cancelled(task_label)),
            };
            tracing::trace!(work = task_label.as_str(), "worker permit acquired");
            tokio::select! {
                output = work => Ok(output),
                _ = token.cancelled() => Err(WorkerError::Cancelled(task_label)),
            }
        });

        WorkHandle { label, join, cancel }
    }

    /// Run `work` immediately, outside the permit budget.
    pub fn spawn_coordinator<T, F>(&self, label: impl Into<String>, work: F) -> WorkHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let label = label.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_label = label.clone();

        let join = tokio::spawn(async move {
            tokio::select! {
                output = work => Ok(output),
                _ = token.cancelled() => Err(WorkerError::Cancelled(task_label)),
            }
        });

        WorkHandle { label, join, cancel }
    }

    /// Join barrier: wait for every handle, results in submission order.
    pub async fn await_all<T>(&self, handles: Vec<WorkHandle<T>>) -> Vec<Result<T, WorkerError>> {
        join_all(handles.into_iter().map(WorkHandle::join)).await
    }

    /// Abort one unit of work. The engine prefers cooperative stop tokens;
    /// this drops the work at its next suspension point.
    pub fn cancel<T>(&self, handle: &WorkHandle<T>) {
        tracing::debug!(work = handle.label.as_str(), "cancelling work");
        handle.cancel.cancel();
    }

    /// Refuse new permits. Work already holding one runs to completion.
    pub fn shutdown(&self) {
        self.permits.close();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn await_all_keeps_submission_order() {
        let pool = WorkerPool::new(2);
        let handles: Vec<_> = (0..5u64)
            .map(|i| {
                pool.submit(format!("work-{i}"), async move {
                    tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                    i
                })
            })
            .collect();
        let results = pool.await_all(handles).await;
        let values: Vec<u64> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn submit_respects_pool_bound() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.submit(format!("bounded-{i}"), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for result in pool.await_all(handles).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn cancel_reports_cancelled() {
        let pool = WorkerPool::new(1);
        let handle = pool.submit("sleepy", async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        pool.cancel(&handle);
        assert_eq!(
            handle.join().await,
            Err(WorkerError::Cancelled("sleepy".to_string()))
        );
    }

    #[tokio::test]
    async fn coordinators_do_not_consume_permits() {
        let pool = WorkerPool::new(1);
        let inner_pool = pool.clone();
        let outer = pool.spawn_coordinator("outer", async move {
            let inner = inner_pool.submit("inner", async { 7 });
            inner.join().await
        });
        assert_eq!(outer.join().await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn shutdown_closes_submission() {
        let pool = WorkerPool::new(1);
        pool.shutdown();
        let handle = pool.submit("late", async { 1 });
        assert_eq!(handle.join().await, Err(WorkerError::Closed));
    }
}
