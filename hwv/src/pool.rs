//! Bounded pool for background workers.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Worker pool is shut down")]
    Closed,
}

/// Runs at most `max_workers` futures at a time.
///
/// Every spawned future first acquires a permit; queued futures wait for a
/// slot. The pool is cheap to clone and all clones share the same slots.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    max_workers: usize,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                max_workers,
                permits: Arc::new(Semaphore::new(max_workers)),
                tasks: Mutex::new(JoinSet::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Workers currently holding a slot.
    pub fn active(&self) -> usize {
        self.inner.max_workers - self.inner.permits.available_permits()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn spawn<F>(&self, work: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        let permits = Arc::clone(&self.inner.permits);
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished workers so the set does not grow for the whole run.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            work.await;
        });
        Ok(())
    }

    /// Refuse new work and wait for spawned workers, aborting stragglers after `grace`.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut tasks = {
            let mut guard = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        let pending = tasks.len();
        if pending > 0 {
            debug!(pending, "Waiting for background workers");
        }
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "Background workers still running after {:?}, aborting", grace
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.shutdown(Duration::from_secs(5)).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_spawn_after_shutdown_is_rejected() {
        let pool = WorkerPool::new(1);
        pool.shutdown(Duration::from_millis(10)).await;
        assert_eq!(pool.spawn(async {}), Err(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_shutdown_aborts_stragglers() {
        let pool = WorkerPool::new(1);
        pool.spawn(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .unwrap();
        let started = std::time::Instant::now();
        pool.shutdown(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
