//! Bounded worker pool for business callbacks.
//!
//! Workers are tokio tasks spawned lazily up to `size`. A worker that
//! finishes a task parks itself on the idle stack with a fresh oneshot
//! channel and waits for the next one; the purger drops the senders of
//! workers parked longer than `expiry`, which ends them.
//!
//! When every worker is busy, `submit` either fails fast with
//! [`PoolError::Saturated`] (non-blocking) or waits for a worker to park
//! (blocking). Tasks are never cancelled once accepted.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use wsgate_core::errors::PoolError;

use crate::metrics::POOL_TASK_PANICS_TOTAL;

/// A unit of work accepted by the pool.
pub type PoolTask = BoxFuture<'static, ()>;

/// Pool parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum number of concurrent workers.
    pub size: usize,
    /// How long a worker may stay idle before it is retired.
    pub expiry: Duration,
    /// Reject instead of waiting when every worker is busy.
    pub nonblocking: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10_000,
            expiry: Duration::from_secs(10),
            nonblocking: true,
        }
    }
}

struct IdleWorker {
    tx: oneshot::Sender<PoolTask>,
    since: Instant,
}

#[derive(Default)]
struct PoolState {
    /// Parked workers, oldest first.
    idle: Vec<IdleWorker>,
    /// Spawned workers, busy or parked.
    running: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Notify,
    closed: AtomicBool,
}

/// Cloneable handle to the pool.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.inner.config.size)
            .field("running", &self.running())
            .field("idle", &self.idle())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkerPool {
    /// Build an empty pool. No worker is spawned until the first submit.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        if config.size == 0 {
            return Err(PoolError::InvalidSize);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(PoolState::default()),
                available: Notify::new(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Run `task` on a pool worker.
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut task: PoolTask = Box::pin(task);
        loop {
            if self.is_closed() {
                return Err(PoolError::Closed);
            }
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            let _ = notified.as_mut().enable();

            match self.try_dispatch(task) {
                Ok(()) => return Ok(()),
                Err(rejected) => task = rejected,
            }
            if self.inner.config.nonblocking {
                return Err(PoolError::Saturated {
                    capacity: self.inner.config.size,
                });
            }
            notified.await;
        }
    }

    /// Hand `task` to a parked worker or spawn a new one; give it back when
    /// the pool is full.
    fn try_dispatch(&self, mut task: PoolTask) -> Result<(), PoolTask> {
        let mut state = self.inner.state.lock();
        while let Some(worker) = state.idle.pop() {
            match worker.tx.send(task) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    // Worker task is gone (runtime shutting down).
                    state.running = state.running.saturating_sub(1);
                    task = returned;
                }
            }
        }
        if state.running >= self.inner.config.size {
            return Err(task);
        }
        state.running += 1;
        drop(state);

        let inner = Arc::clone(&self.inner);
        let _ = tokio::spawn(worker_loop(inner, task));
        Ok(())
    }

    /// Retire workers idle longer than `expiry`, checking once per `expiry`.
    pub fn start_purger(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let period = inner.config.expiry.max(Duration::from_millis(1));
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let retired = purge(&inner, Instant::now());
                        if retired > 0 {
                            debug!(retired, "retired idle workers");
                        }
                    }
                }
            }
        })
    }

    /// Stop accepting tasks and retire parked workers. Busy workers finish
    /// their current task and exit.
    pub fn release(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let parked = {
            let mut state = self.inner.state.lock();
            let parked = std::mem::take(&mut state.idle);
            state.running = state.running.saturating_sub(parked.len());
            parked
        };
        drop(parked);
        self.inner.available.notify_waiters();
        debug!("worker pool released");
    }

    /// Maximum number of workers.
    pub fn capacity(&self) -> usize {
        self.inner.config.size
    }

    /// Spawned workers, busy or parked.
    pub fn running(&self) -> usize {
        self.inner.state.lock().running
    }

    /// Parked workers.
    pub fn idle(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// Whether `release` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

async fn worker_loop(inner: Arc<PoolInner>, first: PoolTask) {
    let mut task = first;
    loop {
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!("pool task panicked");
            counter!(POOL_TASK_PANICS_TOTAL).increment(1);
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut state = inner.state.lock();
            if inner.closed.load(Ordering::Acquire) {
                state.running = state.running.saturating_sub(1);
                return;
            }
            state.idle.push(IdleWorker {
                tx,
                since: Instant::now(),
            });
        }
        inner.available.notify_one();

        match rx.await {
            Ok(next) => task = next,
            // Sender dropped by the purger or by release.
            Err(_) => return,
        }
    }
}

fn purge(inner: &PoolInner, now: Instant) -> usize {
    let expiry = inner.config.expiry;
    let stale = {
        let mut state = inner.state.lock();
        let count = state
            .idle
            .iter()
            .take_while(|w| now.duration_since(w.since) >= expiry)
            .count();
        state.running = state.running.saturating_sub(count);
        state.idle.drain(..count).collect::<Vec<_>>()
    };
    stale.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn pool(size: usize, nonblocking: bool) -> WorkerPool {
        WorkerPool::new(PoolConfig {
            size,
            expiry: Duration::from_secs(10),
            nonblocking,
        })
        .unwrap()
    }

    async fn explode() {
        panic!("task failure");
    }

    async fn settle(pool: &WorkerPool, idle: usize) {
        for _ in 0..1_000 {
            if pool.idle() == idle {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("pool never reached {idle} idle workers");
    }

    #[test]
    fn zero_size_rejected() {
        let result = WorkerPool::new(PoolConfig {
            size: 0,
            ..PoolConfig::default()
        });
        assert_matches!(result, Err(PoolError::InvalidSize));
    }

    #[tokio::test]
    async fn runs_submitted_task() {
        let pool = pool(2, true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        pool.submit(async move {
            let _ = tx.send(7);
        })
        .await
        .unwrap();
        assert_eq!(rx.recv().await, Some(7));
    }

    #[tokio::test]
    async fn worker_is_reused_after_parking() {
        let pool = pool(4, true);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
            settle(&pool, 1).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(pool.running(), 1);
    }

    #[tokio::test]
    async fn nonblocking_pool_rejects_when_saturated() {
        let pool = pool(1, true);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = release_rx.await;
        })
        .await
        .unwrap();

        let result = pool.submit(async {}).await;
        assert_eq!(result, Err(PoolError::Saturated { capacity: 1 }));

        release_tx.send(()).unwrap();
        settle(&pool, 1).await;
        pool.submit(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn blocking_pool_waits_for_worker() {
        let pool = pool(1, false);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        pool.submit(async move {
            let _ = release_rx.await;
        })
        .await
        .unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.submit(async move {
                    let _ = done_tx.send(());
                })
                .await
            })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        release_tx.send(()).unwrap();
        waiter.await.unwrap().unwrap();
        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn panicking_task_leaves_worker_alive() {
        let pool = pool(1, true);
        pool.submit(explode()).await.unwrap();
        settle(&pool, 1).await;

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            let _ = tx.send(1);
        })
        .await
        .unwrap();
        assert_eq!(rx.await.unwrap(), 1);
        assert_eq!(pool.running(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn purger_retires_expired_workers() {
        let pool = pool(4, true);
        let cancel = CancellationToken::new();
        let _purger = pool.start_purger(cancel.clone());

        pool.submit(async {}).await.unwrap();
        settle(&pool, 1).await;
        assert_eq!(pool.running(), 1);

        time::sleep(Duration::from_secs(21)).await;
        settle(&pool, 0).await;
        assert_eq!(pool.running(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn released_pool_rejects() {
        let pool = pool(2, false);
        pool.submit(async {}).await.unwrap();
        settle(&pool, 1).await;

        pool.release();
        assert!(pool.is_closed());
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.submit(async {}).await, Err(PoolError::Closed));
    }
}
