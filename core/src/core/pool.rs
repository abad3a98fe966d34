//! Bounded worker pools for the receive and scan tiers.
//!
//! A pool has a bounded queue, a core set of workers that live for the
//! process, and surplus workers (up to `max_workers`) that exit after
//! `keep_alive` without work. When the queue is full and no surplus worker can
//! be added, the submitting task runs the job itself; that is the pipeline's
//! back-pressure, nothing is ever dropped.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};

pub const KEEP_ALIVE: Duration = Duration::from_secs(60);
pub const SCAN_QUEUE_CAPACITY: usize = 1000;

type Job = BoxFuture<'static, ()>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub queue_capacity: usize,
    pub core_workers: usize,
    pub max_workers: usize,
    pub keep_alive: Duration,
}

impl PoolSizing {
    /// Cheap admission/baseline work: wide queue, at least two workers.
    pub fn receive(parallelism: usize) -> Self {
        let p = parallelism.max(1);
        Self {
            queue_capacity: p.saturating_mul(1000).clamp(1000, 5000),
            core_workers: p.max(2),
            max_workers: (2 * p).max(4),
            keep_alive: KEEP_ALIVE,
        }
    }

    /// Network-bound strategy work, capped to bound traffic at the target.
    pub fn scan(parallelism: usize) -> Self {
        let p = parallelism.max(1);
        Self {
            queue_capacity: SCAN_QUEUE_CAPACITY,
            core_workers: p,
            max_workers: 2 * p,
            keep_alive: KEEP_ALIVE,
        }
    }
}

pub fn available_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Completion signal for a submitted job.
pub struct TaskHandle(oneshot::Receiver<()>);

impl TaskHandle {
    /// Resolves when the job ends; `false` if it panicked.
    pub async fn wait(self) -> bool {
        self.0.await.is_ok()
    }
}

struct PoolInner {
    name: &'static str,
    sizing: PoolSizing,
    receiver: Mutex<mpsc::Receiver<Job>>,
    workers: AtomicUsize,
}

impl PoolInner {
    fn try_reserve_worker(&self, limit: usize) -> bool {
        self.workers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .is_ok()
    }

    async fn next_job(&self) -> Option<Job> {
        self.receiver.lock().await.recv().await
    }
}

struct WorkerGuard(Arc<PoolInner>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.workers.fetch_sub(1, Ordering::AcqRel);
    }
}

async fn run_job(pool: &'static str, job: Job) {
    if AssertUnwindSafe(job).catch_unwind().await.is_err() {
        error!("{} pool: task panicked, worker continues", pool);
    }
}

async fn worker_loop(inner: Arc<PoolInner>, first: Option<Job>, core: bool) {
    let _guard = WorkerGuard(Arc::clone(&inner));
    if let Some(job) = first {
        run_job(inner.name, job).await;
    }
    loop {
        let next = if core {
            inner.next_job().await
        } else {
            match tokio::time::timeout(inner.sizing.keep_alive, inner.next_job()).await {
                Ok(job) => job,
                Err(_) => {
                    debug!("{} pool: idle surplus worker exiting", inner.name);
                    None
                }
            }
        };
        match next {
            Some(job) => run_job(inner.name, job).await,
            None => break,
        }
    }
}

pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    inner: Arc<PoolInner>,
    caller_runs: AtomicU64,
}

impl WorkerPool {
    pub fn new(name: &'static str, sizing: PoolSizing) -> Self {
        let (sender, receiver) = mpsc::channel(sizing.queue_capacity.max(1));
        Self {
            sender,
            inner: Arc::new(PoolInner {
                name,
                sizing,
                receiver: Mutex::new(receiver),
                workers: AtomicUsize::new(0),
            }),
            caller_runs: AtomicU64::new(0),
        }
    }

    pub fn sizing(&self) -> PoolSizing {
        self.inner.sizing
    }

    pub fn active_workers(&self) -> usize {
        self.inner.workers.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.inner.sizing.queue_capacity.max(1) - self.sender.capacity()
    }

    /// Jobs that ran on the submitting task because the pool was saturated.
    pub fn caller_runs(&self) -> u64 {
        self.caller_runs.load(Ordering::Relaxed)
    }

    fn spawn_worker(&self, first: Option<Job>, core: bool) {
        tokio::spawn(worker_loop(Arc::clone(&self.inner), first, core));
    }

    /// Submits a job. Must be called from within a tokio runtime.
    ///
    /// Order of preference: a new core worker, the queue, a new surplus
    /// worker, and finally running the job on the caller.
    pub async fn execute<F>(&self, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            task.await;
            let _ = done_tx.send(());
        });

        let sizing = self.inner.sizing;
        if self.inner.try_reserve_worker(sizing.core_workers) {
            self.spawn_worker(Some(job), true);
            return TaskHandle(done_rx);
        }

        match self.sender.try_send(job) {
            Ok(()) => {
                // pools without core workers still need someone to drain the queue
                if self.active_workers() == 0 && self.inner.try_reserve_worker(sizing.max_workers) {
                    self.spawn_worker(None, false);
                }
            }
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                if self.inner.try_reserve_worker(sizing.max_workers) {
                    self.spawn_worker(Some(job), false);
                } else {
                    self.caller_runs.fetch_add(1, Ordering::Relaxed);
                    debug!("{} pool saturated, running task on caller", self.inner.name);
                    run_job(self.inner.name, job).await;
                }
            }
        }
        TaskHandle(done_rx)
    }
}
