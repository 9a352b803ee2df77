//! Bounded async worker pool.
//!
//! A fixed number of worker tasks pull jobs from one bounded queue.
//! Submission never waits: when every worker is busy and the queue is
//! full the job is handed back as rejected.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A unit of work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks
    pub num_workers: usize,
    /// Jobs that may wait for a free worker
    pub queue_capacity: usize,
}

/// Why a job was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// All workers busy and queue full
    #[error("worker pool saturated")]
    QueueFull,
    /// Pool no longer accepts work
    #[error("worker pool shutting down")]
    ShuttingDown,
}

/// Pool-wide statistics
#[derive(Debug, Default)]
pub struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
}

impl PoolStats {
    /// Jobs accepted
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    /// Jobs run to completion
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Jobs refused
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Async worker pool
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    job_tx: mpsc::Sender<Job>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PoolStats>,
}

impl WorkerPool {
    /// Spawn `config.num_workers` workers (at least one).
    pub fn new(config: PoolConfig) -> Self {
        let num_workers = config.num_workers.max(1);
        let queue_capacity = config.queue_capacity.max(1);

        debug!(
            "Creating worker pool with {} workers (queue capacity: {})",
            num_workers, queue_capacity
        );

        let (job_tx, job_rx) = mpsc::channel::<Job>(queue_capacity);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let stats = Arc::new(PoolStats::default());

        let workers = (0..num_workers)
            .map(|id| {
                let job_rx = Arc::clone(&job_rx);
                let stats = Arc::clone(&stats);
                tokio::spawn(async move {
                    loop {
                        // Hold the lock only while waiting for the next job.
                        let job = job_rx.lock().await.recv().await;
                        let Some(job) = job else {
                            break;
                        };
                        job.await;
                        stats.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    debug!("Worker {} exiting", id);
                })
            })
            .collect();

        Self {
            workers,
            job_tx,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats,
        }
    }

    /// Queue a job without waiting.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::QueueFull` when saturated and
    /// `PoolError::ShuttingDown` after [`shutdown`](Self::shutdown).
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.shutdown.load(Ordering::Acquire) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PoolError::ShuttingDown);
        }

        match self.job_tx.try_send(Box::pin(job)) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(PoolError::ShuttingDown)
            }
        }
    }

    /// Stop accepting jobs; queued jobs still run.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Stop accepting jobs and wait for every queued job to finish.
    pub async fn shutdown(self) {
        self.close();
        let WorkerPool {
            workers,
            job_tx,
            stats,
            ..
        } = self;
        drop(job_tx);

        for worker in workers {
            let _ = worker.await;
        }

        info!(
            "Worker pool shut down ({} completed, {} rejected)",
            stats.completed(),
            stats.rejected()
        );
    }

    /// Number of worker tasks
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Pool statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<PoolStats> {
        &self.stats
    }
}
