//! Fixed-size worker pool draining a shared FIFO job queue.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::WorkerPoolConfig;
use crate::error::{Result, TaskerError};

type JobFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// A named unit of work for a pool worker.
pub struct Job {
    pub name: String,
    future: JobFuture,
}

impl Job {
    pub fn new<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            future: Box::pin(future),
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    jobs_submitted: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
}

/// Snapshot of pool activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub jobs_submitted: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
}

/// N tokio workers pulling jobs from one shared queue in submit order.
///
/// Job failures are terminal at the pool boundary: the error is logged and
/// counted, and the worker moves on. Anything that must be answered (an
/// error reply, a status rollback) happens inside the job before it returns.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    sender: mpsc::UnboundedSender<Job>,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Job>>>,
    running: Arc<AtomicBool>,
    counters: Arc<PoolCounters>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            config,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PoolCounters::default()),
            workers: Vec::new(),
        }
    }

    /// Spawn the worker tasks. Idempotent; a second call is a no-op.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let poll_timeout = Duration::from_secs(self.config.poll_timeout_seconds);
        for worker_id in 0..self.config.workers {
            let receiver = Arc::clone(&self.receiver);
            let running = Arc::clone(&self.running);
            let counters = Arc::clone(&self.counters);
            self.workers.push(tokio::spawn(async move {
                debug!(worker_id, "worker started");
                while running.load(Ordering::SeqCst) {
                    // Hold the queue lock only while polling, not while
                    // running the job, so workers drain in parallel.
                    let job = {
                        let mut receiver = receiver.lock().await;
                        match tokio::time::timeout(poll_timeout, receiver.recv()).await {
                            Ok(Some(job)) => job,
                            Ok(None) => break,
                            Err(_elapsed) => continue,
                        }
                    };
                    debug!(worker_id, job = %job.name, "job started");
                    match job.future.await {
                        Ok(()) => {
                            counters.jobs_completed.fetch_add(1, Ordering::Relaxed);
                            debug!(worker_id, job = %job.name, "job finished");
                        }
                        Err(e) => {
                            counters.jobs_failed.fetch_add(1, Ordering::Relaxed);
                            error!(worker_id, job = %job.name, error = %e, "job failed");
                        }
                    }
                }
                debug!(worker_id, "worker stopped");
            }));
        }
        info!(workers = self.config.workers, "worker pool started");
    }

    /// Queue a job. Fails once the pool has been shut down.
    pub fn submit(&self, job: Job) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TaskerError::Runtime("worker pool is not running".to_string()));
        }
        self.counters.jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.sender
            .send(job)
            .map_err(|_| TaskerError::Runtime("worker pool queue is closed".to_string()))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            jobs_submitted: self.counters.jobs_submitted.load(Ordering::Relaxed),
            jobs_completed: self.counters.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.counters.jobs_failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting work and wait for every worker to exit. In-flight
    /// jobs run to completion; queued-but-unstarted jobs are dropped once
    /// the workers observe the stop flag on their next poll.
    pub async fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("worker pool shutting down");
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("worker pool stopped");
    }
}
