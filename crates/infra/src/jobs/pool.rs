//! Pool of worker tasks draining the job queue.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use redrun_core::JobStatus;

use super::executor::{ExecuteError, JobExecutor};
use super::queue::JobQueue;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Name for logging
    pub name: String,
    /// Number of worker tasks; each runs one job at a time.
    pub concurrency: usize,
    /// Idle pause between empty dequeues.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "worker-pool".to_string(),
            concurrency: 2,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerPoolStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_rejected: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    running: AtomicUsize,
}

impl Counters {
    fn record(&self, result: &Result<redrun_core::Job, ExecuteError>) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(job) if job.status == JobStatus::Succeeded => &self.succeeded,
            Ok(_) | Err(ExecuteError::Store(_)) => &self.failed,
            Err(ExecuteError::Rejected { .. }) => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle to control a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Stop taking new jobs and wait for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker task ended abnormally");
            }
        }
    }

    /// Get current pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        let c = &self.counters;
        WorkerPoolStats {
            jobs_processed: c.processed.load(Ordering::Relaxed),
            jobs_succeeded: c.succeeded.load(Ordering::Relaxed),
            jobs_failed: c.failed.load(Ordering::Relaxed),
            jobs_rejected: c.rejected.load(Ordering::Relaxed),
            current_running: c.running.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn `config.concurrency` worker tasks on the current runtime.
    pub fn spawn(
        executor: Arc<JobExecutor>,
        queue: Arc<dyn JobQueue>,
        config: WorkerPoolConfig,
    ) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let workers = (0..config.concurrency.max(1))
            .map(|index| {
                let worker = Worker {
                    name: format!("{}-{index}", config.name),
                    executor: executor.clone(),
                    queue: queue.clone(),
                    counters: counters.clone(),
                    poll_interval: config.poll_interval,
                };
                tokio::spawn(worker.run(shutdown_rx.clone()))
            })
            .collect();

        info!(
            pool = %config.name,
            concurrency = config.concurrency,
            "worker pool started"
        );

        WorkerPoolHandle {
            shutdown: shutdown_tx,
            workers,
            counters,
            started: Instant::now(),
        }
    }
}

struct Worker {
    name: String,
    executor: Arc<JobExecutor>,
    queue: Arc<dyn JobQueue>,
    counters: Arc<Counters>,
    poll_interval: Duration,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        debug!(worker = %self.name, "worker started");

        while !*shutdown.borrow() {
            let payload = match self.queue.dequeue().await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "dequeue failed");
                    if !self.idle(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            debug!(worker = %self.name, job_id = %payload.job_id, "claimed job");
            self.counters.running.fetch_add(1, Ordering::Relaxed);
            let result = self.executor.execute(payload).await;
            self.counters.running.fetch_sub(1, Ordering::Relaxed);

            if let Err(ExecuteError::Store(e)) = &result {
                error!(worker = %self.name, error = %e, "job store error during execution");
            }
            self.counters.record(&result);
        }

        debug!(worker = %self.name, "worker stopped");
    }

    /// Sleep for the poll interval. `false` once the pool is going away.
    async fn idle(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }
}
