//! Blocking-style wait for a job to reach a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use redrun_core::{Job, JobId};

use super::store::{JobStore, JobStoreError};

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    /// The caller gave up. The job itself is unaffected.
    #[error("job {job_id} did not finish within {}s", waited.as_secs_f64())]
    Timeout { job_id: JobId, waited: Duration },
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is inconsistent: {reason}")]
    Inconsistent { job_id: JobId, reason: String },
    #[error(transparent)]
    Store(JobStoreError),
}

impl From<JobStoreError> for WaitError {
    fn from(e: JobStoreError) -> Self {
        match e {
            JobStoreError::NotFound(id) => WaitError::NotFound(id),
            other => WaitError::Store(other),
        }
    }
}

/// Polls the store until a job is terminal. Holds no locks.
#[derive(Clone)]
pub struct Waiter {
    store: Arc<dyn JobStore>,
    poll_interval: Duration,
}

impl Waiter {
    pub fn new(store: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    pub async fn wait(&self, job_id: JobId, timeout: Duration) -> Result<Job, WaitError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let job = self.store.get(job_id).await?;
            if job.status.is_terminal() {
                job.check_consistency().map_err(|e| {
                    warn!(job_id = %job_id, error = %e, "terminal record is inconsistent");
                    WaitError::Inconsistent {
                        job_id,
                        reason: e.to_string(),
                    }
                })?;
                debug!(job_id = %job_id, status = %job.status, "wait finished");
                return Ok(job);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout {
                    job_id,
                    waited: now - started,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
