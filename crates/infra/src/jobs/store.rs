//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use redrun_core::{Job, JobId, JobStatus};

/// Key prefix shared by durable backends.
pub const DEFAULT_KEY_PREFIX: &str = "redrun:";

/// Mutation applied to a stored record by [`JobStore::update`].
///
/// Must be `Fn` so backends with optimistic concurrency can re-apply it.
pub type JobMutator<'a> = &'a (dyn Fn(&mut Job) + Send + Sync);

/// Job store abstraction.
///
/// Every successful write refreshes the record TTL.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `queued` record.
    async fn create(&self, job: &Job) -> Result<(), JobStoreError>;

    /// Atomically read, mutate and write back a record.
    ///
    /// Rejected with `InvalidTransition` (nothing written) unless the status
    /// moves along a lifecycle edge and the result/error fields stay consistent.
    async fn update(&self, job_id: JobId, mutate: JobMutator<'_>) -> Result<Job, JobStoreError>;

    /// Get a job by ID. Expired records are `NotFound`.
    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// All records currently in `running`.
    async fn list_running(&self) -> Result<Vec<Job>, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("concurrent modification of job {0}")]
    Conflict(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Apply `mutate` to a copy of `current` and check the result.
///
/// Identity, creation time and request are restored after the mutator runs;
/// `updated_at` only moves forward.
pub(crate) fn apply_mutation(
    current: &Job,
    mutate: JobMutator<'_>,
    now: DateTime<Utc>,
) -> Result<Job, JobStoreError> {
    let mut next = current.clone();
    mutate(&mut next);

    next.job_id = current.job_id;
    next.created_at = current.created_at;
    next.updated_at = current.updated_at;
    next.request = current.request.clone();

    if !current.status.can_transition_to(next.status) || next.check_consistency().is_err() {
        return Err(JobStoreError::InvalidTransition {
            job_id: current.job_id,
            from: current.status,
            to: next.status,
        });
    }

    next.touch(now);
    Ok(next)
}

pub(crate) fn check_new(job: &Job) -> Result<(), JobStoreError> {
    if job.status != JobStatus::Queued {
        return Err(JobStoreError::InvalidRecord(format!(
            "new job {} must be queued, got {}",
            job.job_id, job.status
        )));
    }
    job.check_consistency()
        .map_err(|e| JobStoreError::InvalidRecord(e.to_string()))
}

#[derive(Debug, Clone)]
struct Entry {
    job: Job,
    expires_at: Instant,
}

/// In-memory job store for tests/dev.
///
/// Expiry is evaluated lazily on access.
#[derive(Debug)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Entry>>,
    ttl: Duration,
}

impl InMemoryJobStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn arc(ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(ttl))
    }

    fn poisoned<T>(_: T) -> JobStoreError {
        JobStoreError::Storage("job store lock poisoned".to_string())
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(7 * 24 * 3600))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        check_new(job)?;
        let mut jobs = self.jobs.write().map_err(Self::poisoned)?;
        let now = Instant::now();
        if jobs.get(&job.job_id).is_some_and(|e| e.expires_at > now) {
            return Err(JobStoreError::AlreadyExists(job.job_id));
        }
        jobs.insert(
            job.job_id,
            Entry {
                job: job.clone(),
                expires_at: now + self.ttl,
            },
        );
        Ok(())
    }

    async fn update(&self, job_id: JobId, mutate: JobMutator<'_>) -> Result<Job, JobStoreError> {
        // Write lock held across read-modify-write.
        let mut jobs = self.jobs.write().map_err(Self::poisoned)?;
        let now = Instant::now();
        let expired = match jobs.get(&job_id) {
            Some(e) => e.expires_at <= now,
            None => return Err(JobStoreError::NotFound(job_id)),
        };
        if expired {
            jobs.remove(&job_id);
            return Err(JobStoreError::NotFound(job_id));
        }
        let entry = jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        let next = apply_mutation(&entry.job, mutate, Utc::now())?;
        entry.job = next.clone();
        entry.expires_at = now + self.ttl;
        Ok(next)
    }

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let jobs = self.jobs.read().map_err(Self::poisoned)?;
        match jobs.get(&job_id) {
            Some(e) if e.expires_at > Instant::now() => Ok(e.job.clone()),
            _ => Err(JobStoreError::NotFound(job_id)),
        }
    }

    async fn list_running(&self) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(Self::poisoned)?;
        let now = Instant::now();
        let mut running: Vec<Job> = jobs
            .values()
            .filter(|e| e.expires_at > now && e.job.status == JobStatus::Running)
            .map(|e| e.job.clone())
            .collect();
        running.sort_by_key(|j| j.created_at);
        Ok(running)
    }
}

#[async_trait]
impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    async fn create(&self, job: &Job) -> Result<(), JobStoreError> {
        (**self).create(job).await
    }

    async fn update(&self, job_id: JobId, mutate: JobMutator<'_>) -> Result<Job, JobStoreError> {
        (**self).update(job_id, mutate).await
    }

    async fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_running(&self) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_running().await
    }
}
