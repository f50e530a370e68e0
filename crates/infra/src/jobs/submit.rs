//! Test run submission: validate, record, enqueue.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use redrun_core::{
    ClientConfig, DomainError, Job, JobId, RedactedRequest, TestRunRequest, ValidationPolicy,
};

use super::queue::{JobQueue, QueueError};
use super::store::{JobStore, JobStoreError};
use super::types::JobPayload;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    /// The record exists (as `queued`) but no worker will ever see it.
    #[error("job {job_id} recorded but not enqueued: {source}")]
    Queue {
        job_id: JobId,
        #[source]
        source: QueueError,
    },
}

/// Server-side models every run uses besides the tested one.
#[derive(Debug, Clone, PartialEq)]
pub struct AuxiliaryModels {
    pub attack: ClientConfig,
    pub judge: ClientConfig,
}

pub struct JobSubmitter {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    models: AuxiliaryModels,
    policy: ValidationPolicy,
}

impl JobSubmitter {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        models: AuxiliaryModels,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            store,
            queue,
            models,
            policy,
        }
    }

    /// Accept a run and return its freshly created `queued` record.
    #[instrument(skip_all)]
    pub async fn submit(&self, request: TestRunRequest) -> Result<Job, SubmitError> {
        let request = request.validate(&self.policy)?;
        let job_id = JobId::new();
        let now = Utc::now();

        let redacted = RedactedRequest::new(&request, &self.models.attack, &self.models.judge);
        let job = Job::queued(job_id, redacted, now);
        self.store.create(&job).await?;

        let payload = JobPayload::new(
            job_id,
            request,
            self.models.attack.clone(),
            self.models.judge.clone(),
            now,
        );
        if let Err(source) = self.queue.enqueue(&payload).await {
            warn!(job_id = %job_id, error = %source, "enqueue failed after create");
            return Err(SubmitError::Queue { job_id, source });
        }

        info!(
            job_id = %job_id,
            tested_model = %job.request.tested_model.model,
            tests = job.request.plan.specs().len(),
            "job enqueued"
        );
        Ok(job)
    }
}
