//! Tool-style synchronous interface: submit, wait, summarise.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use redrun_core::{AggregatedResult, Job, JobId, JobStatus, TestRunRequest};

use super::store::{JobStore, JobStoreError};
use super::submit::{JobSubmitter, SubmitError};
use super::wait::{WaitError, Waiter};
use crate::artifacts::{PresignResolver, ARCHIVE_NAME};

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error(transparent)]
    Wait(#[from] WaitError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is not finished (status: {status})")]
    NotFinished { job_id: JobId, status: JobStatus },
    #[error("job {0} succeeded without a result")]
    MissingResult(JobId),
    #[error(transparent)]
    Store(JobStoreError),
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRunResponse {
    pub job_id: JobId,
    /// Empty on failed runs.
    pub aggregated_result: AggregatedResult,
    pub artifacts_url: Option<String>,
    pub error_notice: Option<String>,
}

pub struct RunTool {
    submitter: Arc<JobSubmitter>,
    waiter: Waiter,
    store: Arc<dyn JobStore>,
    presign: Arc<PresignResolver>,
    wait_timeout: Duration,
}

impl RunTool {
    pub fn new(
        submitter: Arc<JobSubmitter>,
        waiter: Waiter,
        store: Arc<dyn JobStore>,
        presign: Arc<PresignResolver>,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            submitter,
            waiter,
            store,
            presign,
            wait_timeout,
        }
    }

    /// Submit a run and wait for its outcome.
    pub async fn create_run(&self, request: TestRunRequest) -> Result<ToolRunResponse, ToolError> {
        let job = self.submitter.submit(request).await?;
        let finished = self
            .waiter
            .wait(job.job_id, self.wait_timeout)
            .await
            .map_err(|e| match e {
                WaitError::NotFound(id) => ToolError::NotFound(id),
                other => ToolError::Wait(other),
            })?;
        self.summarise(finished).await
    }

    /// Summary of an already finished run.
    pub async fn get_run(&self, job_id: JobId) -> Result<ToolRunResponse, ToolError> {
        let job = self.store.get(job_id).await.map_err(|e| match e {
            JobStoreError::NotFound(id) => ToolError::NotFound(id),
            other => ToolError::Store(other),
        })?;
        self.summarise(job).await
    }

    async fn summarise(&self, job: Job) -> Result<ToolRunResponse, ToolError> {
        let aggregated_result = match job.status {
            JobStatus::Succeeded => job
                .result
                .as_ref()
                .map(|r| r.aggregated.clone())
                .ok_or(ToolError::MissingResult(job.job_id))?,
            JobStatus::Failed => AggregatedResult::new(),
            status => {
                return Err(ToolError::NotFinished {
                    job_id: job.job_id,
                    status,
                });
            }
        };

        Ok(ToolRunResponse {
            job_id: job.job_id,
            aggregated_result,
            artifacts_url: self.artifacts_url(job.job_id).await,
            error_notice: job.error_notice(),
        })
    }

    async fn artifacts_url(&self, job_id: JobId) -> Option<String> {
        match self.presign.resolve(job_id, ARCHIVE_NAME).await {
            Ok(link) => Some(link.download_url),
            Err(e) => {
                debug!(job_id = %job_id, error = %e, "no artifacts link");
                None
            }
        }
    }
}
