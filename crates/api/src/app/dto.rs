use chrono::{DateTime, Utc};
use serde::Serialize;

use redrun_core::{Job, JobId, JobStatus};
use redrun_infra::artifacts::ArtifactFile;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CreateRunResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&Job> for CreateRunResponse {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id,
            status: job.status,
            created_at: job.created_at,
        }
    }
}

/// Stored record plus the derived one-line failure notice.
#[derive(Debug, Serialize)]
pub struct JobInfo {
    #[serde(flatten)]
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_notice: Option<String>,
}

impl From<Job> for JobInfo {
    fn from(job: Job) -> Self {
        let error_notice = job.error_notice();
        Self { job, error_notice }
    }
}

#[derive(Debug, Serialize)]
pub struct ArtifactsListResponse {
    pub job_id: JobId,
    pub files: Vec<ArtifactFile>,
}
