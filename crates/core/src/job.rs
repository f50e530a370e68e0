//! Job record and its lifecycle state machine.
//!
//! ```text
//! queued ──► running ──► succeeded
//!                   └──► failed
//! ```
//!
//! Terminal states are final. `result` exists only on `succeeded` records and
//! `error` only on `failed` ones.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::JobId;
use crate::redact::RedactedRequest;

/// Category -> outcome label -> count, as reported by the analysis engine.
pub type AggregatedResult = BTreeMap<String, BTreeMap<String, u64>>;

/// Well-known error kinds produced by the system itself (engine faults carry
/// their own names).
pub mod error_kinds {
    pub const VALIDATION: &str = "ValidationError";
    pub const EMPTY_RESULT: &str = "EmptyAggregatedResultError";
    pub const EXECUTION_TIMEOUT: &str = "ExecutionTimeoutError";
    pub const ENGINE_PANIC: &str = "EnginePanicError";
    pub const ORPHANED_RUN: &str = "OrphanedRunError";
}

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued, waiting for a worker
    Queued,
    /// Owned by a worker
    Running,
    /// Finished with a non-empty aggregated result
    Succeeded,
    /// Finished with an error
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle graph.
    ///
    /// Self-transitions are not edges.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Successful outcome of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub aggregated: AggregatedResult,
    pub finished_at: DateTime<Utc>,
}

/// Failure details of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    #[serde(rename = "error_type")]
    pub kind: String,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl JobError {
    pub fn notice(&self) -> String {
        error_notice(&self.kind, &self.message)
    }
}

/// User-facing one-line error description.
pub fn error_notice(kind: &str, message: &str) -> String {
    if message.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}: {message}")
    }
}

/// Persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Submitted request with secrets replaced by presence flags.
    pub request: RedactedRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl Job {
    /// Fresh record in the initial state.
    pub fn queued(job_id: JobId, request: RedactedRequest, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            created_at: now,
            updated_at: now,
            request,
            result: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) -> DomainResult<()> {
        self.ensure_edge(JobStatus::Running)?;
        self.status = JobStatus::Running;
        Ok(())
    }

    pub fn succeed(&mut self, aggregated: AggregatedResult, at: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_edge(JobStatus::Succeeded)?;
        self.status = JobStatus::Succeeded;
        self.result = Some(JobResult {
            aggregated,
            finished_at: at,
        });
        self.error = None;
        Ok(())
    }

    pub fn fail(
        &mut self,
        kind: impl Into<String>,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_edge(JobStatus::Failed)?;
        self.status = JobStatus::Failed;
        self.error = Some(JobError {
            kind: kind.into(),
            message: message.into(),
            occurred_at: at,
        });
        self.result = None;
        Ok(())
    }

    /// Advance `updated_at`, never moving it backwards.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.updated_at {
            self.updated_at = now;
        }
    }

    /// `result` iff succeeded, `error` iff failed.
    pub fn check_consistency(&self) -> DomainResult<()> {
        let result_ok = self.result.is_some() == (self.status == JobStatus::Succeeded);
        let error_ok = self.error.is_some() == (self.status == JobStatus::Failed);
        if result_ok && error_ok {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "job {} is {} with result={} error={}",
                self.job_id,
                self.status,
                self.result.is_some(),
                self.error.is_some()
            )))
        }
    }

    pub fn error_notice(&self) -> Option<String> {
        self.error.as_ref().map(JobError::notice)
    }

    fn ensure_edge(&self, next: JobStatus) -> DomainResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::invariant(format!(
                "illegal transition {} -> {} for job {}",
                self.status, next, self.job_id
            )))
        }
    }
}
