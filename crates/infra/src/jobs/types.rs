//! Queue message and retry policy.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use redrun_core::{ClientConfig, JobId, RunConfig, TestPlan, TestRunRequest};

/// Work item handed from the submitter to a worker through the queue.
///
/// Unlike the stored record this carries secrets: the worker needs the real
/// API keys to talk to the models.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
    pub tested_model: ClientConfig,
    pub attack_model: ClientConfig,
    pub judge_model: ClientConfig,
    #[serde(default)]
    pub run_config: Option<RunConfig>,
    pub plan: TestPlan,
}

impl JobPayload {
    pub fn new(
        job_id: JobId,
        request: TestRunRequest,
        attack_model: ClientConfig,
        judge_model: ClientConfig,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            created_at,
            tested_model: request.tested_model,
            attack_model,
            judge_model,
            run_config: request.run_config,
            plan: request.plan,
        }
    }

    /// The caller-supplied part of the payload.
    pub fn request(&self) -> TestRunRequest {
        TestRunRequest {
            tested_model: self.tested_model.clone(),
            run_config: self.run_config.clone(),
            plan: self.plan.clone(),
        }
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (at least 1).
    pub max_attempts: u32,
    /// Pause between two consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Delay to wait after the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            self.delay
        }
    }

    /// Check if another attempt is allowed after `attempt` attempts.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds or attempts are exhausted.
    ///
    /// `op` receives the 1-indexed attempt number. Returns the value together
    /// with the number of attempts made, or the last error with the same count.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, op: F) -> Result<(T, u32), (E, u32)>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_when(what, |_| true, op).await
    }

    /// Like [`RetryPolicy::retry`], but errors for which `transient` returns
    /// `false` are returned immediately.
    pub async fn retry_when<T, E, P, F, Fut>(
        &self,
        what: &str,
        transient: P,
        mut op: F,
    ) -> Result<(T, u32), (E, u32)>
    where
        P: Fn(&E) -> bool,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) if transient(&e) && self.should_retry(attempt) => {
                    warn!(
                        what,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(self.delay_for_attempt(attempt)).await;
                }
                Err(e) => return Err((e, attempt)),
            }
        }
    }
}
