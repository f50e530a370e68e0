use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::Json;

use redrun_core::{Job, JobId, TestRunRequest};

use crate::app::errors;
use crate::app::services::AppServices;

/// Malformed ids cannot name a job, so they are reported as not found.
pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse().map_err(|_| errors::not_found())
}

pub fn run_request(
    body: Result<Json<TestRunRequest>, JsonRejection>,
) -> Result<TestRunRequest, axum::response::Response> {
    body.map(|Json(req)| req)
        .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_payload", e.body_text()))
}

pub async fn load_job(services: &Arc<AppServices>, raw_id: &str) -> Result<Job, axum::response::Response> {
    let job_id = parse_job_id(raw_id)?;
    services
        .store
        .get(job_id)
        .await
        .map_err(errors::store_error_to_response)
}
