//! Tool-style endpoints: one call submits and waits for the outcome.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use redrun_core::TestRunRequest;

use crate::app::errors;
use crate::app::routes::common::{parse_job_id, run_request};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_tool_run))
        .route("/:job_id", get(get_tool_run))
}

pub async fn create_tool_run(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<TestRunRequest>, JsonRejection>,
) -> axum::response::Response {
    let request = match run_request(body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match services.tool.create_run(request).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => errors::tool_error_to_response(e),
    }
}

pub async fn get_tool_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.tool.get_run(job_id).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => errors::tool_error_to_response(e),
    }
}
