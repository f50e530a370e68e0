use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use redrun_core::TestRunRequest;

use crate::app::routes::common::{load_job, run_request};
use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_run))
        .route("/:job_id", get(get_run))
        .route("/:job_id/artifacts", get(list_artifacts))
        .route("/:job_id/artifacts/*path", get(download_artifact))
}

pub async fn create_run(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<TestRunRequest>, JsonRejection>,
) -> axum::response::Response {
    let request = match run_request(body) {
        Ok(r) => r,
        Err(resp) => return resp,
    };

    match services.submitter.submit(request).await {
        Ok(job) => (StatusCode::OK, Json(dto::CreateRunResponse::from(&job))).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn get_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    match load_job(&services, &job_id).await {
        Ok(job) => (StatusCode::OK, Json(dto::JobInfo::from(job))).into_response(),
        Err(resp) => resp,
    }
}

pub async fn list_artifacts(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job = match load_job(&services, &job_id).await {
        Ok(job) => job,
        Err(resp) => return resp,
    };

    match services.artifacts.list(job.job_id).await {
        Ok(files) => (
            StatusCode::OK,
            Json(dto::ArtifactsListResponse {
                job_id: job.job_id,
                files,
            }),
        )
            .into_response(),
        Err(e) => errors::artifact_error_to_response(e),
    }
}

/// Always answers with a JSON link, never a redirect.
pub async fn download_artifact(
    Extension(services): Extension<Arc<AppServices>>,
    Path((job_id, path)): Path<(String, String)>,
) -> axum::response::Response {
    let job = match load_job(&services, &job_id).await {
        Ok(job) => job,
        Err(resp) => return resp,
    };

    match services.presign.resolve(job.job_id, &path).await {
        Ok(link) => (StatusCode::OK, Json(link)).into_response(),
        Err(e) => errors::presign_error_to_response(e),
    }
}
