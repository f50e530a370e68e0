use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use redrun_core::DomainError;
use redrun_infra::artifacts::{ArtifactError, PresignError};
use redrun_infra::jobs::{JobStoreError, SubmitError, ToolError, WaitError};

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "Not found")
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation { .. } => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
        }
        DomainError::InvalidId(_) => not_found(),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg)
        }
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) => not_found(),
        other => {
            error!(error = %other, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", other.to_string())
        }
    }
}

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(e) => domain_error_to_response(e),
        SubmitError::Store(e) => store_error_to_response(e),
        SubmitError::Queue { job_id, source } => {
            error!(job_id = %job_id, error = %source, "job accepted but not enqueued");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_error", source.to_string())
        }
    }
}

pub fn artifact_error_to_response(err: ArtifactError) -> axum::response::Response {
    match err {
        ArtifactError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "File not found"),
        other => {
            error!(error = %other, "artifact backend failure");
            json_error(StatusCode::BAD_GATEWAY, "artifacts_backend_error", "Artifacts backend error")
        }
    }
}

pub fn presign_error_to_response(err: PresignError) -> axum::response::Response {
    match err {
        PresignError::InvalidPath(_) => json_error(StatusCode::BAD_REQUEST, "invalid_path", "Invalid path"),
        PresignError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", "File not found"),
        PresignError::Backend(msg) => {
            error!(error = %msg, "artifact link resolution failed");
            json_error(StatusCode::BAD_GATEWAY, "artifacts_backend_error", "Artifacts backend error")
        }
    }
}

pub fn tool_error_to_response(err: ToolError) -> axum::response::Response {
    match err {
        ToolError::Submit(e) => submit_error_to_response(e),
        ToolError::Wait(WaitError::Timeout { .. }) => {
            json_error(StatusCode::GATEWAY_TIMEOUT, "wait_timeout", err.to_string())
        }
        ToolError::Wait(WaitError::NotFound(_)) | ToolError::NotFound(_) => not_found(),
        ToolError::Wait(WaitError::Store(e)) | ToolError::Store(e) => store_error_to_response(e),
        ToolError::NotFinished { .. } => {
            json_error(StatusCode::CONFLICT, "not_finished", err.to_string())
        }
        ToolError::Wait(WaitError::Inconsistent { .. }) | ToolError::MissingResult(_) => {
            error!(error = %err, "inconsistent job record");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", err.to_string())
        }
    }
}
