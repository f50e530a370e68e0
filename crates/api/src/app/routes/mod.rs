use axum::Router;

pub mod common;
pub mod runs;
pub mod system;
pub mod tools;

/// Router for all key-protected `/v1` endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/v1/tests/runs", runs::router())
        .nest("/v1/tools/runs", tools::router())
}
