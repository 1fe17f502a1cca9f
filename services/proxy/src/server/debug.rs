use std::sync::Arc;

use authz_sidecar_authorizer::Authorizer;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::error;

pub const POLICY_CACHE_PATH: &str = "/debug/cache/policy";
pub const APPLICATION_JSON_UTF8: &str = "application/json; charset=UTF-8";

/// Read-only view of the authorizer's policy cache.
pub fn router(authorizer: Arc<dyn Authorizer>) -> Router {
    Router::new()
        .route(POLICY_CACHE_PATH, get(policy_cache))
        .with_state(authorizer)
}

async fn policy_cache(State(authorizer): State<Arc<dyn Authorizer>>) -> Response {
    match serde_json::to_string_pretty(&authorizer.policy_cache()) {
        Ok(body) => ([(CONTENT_TYPE, APPLICATION_JSON_UTF8)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode policy cache");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
