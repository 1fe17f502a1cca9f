use authz_sidecar_authorizer::AuthorizerError;
use axum::body::Body;
use axum::response::{IntoResponse, Response};
use http::{header, StatusCode};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Authorization failed: {0}")]
    Denied(#[from] AuthorizerError),

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("Request canceled")]
    Canceled,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Denied(_) => StatusCode::UNAUTHORIZED,
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Canceled => StatusCode::REQUEST_TIMEOUT,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::Denied(_) => "UNAUTHORIZED",
            ProxyError::Upstream(_) => "UPSTREAM_ERROR",
            ProxyError::Canceled => "REQUEST_TIMEOUT",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.error_code(),
            "message": self.to_string(),
        });

        let mut response = Response::new(Body::from(body.to_string()));
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        response
    }
}
