use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=UTF-8";

/// Liveness endpoint answering `GET <path>` with `OK`.
pub fn router(path: &str) -> Router {
    Router::new().route(path, get(health_check))
}

async fn health_check() -> impl IntoResponse {
    ([(CONTENT_TYPE, TEXT_PLAIN_UTF8)], "OK")
}
