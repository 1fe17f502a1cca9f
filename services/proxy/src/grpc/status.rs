use axum::body::Body;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, StatusCode};

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";
pub const APPLICATION_GRPC: &str = "application/grpc";

/// gRPC status codes produced by the proxy itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcStatus {
    Internal = 13,
    Unavailable = 14,
    Unauthenticated = 16,
}

impl GrpcStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Trailers-only response carrying this status and `message`.
    pub fn into_response(self, message: &str) -> Response<Body> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::OK;

        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_GRPC));
        headers.insert(GRPC_STATUS, HeaderValue::from(u16::from(self.code())));
        if !message.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&urlencoding::encode(message)) {
                headers.insert(GRPC_MESSAGE, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailers_only_response_shape() {
        let response = GrpcStatus::Unauthenticated.into_response("missing role token");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], APPLICATION_GRPC);
        assert_eq!(response.headers()[GRPC_STATUS], "16");
        assert_eq!(
            response.headers()[GRPC_MESSAGE],
            "missing%20role%20token"
        );
    }

    #[test]
    fn status_codes() {
        assert_eq!(GrpcStatus::Internal.code(), 13);
        assert_eq!(GrpcStatus::Unavailable.code(), 14);
        assert_eq!(GrpcStatus::Unauthenticated.code(), 16);
    }
}
