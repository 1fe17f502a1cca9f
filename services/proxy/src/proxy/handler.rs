use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::{HeaderValue, HOST};
use http::uri::{Authority, Scheme};
use http::{HeaderMap, Uri};
use tracing::{debug, error};

use super::buffer_pool::BufferPool;
use super::error::ProxyError;
use super::pooled_body::PooledBody;
use super::transport::Transport;
use crate::server::PeerInfo;

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Forwards every request to one origin through a [`Transport`].
pub struct ReverseProxy {
    transport: Arc<dyn Transport>,
    scheme: Scheme,
    authority: Authority,
    pool: Option<BufferPool>,
    request_timeout: Option<Duration>,
}

impl ReverseProxy {
    pub fn new(
        transport: Arc<dyn Transport>,
        scheme: &str,
        origin: &str,
        pool: Option<BufferPool>,
        request_timeout: Option<Duration>,
    ) -> Result<Self, http::Error> {
        Ok(Self {
            transport,
            scheme: Scheme::try_from(scheme)?,
            authority: Authority::try_from(origin)?,
            pool,
            request_timeout,
        })
    }

    /// Axum router sending every method and path through the proxy.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(proxy_request)
            .with_state(Arc::new(self))
    }

    pub async fn handle(&self, req: Request) -> Response {
        let outbound = match self.direct(req) {
            Ok(outbound) => outbound,
            Err(e) => {
                error!(error = %e, "Failed to rewrite request for origin");
                return ProxyError::Upstream(e.to_string()).into_response();
            }
        };

        let result = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.transport.round_trip(outbound))
                .await
                .unwrap_or(Err(ProxyError::Canceled)),
            None => self.transport.round_trip(outbound).await,
        };

        match result {
            Ok(response) => self.stream_back(response),
            Err(err) => {
                if let ProxyError::Upstream(reason) = &err {
                    error!(origin = %self.authority, error = %reason, "Origin request failed");
                }
                err.into_response()
            }
        }
    }

    /// Point the request at the origin, keeping method, path, query and body.
    fn direct(&self, req: Request) -> Result<Request, http::Error> {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?;

        sanitize_headers(&mut parts.headers);
        if !parts.headers.contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(self.authority.as_str()) {
                parts.headers.insert(HOST, host);
            }
        }

        if let Some(peer) = parts.extensions.get::<PeerInfo>() {
            append_forwarded_for(&mut parts.headers, &peer.client_ip().to_string());
        }

        debug!(uri = %parts.uri, "Forwarding request to origin");
        Ok(Request::from_parts(parts, body))
    }

    fn stream_back(&self, response: Response) -> Response {
        let (mut parts, body) = response.into_parts();
        sanitize_headers(&mut parts.headers);

        let body = match &self.pool {
            Some(pool) => Body::new(PooledBody::new(body, pool.clone())),
            None => body,
        };
        Response::from_parts(parts, body)
    }
}

async fn proxy_request(State(proxy): State<Arc<ReverseProxy>>, req: Request) -> Response {
    proxy.handle(req).await
}

/// Remove hop-by-hop headers, including those named by `Connection`.
fn sanitize_headers(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all(http::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(named.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, client_ip: &str) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}
