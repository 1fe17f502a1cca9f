use std::sync::Arc;

use authz_sidecar_authorizer::{Authorizer, AuthorizerError, Credential};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use http::uri::{Authority, Scheme};
use http::{HeaderName, Uri};
use tracing::{debug, error, info, instrument, warn};

use super::connection::{CloseError, ConnectionCache, Dialer};
use super::status::GrpcStatus;
use crate::proxy::extract_credential;

const GRPC_ACTION: &str = "grpc";

/// Transparent gRPC proxy: authorizes each call from its metadata and relays
/// it to one backend over a cached HTTP/2 connection.
pub struct GrpcProxyHandler {
    authorizer: Arc<dyn Authorizer>,
    connections: ConnectionCache,
    target: String,
    authority: Authority,
    role_header: HeaderName,
    require_role_token: bool,
}

impl GrpcProxyHandler {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        dialer: Arc<dyn Dialer>,
        target: String,
        role_header: HeaderName,
        require_role_token: bool,
    ) -> Result<Self, http::uri::InvalidUri> {
        let authority = Authority::try_from(target.as_str())?;
        Ok(Self {
            authorizer,
            connections: ConnectionCache::new(dialer),
            target,
            authority,
            role_header,
            require_role_token,
        })
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .fallback(grpc_request)
            .with_state(Arc::clone(self))
    }

    #[instrument(skip(self, req), fields(method = %req.uri().path()))]
    pub async fn handle(&self, req: Request) -> Response {
        let credential = if self.require_role_token {
            match self.role_token(&req) {
                Some(token) => Credential::RoleToken(token),
                None => {
                    debug!("Role token metadata missing");
                    return GrpcStatus::Unauthenticated
                        .into_response(&AuthorizerError::MissingCredential.to_string());
                }
            }
        } else {
            match extract_credential(&req, &self.role_header) {
                Some(credential) => credential,
                None => {
                    return GrpcStatus::Unauthenticated
                        .into_response(&AuthorizerError::MissingCredential.to_string());
                }
            }
        };

        let verified = self
            .authorizer
            .verify(&credential, GRPC_ACTION, req.uri().path())
            .await;
        match verified {
            Ok(principal) => {
                info!(principal = %principal.name(), "gRPC call authorized");
            }
            Err(err) => {
                if err.is_denial() {
                    warn!(error = %err, "gRPC call denied");
                } else {
                    error!(error = %err, "gRPC authorization failed");
                }
                return GrpcStatus::Unauthenticated.into_response(&err.to_string());
            }
        }

        let conn = match self.connections.get(&self.target).await {
            Ok(conn) => conn,
            Err(err) => {
                warn!(error = %err, "Backend unavailable");
                return GrpcStatus::Unavailable.into_response(&err.to_string());
            }
        };

        let req = match self.direct(req) {
            Ok(req) => req,
            Err(err) => return GrpcStatus::Internal.into_response(&err.to_string()),
        };

        match conn.send(req).await {
            Ok(response) => response.map(Body::new),
            Err(err) => {
                warn!(target = %self.target, error = %err, "Backend call failed");
                GrpcStatus::Unavailable.into_response(&err.to_string())
            }
        }
    }

    /// Close every backend connection. Later calls do nothing.
    pub fn close(&self) -> Result<(), CloseError> {
        self.connections.close()
    }

    pub fn connections(&self) -> &ConnectionCache {
        &self.connections
    }

    fn role_token(&self, req: &Request) -> Option<String> {
        req.headers()
            .get(&self.role_header)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    fn direct(&self, req: Request) -> Result<Request, http::Error> {
        let (mut parts, body) = req.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()?;
        parts.headers.remove(http::header::HOST);
        parts.headers.remove(http::header::CONNECTION);
        Ok(Request::from_parts(parts, body))
    }
}

async fn grpc_request(State(handler): State<Arc<GrpcProxyHandler>>, req: Request) -> Response {
    handler.handle(req).await
}
