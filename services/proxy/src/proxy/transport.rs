use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use authz_sidecar_authorizer::{Authorizer, AuthorizerError, Credential};
use axum::body::Body;
use http::header::AUTHORIZATION;
use http::{HeaderName, Request, Response};
use http_body_util::BodyExt;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error, info, instrument, warn};

use super::bypass::BypassMatcher;
use super::error::ProxyError;
use crate::server::PeerInfo;

/// One request/response exchange with the origin.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError>;
}

/// Pooled hyper client speaking HTTP/1.1 and HTTP/2, with TLS to https
/// origins.
pub struct HyperTransport {
    client: Client<HttpsConnector<HttpConnector>, Body>,
}

impl HyperTransport {
    pub fn new() -> Result<Self, rustls::Error> {
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());

        let builder = match HttpsConnectorBuilder::new()
            .with_provider_and_native_roots(provider.clone())
        {
            Ok(builder) => builder,
            Err(e) => {
                warn!(error = %e, "No native root certificates, https origins will be rejected");
                let tls = rustls::ClientConfig::builder_with_provider(provider)
                    .with_safe_default_protocol_versions()?
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        };

        let connector = builder
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        let response = self
            .client
            .request(req)
            .await
            .map_err(|e| ProxyError::Upstream(e.to_string()))?;

        Ok(response.map(Body::new))
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn round_trip(&self, req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        (**self).round_trip(req).await
    }
}

/// Verifies the caller's credential before handing the request to the
/// wrapped transport.
pub struct AuthorizingTransport<T> {
    inner: T,
    authorizer: Arc<dyn Authorizer>,
    bypass: BypassMatcher,
    role_header: HeaderName,
}

impl<T: Transport> AuthorizingTransport<T> {
    pub fn new(
        inner: T,
        authorizer: Arc<dyn Authorizer>,
        bypass: BypassMatcher,
        role_header: HeaderName,
    ) -> Self {
        Self {
            inner,
            authorizer,
            bypass,
            role_header,
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for AuthorizingTransport<T> {
    #[instrument(skip(self, req), fields(method = %req.method(), path = %req.uri().path()))]
    async fn round_trip(&self, mut req: Request<Body>) -> Result<Response<Body>, ProxyError> {
        if self.bypass.matches(req.uri().path()) {
            debug!("Path is exempt from authorization");
            return self.inner.round_trip(req).await;
        }

        let verified = match extract_credential(&req, &self.role_header) {
            Some(credential) => {
                self.authorizer
                    .verify(&credential, req.method().as_str(), req.uri().path())
                    .await
            }
            None => Err(AuthorizerError::MissingCredential),
        };

        match verified {
            Ok(principal) => {
                info!(
                    principal = %principal.name(),
                    credential = %principal.credential_kind(),
                    "Request authorized"
                );
                req.extensions_mut().insert(principal);
                self.inner.round_trip(req).await
            }
            Err(err) => {
                if err.is_denial() {
                    warn!(error = %err, "Request denied");
                } else {
                    error!(error = %err, "Authorization failed");
                }
                drain(req.into_body()).await;
                Err(ProxyError::Denied(err))
            }
        }
    }
}

/// Pick the credential a request carries. A bearer token wins over the role
/// header, which wins over the TLS client certificate.
pub fn extract_credential<B>(req: &Request<B>, role_header: &HeaderName) -> Option<Credential> {
    let peer_certificate = req
        .extensions()
        .get::<PeerInfo>()
        .and_then(PeerInfo::client_cert)
        .map(|cert| cert.as_ref().to_vec());

    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = bearer {
        return Some(Credential::AccessToken {
            token: token.to_string(),
            peer_certificate,
        });
    }

    let role_token = req
        .headers()
        .get(role_header)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(token) = role_token {
        return Some(Credential::RoleToken(token.to_string()));
    }

    peer_certificate.map(Credential::RoleCertificate)
}

/// Read `body` to the end and drop it.
async fn drain(mut body: Body) {
    while let Some(frame) = body.frame().await {
        if frame.is_err() {
            break;
        }
    }
}
