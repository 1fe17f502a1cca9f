mod common;

use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use authz_sidecar_authorizer::{
    Authorizer, AuthorizerConfig, JwtAlgorithm, JwtConfig, PolicyAuthorizer, PolicySource,
};
use authz_sidecar_proxy::grpc::{
    BackendConnection, DialError, Dialer, GrpcProxyHandler, TcpDialer, GRPC_STATUS,
};
use authz_sidecar_proxy::ProxyDaemon;
use axum::body::Body;
use bytes::Bytes;
use common::{role_token, sidecar_config, wait_for_port, write_policies, Ports, ROLE_HEADER};
use http::{HeaderName, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const REPLY: &[u8] = b"\x00\x00\x00\x00\x03abc";

/// Plaintext HTTP/2 backend answering every call with `REPLY`.
async fn echo_backend() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let counter = Arc::clone(&counter);
            tokio::spawn(async move {
                let service = service_fn(move |_req| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header("content-type", "application/grpc")
                                .header(GRPC_STATUS, "0")
                                .body(Full::new(Bytes::from_static(REPLY)))
                                .unwrap(),
                        )
                    }
                });
                let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    (addr.to_string(), calls)
}

struct CountingDialer {
    inner: TcpDialer,
    dials: AtomicUsize,
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, target: &str) -> Result<BackendConnection, DialError> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        self.inner.dial(target).await
    }
}

async fn authorizer(dir: &TempDir) -> Arc<dyn Authorizer> {
    let config = AuthorizerConfig {
        domain: common::DOMAIN.to_string(),
        policy_source: PolicySource::File(write_policies(dir.path())),
        policy_refresh_interval: Duration::from_secs(3600),
        role_token: true,
        access_token: false,
        role_certificate: false,
        verify_cert_thumbprint: false,
        jwt: Some(JwtConfig {
            algorithm: JwtAlgorithm::HS256,
            secret: Some(common::SECRET.to_string()),
            public_key_path: None,
        }),
    };
    let authorizer = PolicyAuthorizer::new(config).unwrap();
    authorizer.init(CancellationToken::new()).await.unwrap();
    Arc::new(authorizer)
}

fn grpc_call(role_token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/echo.Echo/Say")
        .header("content-type", "application/grpc")
        .header("te", "trailers");
    if let Some(token) = role_token {
        builder = builder.header(ROLE_HEADER, token);
    }
    builder
        .body(Body::from(Bytes::from_static(b"\x00\x00\x00\x00\x00")))
        .unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_role_token_fails_before_dialing() {
    let policies = TempDir::new().unwrap();
    let (target, calls) = echo_backend().await;
    let dialer = Arc::new(CountingDialer {
        inner: TcpDialer::default(),
        dials: AtomicUsize::new(0),
    });

    let handler = Arc::new(
        GrpcProxyHandler::new(
            authorizer(&policies).await,
            dialer.clone(),
            target,
            HeaderName::from_static(ROLE_HEADER),
            true,
        )
        .unwrap(),
    );

    let response = handler.router().oneshot(grpc_call(None)).await.unwrap();

    assert_eq!(response.status(), http::StatusCode::OK);
    assert_eq!(response.headers()[GRPC_STATUS], "16");
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(handler.connections().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn authorized_call_is_relayed_over_one_connection() {
    let policies = TempDir::new().unwrap();
    let (target, calls) = echo_backend().await;
    let dialer = Arc::new(CountingDialer {
        inner: TcpDialer::default(),
        dials: AtomicUsize::new(0),
    });
    let handler = Arc::new(
        GrpcProxyHandler::new(
            authorizer(&policies).await,
            dialer.clone(),
            target,
            HeaderName::from_static(ROLE_HEADER),
            true,
        )
        .unwrap(),
    );
    let token = role_token(&["grpc-client"]);

    for _ in 0..3 {
        let response = handler
            .router()
            .oneshot(grpc_call(Some(token.as_str())))
            .await
            .unwrap();
        assert_eq!(response.headers()[GRPC_STATUS], "0");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], REPLY);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    assert_eq!(handler.connections().len(), 1);

    handler.close().unwrap();
    assert!(handler.connections().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn role_token_metadata_wins_over_bearer_header() {
    let policies = TempDir::new().unwrap();
    let (target, calls) = echo_backend().await;
    let handler = Arc::new(
        GrpcProxyHandler::new(
            authorizer(&policies).await,
            Arc::new(TcpDialer::default()),
            target,
            HeaderName::from_static(ROLE_HEADER),
            true,
        )
        .unwrap(),
    );

    let token = role_token(&["grpc-client"]);
    let mut call = grpc_call(Some(token.as_str()));
    call.headers_mut().insert(
        http::header::AUTHORIZATION,
        http::HeaderValue::from_static("Bearer backend-api-key"),
    );
    let response = handler.router().oneshot(call).await.unwrap();

    assert_eq!(response.headers()[GRPC_STATUS], "0");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn role_without_grant_is_unauthenticated() {
    let policies = TempDir::new().unwrap();
    let (target, calls) = echo_backend().await;
    let handler = Arc::new(
        GrpcProxyHandler::new(
            authorizer(&policies).await,
            Arc::new(TcpDialer::default()),
            target,
            HeaderName::from_static(ROLE_HEADER),
            true,
        )
        .unwrap(),
    );

    let token = role_token(&["reader"]);
    let response = handler
        .router()
        .oneshot(grpc_call(Some(token.as_str())))
        .await
        .unwrap();

    assert_eq!(response.headers()[GRPC_STATUS], "16");
    assert!(response.headers().contains_key("grpc-message"));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dead_backend_is_unavailable() {
    let policies = TempDir::new().unwrap();
    let handler = Arc::new(
        GrpcProxyHandler::new(
            authorizer(&policies).await,
            Arc::new(TcpDialer::new(Duration::from_secs(1))),
            format!("127.0.0.1:{}", common::unused_port()),
            HeaderName::from_static(ROLE_HEADER),
            true,
        )
        .unwrap(),
    );

    let token = role_token(&["grpc-client"]);
    let response = handler
        .router()
        .oneshot(grpc_call(Some(token.as_str())))
        .await
        .unwrap();

    assert_eq!(response.headers()[GRPC_STATUS], "14");
}

#[tokio::test(flavor = "multi_thread")]
async fn daemon_serves_grpc_over_h2c() {
    let policies = TempDir::new().unwrap();
    let source = write_policies(policies.path());
    let (target, calls) = echo_backend().await;
    let backend_port = target.rsplit(':').next().unwrap().to_string();
    let ports = Ports::allocate();

    let config = sidecar_config(
        ports,
        source.to_str().unwrap(),
        &[("PROXY_SCHEME", "grpc"), ("PROXY_PORT", backend_port.as_str())],
    );
    let ctx = CancellationToken::new();
    let mut errors = ProxyDaemon::new(config).unwrap().start(ctx.clone());
    wait_for_port(ports.api).await;

    let client = reqwest::Client::builder()
        .http2_prior_knowledge()
        .build()
        .unwrap();
    let url = format!("http://127.0.0.1:{}/echo.Echo/Say", ports.api);

    let allowed = client
        .post(&url)
        .header("content-type", "application/grpc")
        .header(ROLE_HEADER, role_token(&["grpc-client"]))
        .body(&b"\x00\x00\x00\x00\x00"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.headers()[GRPC_STATUS], "0");
    assert_eq!(&allowed.bytes().await.unwrap()[..], REPLY);

    let rejected = client
        .post(&url)
        .header("content-type", "application/grpc")
        .body(&b"\x00\x00\x00\x00\x00"[..])
        .send()
        .await
        .unwrap();
    assert_eq!(rejected.headers()[GRPC_STATUS], "16");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(client);
    ctx.cancel();
    let reported = tokio::time::timeout(Duration::from_secs(10), errors.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(reported.iter().all(|e| e.is_cancellation()), "{:?}", reported);
}
