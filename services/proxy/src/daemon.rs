use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use authz_sidecar_authorizer::{Authorizer, AuthorizerError, ErrorCause, PolicyAuthorizer};
use axum::Router;
use http::HeaderName;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::config::{ProxyScheme, SidecarConfig};
use crate::grpc::{CloseError, GrpcProxyHandler, TcpDialer};
use crate::proxy::{AuthorizingTransport, BufferPool, BypassMatcher, HyperTransport, ReverseProxy};
use crate::server::{self, Server, ServerError};

/// Everything the daemon reports once it has fully stopped.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Authorizer failed to initialize: {0}")]
    Init(#[source] AuthorizerError),

    #[error("{error} (occurred {count} times)")]
    Authorizer {
        cause: ErrorCause,
        count: usize,
        #[source]
        error: AuthorizerError,
    },

    #[error("Server stopped: {}", ServerErrors(.0))]
    Server(Vec<ServerError>),

    #[error("Failed to close gRPC backend connections: {0}")]
    GrpcClose(#[from] CloseError),
}

impl DaemonError {
    /// True when the error only records that shutdown was requested.
    pub fn is_cancellation(&self) -> bool {
        match self {
            DaemonError::Init(e) | DaemonError::Authorizer { error: e, .. } => {
                matches!(e, AuthorizerError::Canceled)
            }
            DaemonError::Server(errors) => errors.iter().all(ServerError::is_canceled),
            DaemonError::GrpcClose(_) => false,
        }
    }
}

struct ServerErrors<'a>(&'a [ServerError]);

impl fmt::Display for ServerErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// The sidecar process: authorizer plus listener set, supervised together.
pub struct ProxyDaemon {
    authorizer: Arc<dyn Authorizer>,
    server: Server,
    grpc: Option<Arc<GrpcProxyHandler>>,
}

impl ProxyDaemon {
    pub fn new(config: SidecarConfig) -> Result<Self> {
        let authorizer = PolicyAuthorizer::new(config.authorization.clone())
            .context("Failed to create authorizer")?;
        Self::with_authorizer(config, Arc::new(authorizer))
    }

    /// Build the daemon around an existing authorizer.
    pub fn with_authorizer(config: SidecarConfig, authorizer: Arc<dyn Authorizer>) -> Result<Self> {
        let role_header = HeaderName::from_bytes(config.proxy.role_header.as_bytes())
            .with_context(|| format!("Invalid role header {:?}", config.proxy.role_header))?;

        let (api, grpc) = match config.proxy.scheme {
            ProxyScheme::Grpc => {
                let handler = Arc::new(
                    GrpcProxyHandler::new(
                        Arc::clone(&authorizer),
                        Arc::new(TcpDialer::default()),
                        config.proxy.origin_authority(),
                        role_header,
                        config.authorization.role_token,
                    )
                    .context("Invalid gRPC backend address")?,
                );
                (handler.router(), Some(handler))
            }
            ProxyScheme::Http | ProxyScheme::Https => {
                let transport = AuthorizingTransport::new(
                    HyperTransport::new().context("Failed to create origin client")?,
                    Arc::clone(&authorizer),
                    BypassMatcher::new(
                        &config.proxy.bypass_paths,
                        config.proxy.bypass_prefix_match,
                    ),
                    role_header,
                );
                let proxy = ReverseProxy::new(
                    Arc::new(transport),
                    config.proxy.origin_scheme(),
                    &config.proxy.origin_authority(),
                    BufferPool::new(config.proxy.buffer_size),
                    config.proxy.request_timeout,
                )
                .context("Invalid origin address")?;
                (proxy.into_router(), None)
            }
        };
        let api: Router = api.layer(TraceLayer::new_for_http());

        let server = Server::new(config.server, api, server::debug::router(Arc::clone(&authorizer)))
            .context("Failed to configure TLS")?;

        Ok(Self {
            authorizer,
            server,
            grpc,
        })
    }

    /// Run until `ctx` is canceled or a listener stops. The returned channel
    /// delivers every collected error exactly once and then closes.
    pub fn start(self, ctx: CancellationToken) -> mpsc::Receiver<Vec<DaemonError>> {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            let errors = self.run(ctx).await;
            if !errors.is_empty() {
                error!(count = errors.len(), "Daemon stopped with errors");
            }
            let _ = tx.send(errors).await;
        });
        rx
    }

    async fn run(self, ctx: CancellationToken) -> Vec<DaemonError> {
        let ProxyDaemon {
            authorizer,
            server,
            grpc,
        } = self;

        if let Err(e) = authorizer.init(ctx.clone()).await {
            error!(error = %e, "Authorizer initialization failed");
            return vec![DaemonError::Init(e)];
        }
        info!("Authorizer initialized");

        let authorizer_ctx = ctx.child_token();
        let mut refresh_errors = authorizer.start(authorizer_ctx.clone());

        let counting = tokio::spawn(async move {
            let mut counts: BTreeMap<ErrorCause, (usize, AuthorizerError)> = BTreeMap::new();
            while let Some(err) = refresh_errors.recv().await {
                if !matches!(err, AuthorizerError::Canceled) {
                    warn!(error = %err, "Authorizer background error");
                }
                counts
                    .entry(err.cause())
                    .and_modify(|(count, last)| {
                        *count += 1;
                        *last = err.clone();
                    })
                    .or_insert((1, err));
            }
            debug!(causes = counts.len(), "Authorizer error stream closed");
            counts
        });

        let serving = tokio::spawn(async move {
            let errors = match server.listen_and_serve(ctx).await {
                Ok(errors) => errors,
                Err(_) => vec![ServerError::Panicked { listener: "server" }],
            };
            info!("Listeners stopped");
            authorizer_ctx.cancel();
            errors
        });

        let (counts, server_errors) = tokio::join!(counting, serving);
        let counts = counts.unwrap_or_default();
        let server_errors =
            server_errors.unwrap_or_else(|_| vec![ServerError::Panicked { listener: "server" }]);

        let mut errors: Vec<DaemonError> = counts
            .into_iter()
            .map(|(cause, (count, error))| DaemonError::Authorizer {
                cause,
                count,
                error,
            })
            .collect();
        if !server_errors.is_empty() {
            errors.push(DaemonError::Server(server_errors));
        }
        if let Some(grpc) = grpc {
            if let Err(e) = grpc.close() {
                errors.push(DaemonError::GrpcClose(e));
            }
        }
        errors
    }
}
