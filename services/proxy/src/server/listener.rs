use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use super::error::ServerError;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Peer connection information, available to handlers as a request
/// extension.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub certificates: Vec<CertificateDer<'static>>,
}

impl PeerInfo {
    /// Get client IP address
    pub fn client_ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Get the first client certificate if available
    pub fn client_cert(&self) -> Option<&CertificateDer<'static>> {
        self.certificates.first()
    }
}

/// One HTTP/1.1 + HTTP/2 listener serving an axum router.
pub struct HttpListener {
    name: &'static str,
    addr: String,
    router: Router,
    tls: Option<TlsAcceptor>,
}

impl HttpListener {
    pub fn new(name: &'static str, addr: String, router: Router) -> Self {
        Self {
            name,
            addr,
            router,
            tls: None,
        }
    }

    pub fn with_tls(mut self, acceptor: Option<TlsAcceptor>) -> Self {
        self.tls = acceptor;
        self
    }

    /// Bind and serve until `shutdown` fires, then give open connections
    /// `drain_timeout` to finish.
    pub async fn serve(
        self,
        shutdown: CancellationToken,
        drain_timeout: Duration,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.addr)
            .await
            .map_err(|source| ServerError::Bind {
                listener: self.name,
                addr: self.addr.clone(),
                source,
            })?;

        info!(
            listener = self.name,
            addr = %self.addr,
            tls = self.tls.is_some(),
            "Listener started"
        );

        let connection_shutdown = CancellationToken::new();
        let mut connections = JoinSet::new();
        let mut backoff: Option<Duration> = None;
        let mut fatal: Option<ServerError> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => {
                            backoff = None;
                            conn
                        }
                        Err(e) if is_transient_accept_error(&e) => {
                            let delay = backoff
                                .map(|d: Duration| (d * 2).min(MAX_ACCEPT_BACKOFF))
                                .unwrap_or(MIN_ACCEPT_BACKOFF);
                            backoff = Some(delay);
                            warn!(listener = self.name, error = %e, retry_in = ?delay, "Accept failed, retrying");
                            tokio::select! {
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(delay) => continue,
                            }
                        }
                        Err(source) => {
                            error!(listener = self.name, error = %source, "Accept loop failed");
                            fatal = Some(ServerError::Accept {
                                listener: self.name,
                                source,
                            });
                            break;
                        }
                    };

                    let router = self.router.clone();
                    let tls = self.tls.clone();
                    let stop = connection_shutdown.clone();
                    connections.spawn(async move {
                        handle_connection(stream, peer_addr, router, tls, stop).await;
                    });
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        connection_shutdown.cancel();
        debug!(
            listener = self.name,
            open = connections.len(),
            "Draining connections"
        );

        let drained = tokio::time::timeout(drain_timeout, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if let Some(err) = fatal {
            if drained.is_err() {
                connections.abort_all();
            }
            return Err(err);
        }

        match drained {
            Ok(()) => {
                info!(listener = self.name, "Listener stopped");
                Ok(())
            }
            Err(_) => {
                connections.abort_all();
                warn!(listener = self.name, "Connections did not drain in time");
                Err(ServerError::ShutdownTimeout {
                    listener: self.name,
                    timeout: drain_timeout,
                })
            }
        }
    }
}

/// Accept errors that clear up on their own: a peer gave up before the
/// handshake finished, or the process ran out of file descriptors.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    match e.kind() {
        ErrorKind::ConnectionAborted
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::TimedOut => true,
        // ENFILE, EMFILE and ENOBUFS/ENOMEM on Linux.
        _ => matches!(e.raw_os_error(), Some(23 | 24 | 105 | 12)),
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    router: Router,
    tls: Option<TlsAcceptor>,
    stop: CancellationToken,
) {
    let _ = stream.set_nodelay(true);

    match tls {
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "TLS handshake failed");
                    return;
                }
            };
            let certificates = tls_stream
                .get_ref()
                .1
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default();

            debug!(
                peer = %peer_addr,
                client_certificates = certificates.len(),
                "TLS connection accepted"
            );

            let peer = PeerInfo {
                addr: peer_addr,
                certificates,
            };
            serve_io(tls_stream, peer, router, stop).await;
        }
        None => {
            let peer = PeerInfo {
                addr: peer_addr,
                certificates: Vec::new(),
            };
            serve_io(stream, peer, router, stop).await;
        }
    }
}

async fn serve_io<I>(io: I, peer: PeerInfo, router: Router, stop: CancellationToken)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer_addr = peer.addr;
    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(peer.clone());
        router.clone().oneshot(req)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(io), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = stop.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        debug!(peer = %peer_addr, error = %e, "Connection closed with error");
    }
}
