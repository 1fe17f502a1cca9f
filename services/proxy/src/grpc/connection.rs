use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use dashmap::DashMap;
use http::{Request, Response};
use hyper::body::Incoming;
use hyper::client::conn::http2::{self, SendRequest};
use hyper_util::rt::{TokioExecutor, TokioIo};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::singleflight::SingleFlight;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DialError {
    #[error("Failed to connect to {target}: {message}")]
    Connect { target: String, message: String },

    #[error("Timed out connecting to {target}")]
    Timeout { target: String },

    #[error("HTTP/2 handshake with {target} failed: {message}")]
    Handshake { target: String, message: String },

    #[error("Connection cache is closed")]
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CloseError {
    #[error("Connection to {0} was already closed")]
    AlreadyClosed(String),
}

/// Liveness of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectionState {
    pub fn is_healthy(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::Connecting)
    }
}

/// One HTTP/2 connection to a backend plus the task driving it.
pub struct BackendConnection {
    target: String,
    sender: SendRequest<Body>,
    driver: JoinHandle<()>,
    closed: AtomicBool,
}

impl BackendConnection {
    pub fn new(target: String, sender: SendRequest<Body>, driver: JoinHandle<()>) -> Self {
        Self {
            target,
            sender,
            driver,
            closed: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::Acquire) {
            ConnectionState::Shutdown
        } else if self.driver.is_finished() || self.sender.is_closed() {
            ConnectionState::TransientFailure
        } else if self.sender.is_ready() {
            ConnectionState::Ready
        } else {
            ConnectionState::Connecting
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state().is_healthy()
    }

    pub async fn send(&self, req: Request<Body>) -> Result<Response<Incoming>, hyper::Error> {
        let mut sender = self.sender.clone();
        sender.ready().await?;
        sender.send_request(req).await
    }

    pub fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(CloseError::AlreadyClosed(self.target.clone()));
        }
        self.driver.abort();
        debug!(target = %self.target, "Backend connection closed");
        Ok(())
    }
}

/// Opens connections to backends.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &str) -> Result<BackendConnection, DialError>;
}

/// Plaintext HTTP/2 (prior knowledge) over TCP.
pub struct TcpDialer {
    connect_timeout: Duration,
}

impl TcpDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, target: &str) -> Result<BackendConnection, DialError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(target))
            .await
            .map_err(|_| DialError::Timeout {
                target: target.to_string(),
            })?
            .map_err(|e| DialError::Connect {
                target: target.to_string(),
                message: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);

        let (sender, connection) = http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await
            .map_err(|e| DialError::Handshake {
                target: target.to_string(),
                message: e.to_string(),
            })?;

        let name = target.to_string();
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(target = %name, error = %e, "Backend connection ended");
            }
        });

        info!(target = %target, "Connected to backend");
        Ok(BackendConnection::new(target.to_string(), sender, driver))
    }
}

/// At most one live connection per target. Unhealthy connections are evicted
/// and redialed; concurrent misses for a target share one dial.
pub struct ConnectionCache {
    dialer: Arc<dyn Dialer>,
    connections: Arc<DashMap<String, Arc<BackendConnection>>>,
    dials: SingleFlight<Arc<BackendConnection>, DialError>,
    closed: Arc<AtomicBool>,
}

impl ConnectionCache {
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            connections: Arc::new(DashMap::new()),
            dials: SingleFlight::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn get(&self, target: &str) -> Result<Arc<BackendConnection>, DialError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DialError::Closed);
        }
        if let Some(conn) = healthy_entry(&self.connections, target) {
            return Ok(conn);
        }

        let dialer = Arc::clone(&self.dialer);
        let connections = Arc::clone(&self.connections);
        let closed = Arc::clone(&self.closed);
        let key = target.to_string();

        self.dials
            .run(target, move || async move {
                // another dial may have finished between the miss and here
                if let Some(conn) = healthy_entry(&connections, &key) {
                    return Ok(conn);
                }

                let conn = Arc::new(dialer.dial(&key).await?);
                if closed.load(Ordering::Acquire) {
                    let _ = conn.close();
                    return Err(DialError::Closed);
                }
                connections.insert(key, Arc::clone(&conn));
                Ok(conn)
            })
            .await
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close every cached connection and refuse new ones. Returns the first
    /// close error. Calls after the first are no-ops.
    pub fn close(&self) -> Result<(), CloseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let connections: Vec<_> = self
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.connections.clear();

        let mut first_error = None;
        for conn in connections {
            if let Err(e) = conn.close() {
                warn!(error = %e, "Failed to close backend connection");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Cached connection for `target` if it is healthy. An unhealthy entry is
/// evicted, unless it was already replaced.
fn healthy_entry(
    connections: &DashMap<String, Arc<BackendConnection>>,
    target: &str,
) -> Option<Arc<BackendConnection>> {
    let existing = connections.get(target).map(|entry| Arc::clone(entry.value()))?;

    let state = existing.state();
    if state.is_healthy() {
        return Some(existing);
    }

    debug!(target = %target, ?state, "Evicting unhealthy backend connection");
    connections.remove_if(target, |_, current| Arc::ptr_eq(current, &existing));
    let _ = existing.close();
    None
}
