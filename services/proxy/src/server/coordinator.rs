use std::future::pending;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::error::ServerError;
use super::health;
use super::listener::HttpListener;
use crate::config::ServerConfig;
use crate::tls::{create_tls_acceptor, TlsError};

type ListenerTask = JoinHandle<Result<(), ServerError>>;

const API: &str = "api";
const HEALTH_CHECK: &str = "health-check";
const DEBUG: &str = "debug";

/// Runs the API, health-check and debug listeners as one unit. When any of
/// them stops, or the parent token is canceled, the rest are shut down.
pub struct Server {
    config: ServerConfig,
    api: Router,
    tls: Option<TlsAcceptor>,
    health: Option<Router>,
    debug: Option<Router>,
}

impl Server {
    pub fn new(config: ServerConfig, api: Router, debug: Router) -> Result<Self, TlsError> {
        let tls = if config.tls.enabled {
            Some(create_tls_acceptor(&config.tls)?)
        } else {
            None
        };
        let health =
            (config.health_check_port != 0).then(|| health::router(&config.health_check_path));
        let debug = config.debug_enabled.then_some(debug);

        Ok(Self {
            config,
            api,
            tls,
            health,
            debug,
        })
    }

    /// Start every configured listener. The returned channel yields all
    /// listener errors, plus `Canceled` when `ctx` triggered the shutdown,
    /// once every listener has stopped.
    pub fn listen_and_serve(self, ctx: CancellationToken) -> oneshot::Receiver<Vec<ServerError>> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let errors = self.run(ctx).await;
            let _ = tx.send(errors);
        });
        rx
    }

    async fn run(self, ctx: CancellationToken) -> Vec<ServerError> {
        let Server {
            config,
            api,
            tls,
            health,
            debug,
        } = self;
        let drain = config.shutdown_timeout;
        let addr = |port: u16| format!("{}:{}", config.host, port);

        let api_stop = CancellationToken::new();
        let aux_stop = CancellationToken::new();

        let mut api_task: Option<ListenerTask> = Some(tokio::spawn(
            HttpListener::new(API, addr(config.port), api)
                .with_tls(tls)
                .serve(api_stop.clone(), drain),
        ));
        let mut health_task: Option<ListenerTask> = health.map(|router| {
            tokio::spawn(
                HttpListener::new(HEALTH_CHECK, addr(config.health_check_port), router)
                    .serve(aux_stop.clone(), drain),
            )
        });
        let mut debug_task: Option<ListenerTask> = debug.map(|router| {
            tokio::spawn(
                HttpListener::new(DEBUG, addr(config.debug_port), router)
                    .serve(aux_stop.clone(), drain),
            )
        });

        let mut errors = Vec::new();
        let canceled = tokio::select! {
            _ = ctx.cancelled() => true,
            err = finished(&mut api_task, API) => { errors.extend(err); false }
            err = finished(&mut health_task, HEALTH_CHECK) => { errors.extend(err); false }
            err = finished(&mut debug_task, DEBUG) => { errors.extend(err); false }
        };

        if canceled {
            info!("Shutdown requested, stopping listeners");
        } else {
            warn!("A listener stopped, shutting down the others");
        }

        aux_stop.cancel();
        let probe_wait = config.probe_wait_time;
        let api_running = api_task.is_some();
        let (_, health_err, debug_err) = tokio::join!(
            async {
                if api_running {
                    info!(delay = ?probe_wait, "Waiting before stopping API listener");
                    tokio::time::sleep(probe_wait).await;
                }
                api_stop.cancel();
            },
            collect(&mut health_task, HEALTH_CHECK),
            collect(&mut debug_task, DEBUG),
        );
        let api_err = collect(&mut api_task, API).await;

        errors.extend(api_err);
        errors.extend(health_err);
        errors.extend(debug_err);
        if canceled {
            errors.push(ServerError::Canceled);
        }
        errors
    }
}

/// Wait for the task in `slot` and clear it. Never resolves for an empty
/// slot, so a disabled listener never wins the race.
async fn finished(slot: &mut Option<ListenerTask>, listener: &'static str) -> Option<ServerError> {
    if slot.is_none() {
        return pending().await;
    }
    collect(slot, listener).await
}

/// Wait for the task in `slot` and clear it. An empty slot has already
/// stopped.
async fn collect(slot: &mut Option<ListenerTask>, listener: &'static str) -> Option<ServerError> {
    let Some(task) = slot.as_mut() else {
        return None;
    };
    let result = task.await;
    *slot = None;

    match result {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            warn!(listener, error = %e, "Listener failed");
            Some(e)
        }
        Err(_) => Some(ServerError::Panicked { listener }),
    }
}
