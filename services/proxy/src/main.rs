use anyhow::{Context, Result};
use authz_sidecar_proxy::{ProxyDaemon, SidecarConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = SidecarConfig::from_env().context("Failed to load configuration")?;

    init_tracing(&config.log_level);

    info!("authz-sidecar-proxy starting");
    info!(
        scheme = ?config.proxy.scheme,
        origin = %config.proxy.origin_authority(),
        listen = %config.listen_addr(),
        domain = %config.authorization.domain,
        "Configuration loaded"
    );

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e);
    }

    let daemon = ProxyDaemon::new(config).context("Failed to create proxy daemon")?;

    let ctx = CancellationToken::new();
    let mut errors = daemon.start(ctx.clone());

    let reported = tokio::select! {
        reported = errors.recv() => reported,
        _ = shutdown_signal() => {
            ctx.cancel();
            errors.recv().await
        }
    };

    let failures: Vec<_> = reported
        .unwrap_or_default()
        .into_iter()
        .filter(|e| !e.is_cancellation())
        .collect();
    for failure in &failures {
        error!("{}", failure);
    }
    if !failures.is_empty() {
        anyhow::bail!("authz-sidecar-proxy stopped with {} error(s)", failures.len());
    }

    info!("authz-sidecar-proxy stopped");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
