//! Tamper Proxy - Entry Point
//!
//! Starts the intercepting proxy with graceful shutdown support.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tamper::config::{Config, LogConfig};
use tamper::error::{Result, TamperError};
use tamper::proxy::ProxyServer;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    init_tracing(&config.log);
    info!("Starting Tamper proxy");

    let addr: SocketAddr = config
        .proxy_addr()
        .parse()
        .map_err(|e| TamperError::InvalidConfig(format!("invalid proxy address {}: {}", config.proxy_addr(), e)))?;

    if let Some(egress) = &config.proxy.egress_proxy {
        info!(
            protocol = ?egress.protocol,
            "Dialing origins through egress proxy {}:{}",
            egress.host,
            egress.port
        );
    }

    let server = Arc::new(ProxyServer::from_config(&config.proxy)?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let proxy_task = tokio::spawn(async move {
        if let Err(e) = server.run(addr, shutdown_rx).await {
            error!("Proxy server error: {}", e);
        }
    });

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = proxy_task.await;

    info!("Tamper proxy stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tamper={}", log.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
