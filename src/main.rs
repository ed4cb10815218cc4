// src/main.rs
use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use xbytes_proxy::{
    config::{self, Config},
    metrics::{start_metrics_server, MetricsRegistry},
    proxy::Proxy,
    server::ServerBuilder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("xbytes_proxy=debug".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration; defaults reproduce the fixed ports
    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from: {}", path);
            config::load_config(&path).await?
        }
        None => {
            info!("No configuration file given, using defaults");
            Config::default()
        }
    };

    // Initialize metrics
    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();

    let proxy = Arc::new(Proxy::from_config(&config, metrics));

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(
            metrics_addr,
            metrics_registry,
            proxy.stats().clone(),
            &config.metrics,
        )
        .await?;
    }

    info!(
        "Starting proxy on {} forwarding to {}",
        config.listen, config.upstream
    );

    let server = ServerBuilder::new(config.listen)
        .with_proxy(proxy.clone())
        .serve();

    tokio::select! {
        result = server => {
            if let Err(e) = &result {
                error!("Server error: {:#}", e);
            }
            result?;
        }
        _ = shutdown_signal() => {
            let closed = proxy.pool().close_idle().await;
            info!("Closed {} idle backends", closed);
        }
    }

    Ok(())
}

// Shutdown on Ctrl+C / SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
