use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use floodgate::config::{FileConfig, ServiceConfig};
use floodgate::http;
use floodgate::limiter::LimiterSet;
use floodgate::monitor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command-line arguments (with environment fallbacks)
    let config = ServiceConfig::parse();

    init_tracing(&config);

    info!("Starting Floodgate rate limiting service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        port = config.port,
        max_requests = config.max_requests,
        max_requests_in_queue = config.max_requests_in_queue,
        window_millis = config.window_millis,
        requests_can_set_rate = config.requests_can_set_rate,
        requests_can_mod_queue = config.requests_can_mod_queue,
        shards = config.shards,
        config_file = config.config_file.as_deref().unwrap_or(""),
        "Configuration loaded"
    );

    let validated = Arc::new(config.validate()?);
    if validated.distributed() {
        info!(peers = validated.peers.len(), "Service is starting in distributed mode");
    } else {
        info!("Service is starting in single instance mode");
    }

    // Load key-specific limits and watch the file for changes.
    let (init_file_config, file_config_rx) = match &validated.service.config_file {
        Some(path) => {
            let (init, rx) =
                monitor::spawn_file_monitor(path.into(), monitor::DEFAULT_POLL_INTERVAL)?;
            info!(path = %path, rules = init.keys.len(), "Config file read successfully");
            (init, rx)
        }
        None => {
            warn!("No config file provided, no key-specific rate limits will be used (unless clients set them)");
            let (_tx, rx) = mpsc::channel(1);
            (FileConfig::default(), rx)
        }
    };

    info!("Starting limiter manager set");
    let limiter = Arc::new(LimiterSet::new(
        validated.service.limiter_config(),
        init_file_config,
        file_config_rx,
        validated.service.shards,
    ));

    let router = http::build_router(Arc::clone(&limiter), Arc::clone(&validated));
    let listener = http::bind(validated.service.port).await?;
    info!(port = listener.local_addr()?.port(), "Bound listening socket");

    http::serve(listener, router, shutdown_signal()).await?;

    limiter.close().await;
    info!("Floodgate rate limiting service stopped");
    Ok(())
}

fn init_tracing(config: &ServiceConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
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
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
