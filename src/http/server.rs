//! HTTP server construction and lifecycle.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ValidatedConfig;
use crate::error::{FloodgateError, Result};
use crate::limiter::LimiterSet;

use super::handlers;

/// How long a forwarded request to a peer may take end to end.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<LimiterSet>,
    pub config: Arc<ValidatedConfig>,
    /// Client used to proxy requests to the peer owning a key.
    pub forward_client: reqwest::Client,
}

/// Build the application router with all routes and middleware.
pub fn build_router(limiter: Arc<LimiterSet>, config: Arc<ValidatedConfig>) -> Router {
    let state = AppState {
        limiter,
        config,
        forward_client: reqwest::Client::builder()
            .timeout(FORWARD_TIMEOUT)
            .build()
            .expect("failed to build the forwarding http client"),
    };

    Router::new()
        .route("/rate/{key}", get(handlers::rate).post(handlers::rate))
        .route("/rate/{key}/{id}", delete(handlers::release))
        .route("/debug", get(handlers::debug_all))
        .route("/debug/{key}", get(handlers::debug_key))
        .route("/healthz", get(handlers::healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the listening socket. Passing port 0 picks an ephemeral port; the
/// chosen one can be read back from the listener.
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr).await.map_err(FloodgateError::Io)
}

/// Serve until the shutdown signal resolves.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(addr = %addr, "Starting HTTP server");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            FloodgateError::Server(e.to_string())
        })
}
