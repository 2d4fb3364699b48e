//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::errors::StagerError;
use crate::server::handlers::{health_handler, staging_complete_handler, staging_stop_handler};
use crate::server::state::ServerState;

/// Server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address on which to listen for staging task completion callbacks
    pub listen_addr: String,

    /// Upper bound on concurrently processed completion callbacks
    pub max_concurrent_callbacks: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8888".to_string(),
            max_concurrent_callbacks: 32,
        }
    }
}

pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route(
            "/v1/staging/:staging_guid/completed",
            post(staging_complete_handler),
        )
        .route("/v1/staging/:staging_guid", delete(staging_stop_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), StagerError>>, StagerError> {
    let app = router(state);

    info!("Starting HTTP server on {}", options.listen_addr);

    let listener = TcpListener::bind(&options.listen_addr)
        .await
        .map_err(|e| StagerError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| StagerError::ServerError(e.to_string()))
    });

    Ok(handle)
}
