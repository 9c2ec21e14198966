//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::DirectorError;
use crate::server::handlers::{
    deployment_containers_handler, health_handler, node_changed_handler, node_deployments_handler,
    node_info_handler, nodes_handler, version_handler,
};
use crate::server::state::ServerState;

/// Routes of the status API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Nodes
        .route("/nodes", get(nodes_handler))
        .route("/nodes/{id}/deployments", get(node_deployments_handler))
        .route("/nodes/{id}/changed", post(node_changed_handler))
        .route("/nodes/{id}/info", post(node_info_handler))
        // Deployments
        .route("/deployments/{id}/containers", get(deployment_containers_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), DirectorError>>, DirectorError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| DirectorError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| DirectorError::ServerError(e.to_string()))
    });

    Ok(handle)
}
