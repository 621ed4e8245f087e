//! HTTP server setup

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::FleetError;
use crate::server::handlers::*;
use crate::server::socket::ws_handler;
use crate::server::state::ServerState;

/// Routes of the control surface
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Instances
        .route("/api/instances", post(create_instance_handler))
        .route("/api/instances/reconcile", post(reconcile_all_handler))
        .route("/api/instances/{id}", get(get_instance_handler).delete(delete_handler))
        .route("/api/instances/{id}/reconcile", post(reconcile_handler))
        .route("/api/instances/{id}/pause", post(pause_handler))
        .route("/api/instances/{id}/resume", post(resume_handler))
        .route("/api/instances/{id}/drain", post(drain_handler))
        .route("/api/instances/{id}/requeue", post(requeue_handler))
        .route("/api/instances/{id}/promote", post(promote_handler))
        .route("/api/instances/{id}/logs", get(logs_handler))
        .route(
            "/api/instances/{id}/secrets/{key}",
            put(put_secret_handler)
                .get(get_secret_handler)
                .delete(delete_secret_handler),
        )
        // Change sets
        .route("/api/change-sets", post(create_change_set_handler))
        .route("/api/change-sets/{id}", get(get_change_set_handler))
        .route("/api/change-sets/{id}/start", post(start_change_set_handler))
        .route("/api/change-sets/{id}/progress", post(progress_change_set_handler))
        .route("/api/change-sets/{id}/rollback", post(rollback_change_set_handler))
        .route("/api/change-sets/{id}/execute", post(execute_change_set_handler))
        // Provisioning progress
        .route("/api/provisioning/ws", get(ws_handler))
        .route("/api/provisioning/{id}/status", get(provisioning_status_handler))
        // State and middleware
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server; returns the bound address and the server task
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, JoinHandle<Result<(), FleetError>>), FleetError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| FleetError::ServerError(e.to_string()))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| FleetError::ServerError(e.to_string()))?;
    info!("Starting HTTP server on {}", local_addr);

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| FleetError::ServerError(e.to_string()))
    });

    Ok((local_addr, handle))
}
