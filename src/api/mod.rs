mod errors;
pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::engine::WorkflowMonitor;

/// Shared application state accessible by all handlers.
pub struct AppState {
    pub monitor: Arc<WorkflowMonitor>,
    /// Cap applied to listings that do not ask for one.
    pub max_to_display: usize,
}

impl AppState {
    pub fn new(monitor: Arc<WorkflowMonitor>) -> Self {
        let max_to_display = monitor.config().max_to_display;
        Self {
            monitor,
            max_to_display,
        }
    }
}

/// Routes of the monitor API, without the HTTP layers.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/instances", get(handlers::list_instances))
        .route("/instances/{id}/state", get(handlers::get_state))
        .route("/instances/{id}/status", get(handlers::get_status))
        .route(
            "/instances/{id}/branches/{branch}/history",
            get(handlers::get_history),
        )
        .route("/instances/{id}/terminate", post(handlers::terminate))
        .route("/instances/{id}/interrupt", post(handlers::interrupt))
        .route(
            "/instances/{id}/force-terminate",
            post(handlers::force_terminate),
        )
        .route("/instances/{id}/stop", post(handlers::stop))
        .route("/statuses", post(handlers::batch_status))
        .route("/plan", get(handlers::explain))
        .route("/shutdown", get(handlers::shutdown_list))
        .route("/usage", get(handlers::usage))
        .route("/movable", get(handlers::movable))
        .route("/health", get(handlers::health))
        .with_state(state)
}

/// Start the REST API server.
pub async fn serve(host: &str, port: u16, monitor: Arc<WorkflowMonitor>) -> Result<()> {
    let state = Arc::new(AppState::new(monitor));

    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    info!("FlowWatch API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
