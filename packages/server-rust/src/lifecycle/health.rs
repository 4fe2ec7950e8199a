//! Health, liveness and readiness endpoints.

use std::net::SocketAddr;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::LifecycleStatus;

/// Detailed status as JSON. Always 200; `state` tells the caller whether the
/// router is actually serving.
pub async fn health_handler(State(status): State<LifecycleStatus>) -> Json<serde_json::Value> {
    Json(json!({
        "state": status.state().as_str(),
        "generation": status.generation(),
        "transport_connected": status.transport_connected(),
        "in_flight": status.in_flight(),
        "uptime_secs": status.uptime().as_secs(),
    }))
}

/// Liveness probe: the process answers.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe: 200 while serving with a connected transport, 503
/// during startup, shutdown and after a lost connection.
pub async fn readiness_handler(State(status): State<LifecycleStatus>) -> StatusCode {
    if status.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Routes `/health`, `/health/live` and `/health/ready`.
pub fn health_router(status: LifecycleStatus) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .with_state(status)
}

/// Binds `addr` and serves the health routes until `cancel` fires.
///
/// # Errors
///
/// Returns the bind error if the address is unavailable.
pub async fn serve_health(
    addr: SocketAddr,
    status: LifecycleStatus,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "health server listening");
    let router = health_router(status);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            error!(error = %e, "health server failed");
        }
    }))
}
