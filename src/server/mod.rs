//! HTTP surfaces for the coordinator and the push-mode worker.

pub mod coordinator;
pub mod worker;

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub use coordinator::router as coordinator_router;
pub use worker::router as worker_router;

/// Binds `addr` and serves `router` until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, "Listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

/// `{"success": false, "error": ...}` with the given status.
pub(crate) fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}
