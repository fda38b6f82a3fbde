//! Push-mode worker routes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tracing::{info, warn};

use crate::coordinator::JobAssignment;
use crate::worker::{InboxError, JobInbox};

use super::error_response;

pub fn router(inbox: JobInbox) -> Router {
    Router::new()
        .route("/job", post(accept_job))
        .route("/health", get(health))
        .with_state(inbox)
}

async fn accept_job(State(inbox): State<JobInbox>, Json(assignment): Json<JobAssignment>) -> Response {
    let job_id = assignment.job_id;
    match inbox.offer(assignment) {
        Ok(()) => {
            info!(%job_id, "Accepted job");
            Json(json!({ "success": true, "message": "Job accepted" })).into_response()
        }
        Err(e) => {
            warn!(%job_id, error = %e, "Refused job");
            let status = match e {
                InboxError::UnknownSlot(_) => StatusCode::NOT_FOUND,
                InboxError::Busy | InboxError::Closed => StatusCode::SERVICE_UNAVAILABLE,
            };
            error_response(status, e)
        }
    }
}

async fn health(State(inbox): State<JobInbox>) -> Response {
    Json(json!({
        "status": "ok",
        "workerId": inbox.worker_id(),
        "slots": inbox.slots(),
    }))
    .into_response()
}
