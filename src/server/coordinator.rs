//! Coordinator routes: webhook intake, the worker API, health and stats.

use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use crate::coordinator::{
    CompletionReport, Coordinator, JobId, SyncOutcome, DEFAULT_SYNC_TIMEOUT,
};

use super::error_response;

pub fn router(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/webhook", post(webhook))
        .route("/webhook/sync", post(webhook_sync))
        .route("/api/worker/register", post(register))
        .route("/api/worker/heartbeat", post(heartbeat))
        .route("/api/worker/deregister", post(deregister))
        .route("/api/worker/poll", post(poll))
        .route("/api/worker/complete", post(complete))
        .route("/health", get(health))
        .route("/api/stats", get(stats))
        .with_state(coordinator)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueuedResponse {
    success: bool,
    job_id: JobId,
    pattern: String,
    queue_position: usize,
    available_workers: usize,
    message: &'static str,
}

async fn webhook(State(coordinator): State<Coordinator>, Json(body): Json<Value>) -> Response {
    let receipt = match coordinator.intake_json(body) {
        Ok(receipt) => receipt,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    Json(QueuedResponse {
        success: true,
        job_id: receipt.job_id,
        pattern: receipt.pattern,
        queue_position: receipt.queue_position,
        available_workers: receipt.available_workers,
        message: "Job queued for processing",
    })
    .into_response()
}

#[derive(Debug, Default, Deserialize)]
struct SyncQuery {
    timeout: Option<String>,
}

impl SyncQuery {
    /// Seconds to wait; missing, zero or unparseable values fall back to the
    /// default.
    fn timeout(&self) -> Duration {
        self.timeout
            .as_deref()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_SYNC_TIMEOUT)
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncResponse {
    success: bool,
    job_id: JobId,
    #[serde(skip_serializing_if = "Option::is_none")]
    derived_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    derived_private_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    derived_public_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    address_verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    elapsed_seconds: Option<f64>,
}

impl SyncResponse {
    fn failed(job_id: JobId, error: impl Into<String>, elapsed: Option<Duration>) -> Self {
        Self {
            success: false,
            job_id,
            derived_address: None,
            derived_private_key: None,
            derived_public_key: None,
            tx_hash: None,
            address_verified: None,
            error: Some(error.into()),
            elapsed_seconds: elapsed.map(|e| e.as_secs_f64()),
        }
    }
}

async fn webhook_sync(
    State(coordinator): State<Coordinator>,
    Query(query): Query<SyncQuery>,
    Json(body): Json<Value>,
) -> Response {
    let intake = coordinator.intake_sync_json(body);
    let (receipt, waiter) = match intake {
        Ok(intake) => intake,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };

    let timeout = query.timeout();
    info!(job_id = %receipt.job_id, timeout_secs = timeout.as_secs(), "Waiting for synchronous job");

    let outcome = match tokio::task::spawn_blocking(move || waiter.wait(timeout)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(job_id = %receipt.job_id, error = %e, "Sync wait task failed");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, e);
        }
    };

    let (status, response) = match outcome {
        SyncOutcome::Completed(outcome) => match outcome.result {
            Ok(result) => (
                StatusCode::OK,
                SyncResponse {
                    success: true,
                    job_id: outcome.job_id,
                    derived_address: Some(result.derived_address),
                    derived_private_key: Some(result.derived_private_key),
                    derived_public_key: Some(result.derived_public_key),
                    tx_hash: result.tx_hash,
                    address_verified: result.address_verified,
                    error: None,
                    elapsed_seconds: Some(outcome.elapsed.as_secs_f64()),
                },
            ),
            Err(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                SyncResponse::failed(outcome.job_id, e, Some(outcome.elapsed)),
            ),
        },
        SyncOutcome::TimedOut { job_id, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            SyncResponse::failed(job_id, "Request timeout", None),
        ),
    };
    (status, Json(response)).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkerRequest {
    worker_id: Option<String>,
    url: Option<String>,
}

impl WorkerRequest {
    fn worker_id(&self) -> Option<&str> {
        self.worker_id.as_deref().filter(|id| !id.is_empty())
    }
}

async fn register(
    State(coordinator): State<Coordinator>,
    Json(request): Json<WorkerRequest>,
) -> Response {
    let url = request.url.as_deref().filter(|url| !url.is_empty());
    let (Some(worker_id), Some(url)) = (request.worker_id(), url) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing workerId or url");
    };
    coordinator.register(worker_id, url);
    Json(json!({ "success": true })).into_response()
}

async fn heartbeat(
    State(coordinator): State<Coordinator>,
    Json(request): Json<WorkerRequest>,
) -> Response {
    let Some(worker_id) = request.worker_id() else {
        return error_response(StatusCode::BAD_REQUEST, "Missing workerId");
    };
    let known = coordinator.heartbeat(worker_id);
    Json(json!({ "success": true, "known": known })).into_response()
}

async fn deregister(
    State(coordinator): State<Coordinator>,
    Json(request): Json<WorkerRequest>,
) -> Response {
    let Some(worker_id) = request.worker_id() else {
        return error_response(StatusCode::BAD_REQUEST, "Missing workerId");
    };
    let removed = coordinator.deregister(worker_id);
    Json(json!({ "success": true, "removed": removed })).into_response()
}

async fn poll(
    State(coordinator): State<Coordinator>,
    Json(request): Json<WorkerRequest>,
) -> Response {
    let Some(worker_id) = request.worker_id() else {
        return error_response(StatusCode::BAD_REQUEST, "Missing workerId");
    };
    let job = coordinator.poll(worker_id).map(|mut assignment| {
        // The poller already knows who it is.
        assignment.worker_id = None;
        assignment
    });
    Json(json!({ "job": job })).into_response()
}

async fn complete(
    State(coordinator): State<Coordinator>,
    Json(report): Json<CompletionReport>,
) -> Response {
    coordinator.complete(report);
    Json(json!({ "success": true })).into_response()
}

async fn health() -> Response {
    Json(json!({ "status": "ok", "timestamp": Utc::now() })).into_response()
}

async fn stats(State(coordinator): State<Coordinator>) -> Response {
    Json(coordinator.stats()).into_response()
}
