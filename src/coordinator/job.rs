//! Jobs and the wire types that carry them between coordinator and workers.

use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::ValidationError;

/// Unique job identifier.
pub type JobId = Uuid;

/// Minimum number of hex digits a target needs to yield a full template.
const MIN_TARGET_DIGITS: usize = 10;

/// Engine options carried in the request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub contract: Option<String>,
    pub sender: Option<String>,
    pub rpc_url: Option<String>,
    pub chain_id: Option<u64>,
    pub wss: Option<String>,
}

/// The intake request body.
///
/// Known fields are read through accessors; the whole object is kept as-is
/// and forwarded downstream unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct JobPayload {
    raw: Map<String, Value>,
}

impl From<Map<String, Value>> for JobPayload {
    fn from(raw: Map<String, Value>) -> Self {
        Self { raw }
    }
}

impl From<JobPayload> for Map<String, Value> {
    fn from(payload: JobPayload) -> Self {
        payload.raw
    }
}

impl JobPayload {
    /// Builds a payload from a JSON value; only objects are accepted.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        match value {
            Value::Object(raw) => Ok(Self { raw }),
            _ => Err(ValidationError::NotAnObject),
        }
    }

    fn non_empty_str(&self, key: &str) -> Option<&str> {
        self.raw
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// The target value, under `R` or `r`.
    pub fn target(&self) -> Option<&str> {
        self.non_empty_str("R").or_else(|| self.non_empty_str("r"))
    }

    /// Checks the target is present and long enough to extract a template.
    pub fn validated_target(&self) -> Result<&str, ValidationError> {
        let target = self.target().ok_or(ValidationError::MissingTarget)?;
        let digits = crate::crypto::strip_hex_prefix(target);

        if !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ValidationError::MalformedTarget(
                "target must be hexadecimal".into(),
            ));
        }
        if digits.len() < MIN_TARGET_DIGITS {
            return Err(ValidationError::MalformedTarget(format!(
                "target must have at least {} hex digits",
                MIN_TARGET_DIGITS
            )));
        }
        Ok(target)
    }

    pub fn options(&self) -> SearchOptions {
        let chain_id = match self.raw.get("chain_id") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.trim().parse().ok(),
            _ => None,
        };

        SearchOptions {
            contract: self.non_empty_str("contract").map(str::to_owned),
            sender: self.non_empty_str("s").map(str::to_owned),
            rpc_url: self.non_empty_str("rpc_url").map(str::to_owned),
            chain_id,
            wss: self.non_empty_str("wss").map(str::to_owned),
        }
    }

    /// The original body with the result's fields laid over it.
    pub fn merged_with(&self, result: &JobResult) -> Value {
        let mut merged = self.raw.clone();
        if let Ok(Value::Object(fields)) = serde_json::to_value(result) {
            merged.extend(fields);
        }
        Value::Object(merged)
    }
}

/// Derived key material reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub derived_private_key: String,
    pub derived_public_key: String,
    pub derived_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_verified: Option<bool>,
}

/// A job as sent to a worker, by push or in a poll response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAssignment {
    pub job_id: JobId,
    pub pattern: String,
    pub webhook_data: JobPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

/// A worker's completion report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionReport {
    pub worker_id: String,
    pub job_id: JobId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionReport {
    pub fn succeeded(worker_id: impl Into<String>, job_id: JobId, result: JobResult) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(worker_id: impl Into<String>, job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            job_id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Collapses the report into a result. A success flag without a result
    /// counts as a failure.
    pub fn into_result(self) -> Result<JobResult, String> {
        match (self.success, self.result) {
            (true, Some(result)) => Ok(result),
            (true, None) => Err("worker reported success without a result".into()),
            (false, _) => Err(self.error.unwrap_or_else(|| "Unknown error".into())),
        }
    }
}

/// Terminal outcome of a job, delivered to a synchronous waiter.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub worker_id: String,
    pub result: Result<JobResult, String>,
    pub elapsed: Duration,
}

/// Returned to the caller of an intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntakeReceipt {
    pub job_id: JobId,
    pub pattern: String,
    pub queue_position: usize,
    pub available_workers: usize,
}

/// Who a job is assigned to, and since when.
#[derive(Debug, Clone)]
pub struct Assignment {
    pub worker_id: String,
    pub dispatched_at: Instant,
    /// Increases with every hand-out, across all jobs.
    pub attempt: u64,
}

/// A job held by the coordinator.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub pattern: String,
    pub payload: JobPayload,
    pub created_at: Instant,
    pub assignment: Option<Assignment>,
    resolver: Option<Sender<JobOutcome>>,
}

impl Job {
    pub fn new(pattern: String, payload: JobPayload, resolver: Option<Sender<JobOutcome>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            pattern,
            payload,
            created_at: Instant::now(),
            assignment: None,
            resolver,
        }
    }

    pub fn assignment_for(&self, worker_id: &str) -> JobAssignment {
        JobAssignment {
            job_id: self.id,
            pattern: self.pattern.clone(),
            webhook_data: self.payload.clone(),
            worker_id: Some(worker_id.to_owned()),
        }
    }

    pub fn assigned_worker(&self) -> Option<&str> {
        self.assignment.as_ref().map(|a| a.worker_id.as_str())
    }

    /// True if this job is still held under the given hand-out.
    pub fn is_assigned(&self, worker_id: &str, attempt: u64) -> bool {
        self.assignment
            .as_ref()
            .is_some_and(|a| a.worker_id == worker_id && a.attempt == attempt)
    }

    /// Takes the resolver; a second call returns `None`.
    pub fn take_resolver(&mut self) -> Option<Sender<JobOutcome>> {
        self.resolver.take()
    }
}
