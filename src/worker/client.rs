//! Worker side of the coordinator API.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::coordinator::{CompletionReport, Coordinator, JobAssignment};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Coordinator error ({status}) at {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
}

/// Calls a worker makes on the coordinator.
pub trait CoordinatorApi: Send + Sync {
    /// Registers a push-mode worker reachable at `url`.
    fn register(&self, worker_id: &str, url: &str) -> Result<(), ClientError>;

    /// Returns whether the coordinator still knows the worker.
    fn heartbeat(&self, worker_id: &str) -> Result<bool, ClientError>;

    fn deregister(&self, worker_id: &str) -> Result<(), ClientError>;

    fn poll(&self, worker_id: &str) -> Result<Option<JobAssignment>, ClientError>;

    fn complete(&self, report: &CompletionReport) -> Result<(), ClientError>;
}

#[derive(Debug, Deserialize)]
struct HeartbeatResponse {
    #[serde(default = "known_by_default")]
    known: bool,
}

fn known_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct PollResponse {
    job: Option<JobAssignment>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    worker_id: &'a str,
    url: &'a str,
}

/// Blocking HTTP client for the coordinator's worker routes.
#[derive(Debug, Clone)]
pub struct HttpCoordinatorClient {
    client: Client,
    base_url: String,
}

impl HttpCoordinatorClient {
    /// Builds a blocking client. Must not be called from inside an async
    /// runtime.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let base_url: String = base_url.into();
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let transport = |source| ClientError::Transport {
            url: url.clone(),
            source,
        };

        let response = self.client.post(&url).json(body).send().map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ClientError::Status {
                url: url.clone(),
                status: status.as_u16(),
                body,
            });
        }
        response.json().map_err(transport)
    }
}

impl CoordinatorApi for HttpCoordinatorClient {
    fn register(&self, worker_id: &str, url: &str) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/api/worker/register", &RegisterRequest { worker_id, url })
            .map(|_| ())
    }

    fn heartbeat(&self, worker_id: &str) -> Result<bool, ClientError> {
        let response: HeartbeatResponse =
            self.post("/api/worker/heartbeat", &json!({ "workerId": worker_id }))?;
        Ok(response.known)
    }

    fn deregister(&self, worker_id: &str) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/api/worker/deregister", &json!({ "workerId": worker_id }))
            .map(|_| ())
    }

    fn poll(&self, worker_id: &str) -> Result<Option<JobAssignment>, ClientError> {
        let response: PollResponse =
            self.post("/api/worker/poll", &json!({ "workerId": worker_id }))?;
        Ok(response.job)
    }

    fn complete(&self, report: &CompletionReport) -> Result<(), ClientError> {
        self.post::<_, serde_json::Value>("/api/worker/complete", report)
            .map(|_| ())
    }
}

/// In-process wiring: a worker talking to a coordinator in the same binary.
impl CoordinatorApi for Coordinator {
    fn register(&self, worker_id: &str, url: &str) -> Result<(), ClientError> {
        Coordinator::register(self, worker_id, url);
        Ok(())
    }

    fn heartbeat(&self, worker_id: &str) -> Result<bool, ClientError> {
        Ok(Coordinator::heartbeat(self, worker_id))
    }

    fn deregister(&self, worker_id: &str) -> Result<(), ClientError> {
        Coordinator::deregister(self, worker_id);
        Ok(())
    }

    fn poll(&self, worker_id: &str) -> Result<Option<JobAssignment>, ClientError> {
        Ok(Coordinator::poll(self, worker_id))
    }

    fn complete(&self, report: &CompletionReport) -> Result<(), ClientError> {
        Coordinator::complete(self, report.clone());
        Ok(())
    }
}
