//! Coordinator error types.

/// Request rejected before it reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: R or r")]
    MissingTarget,

    #[error("Malformed target: {0}")]
    MalformedTarget(String),

    #[error("Request body must be a JSON object")]
    NotAnObject,
}

/// Outbound delivery of a job to a push-mode worker failed.
///
/// Recovered by requeueing the job at the head of the queue.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Worker at {endpoint} refused job with status {status}")]
    Rejected { endpoint: String, status: u16 },
}

/// Forwarding a successful result downstream failed. Logged only.
#[derive(Debug, thiserror::Error)]
pub enum DownstreamError {
    #[error("Downstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Downstream returned status {0}")]
    Status(u16),
}
