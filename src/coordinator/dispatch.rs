//! Outbound delivery to push-mode workers and downstream forwarding.
//!
//! Both run on their own threads, after the coordinator has released its
//! state lock, so the implementations here are free to block.

use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value;

use super::job::JobAssignment;
use super::{DispatchError, DownstreamError};

/// Delivers an assignment to a worker's callback endpoint.
pub trait JobDispatcher: Send + Sync {
    fn deliver(&self, endpoint: &str, assignment: &JobAssignment) -> Result<(), DispatchError>;
}

/// Receives the merged payload of every successful job.
pub trait DownstreamSink: Send + Sync {
    fn forward(&self, body: &Value) -> Result<(), DownstreamError>;
}

/// POSTs assignments to `{endpoint}/job`.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

impl JobDispatcher for HttpDispatcher {
    fn deliver(&self, endpoint: &str, assignment: &JobAssignment) -> Result<(), DispatchError> {
        let url = format!("{}/job", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(assignment)
            .send()
            .map_err(|source| DispatchError::Transport {
                endpoint: url.clone(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(DispatchError::Rejected {
                endpoint: url,
                status: response.status().as_u16(),
            })
        }
    }
}

/// POSTs merged results to a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpDownstream {
    url: String,
    client: Client,
}

impl HttpDownstream {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self {
            url: url.into(),
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

impl DownstreamSink for HttpDownstream {
    fn forward(&self, body: &Value) -> Result<(), DownstreamError> {
        let response = self.client.post(&self.url).json(body).send()?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DownstreamError::Status(response.status().as_u16()))
        }
    }
}
