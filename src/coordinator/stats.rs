//! Counters and the bounded history of finished jobs.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::JobId;
use super::registry::WorkerSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveStatus {
    Success,
    Error,
}

/// One finished job, as shown in the recent history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivedJob {
    pub timestamp: DateTime<Utc>,
    pub job_id: JobId,
    pub worker_id: String,
    pub pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed: f64,
    pub status: ArchiveStatus,
}

/// Counters plus the most-recent-first history.
#[derive(Debug)]
pub struct JobStats {
    pub total_requests: u64,
    pub rejected_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub jobs_created: u64,
    capacity: usize,
    recent: VecDeque<ArchivedJob>,
}

impl JobStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            total_requests: 0,
            rejected_count: 0,
            success_count: 0,
            error_count: 0,
            jobs_created: 0,
            capacity,
            recent: VecDeque::with_capacity(capacity),
        }
    }

    /// Records a finished job, dropping the oldest entry beyond capacity.
    pub fn archive(&mut self, entry: ArchivedJob) {
        match entry.status {
            ArchiveStatus::Success => self.success_count += 1,
            ArchiveStatus::Error => self.error_count += 1,
        }
        self.recent.push_front(entry);
        self.recent.truncate(self.capacity);
    }

    pub fn is_archived(&self, job_id: JobId) -> bool {
        self.recent.iter().any(|entry| entry.job_id == job_id)
    }

    pub fn recent(&self) -> impl Iterator<Item = &ArchivedJob> {
        self.recent.iter()
    }
}

/// Aggregate view returned by the stats endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub workers: Vec<WorkerSnapshot>,
    pub worker_count: usize,
    pub active_workers: usize,
    pub idle_workers: usize,
    pub queue_length: usize,
    pub active_jobs: usize,
    pub total_requests: u64,
    pub rejected_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub jobs_created: u64,
    pub recent_requests: Vec<ArchivedJob>,
    pub uptime: f64,
}
